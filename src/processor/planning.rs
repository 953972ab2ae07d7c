//! Planning and advisory reports. Nothing in here fetches or changes state.

use serde::Serialize;
use std::time::Duration;

use super::ParallelProcessor;
use crate::feed::Source;

/// CPU budget (percent) shared across all batches of a plan.
const CPU_BUDGET_PERCENT: f64 = 80.0;
/// Memory budget (MB) shared across all batches of a plan.
const MEMORY_BUDGET_MB: f64 = 100.0;

const LATENCY_ALERT: Duration = Duration::from_secs(5);
const MEMORY_ALERT_PERCENT: f64 = 80.0;
const ERROR_RATE_ALERT: f64 = 0.10;

// ============================================================================
// Load distribution
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingBatch {
    pub batch_id: usize,
    pub sources: Vec<Source>,
    /// Highest member priority.
    pub priority: i32,
    /// Slowest member estimate; members run concurrently.
    #[serde(serialize_with = "serialize_ms")]
    pub estimated_completion: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceAllocation {
    pub cpu_percent_per_batch: f64,
    pub memory_mb_per_batch: f64,
    pub connections_per_batch: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadDistribution {
    pub batches: Vec<ProcessingBatch>,
    /// Sum of batch estimates, batches running back to back.
    #[serde(serialize_with = "serialize_ms")]
    pub total_estimated_time: Duration,
    pub resource_allocation: ResourceAllocation,
}

// ============================================================================
// Resource optimization
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    High,
    Medium,
    Low,
}

impl Impact {
    fn weight(self) -> u32 {
        match self {
            Impact::High => 3,
            Impact::Medium => 2,
            Impact::Low => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub area: &'static str,
    pub action: &'static str,
    pub impact: Impact,
    pub effort: Effort,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceMetrics {
    pub average_latency_ms: u64,
    pub memory_utilization_percent: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceOptimization {
    pub metrics: ResourceMetrics,
    pub recommendations: Vec<Recommendation>,
    pub priority_score: u32,
}

/// Maps metrics to the fixed catalogue of recommendations.
pub fn recommend(metrics: &ResourceMetrics) -> ResourceOptimization {
    let mut recommendations = Vec::new();

    if metrics.average_latency_ms > LATENCY_ALERT.as_millis() as u64 {
        recommendations.push(Recommendation {
            area: "network",
            action: "Lower request timeouts and deprioritise slow sources",
            impact: Impact::High,
            effort: Effort::Low,
        });
    }
    if metrics.memory_utilization_percent > MEMORY_ALERT_PERCENT {
        recommendations.push(Recommendation {
            area: "memory",
            action: "Parse large feeds as a stream instead of buffering bodies",
            impact: Impact::Medium,
            effort: Effort::Medium,
        });
    }
    if metrics.error_rate > ERROR_RATE_ALERT {
        recommendations.push(Recommendation {
            area: "reliability",
            action: "Apply exponential backoff to failing sources",
            impact: Impact::High,
            effort: Effort::Low,
        });
    }

    let priority_score = recommendations.iter().map(|r| r.impact.weight()).sum();

    ResourceOptimization {
        metrics: metrics.clone(),
        recommendations,
        priority_score,
    }
}

fn serialize_ms<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl ParallelProcessor {
    /// Plans how `sources` would be split into rounds of `max_concurrency`.
    ///
    /// Sources are ordered by descending priority (ties keep input order)
    /// and chunked; shares of the CPU, memory, and connection budgets are
    /// divided evenly between the resulting batches.
    pub fn distribute_processing_load(&self, sources: &[Source]) -> LoadDistribution {
        let max_concurrency = self.max_concurrency();

        let mut ordered: Vec<Source> = sources.to_vec();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        let batches: Vec<ProcessingBatch> = ordered
            .chunks(max_concurrency)
            .enumerate()
            .map(|(batch_id, chunk)| ProcessingBatch {
                batch_id,
                priority: chunk.iter().map(|s| s.priority).max().unwrap_or_default(),
                estimated_completion: chunk
                    .iter()
                    .map(Source::estimated_processing_time)
                    .max()
                    .unwrap_or_default(),
                sources: chunk.to_vec(),
            })
            .collect();

        // An empty plan hands the whole budget to the (absent) single batch
        let shares = batches.len().max(1);

        LoadDistribution {
            total_estimated_time: batches.iter().map(|b| b.estimated_completion).sum(),
            resource_allocation: ResourceAllocation {
                cpu_percent_per_batch: CPU_BUDGET_PERCENT / shares as f64,
                memory_mb_per_batch: MEMORY_BUDGET_MB / shares as f64,
                connections_per_batch: max_concurrency / shares,
            },
            batches,
        }
    }

    /// Advisory report on latency, memory, and error rate. Applies nothing.
    pub fn optimize_resource_allocation(&self) -> ResourceOptimization {
        let metrics = ResourceMetrics {
            average_latency_ms: self.connections().average_latency().as_millis() as u64,
            memory_utilization_percent: self.probe().process_memory_percent(),
            error_rate: self.connections().error_rate(),
        };

        let report = recommend(&metrics);
        tracing::debug!(
            latency_ms = metrics.average_latency_ms,
            memory = metrics.memory_utilization_percent,
            error_rate = metrics.error_rate,
            recommendations = report.recommendations.len(),
            "Resource optimization report"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use pretty_assertions::assert_eq;

    fn source(id: &str, priority: i32) -> Source {
        Source::new(id, format!("https://example.com/{}", id)).with_priority(priority)
    }

    fn processor(max_concurrency: usize) -> ParallelProcessor {
        let config = Config {
            max_concurrency,
            ..Config::default()
        };
        ParallelProcessor::new(config).unwrap()
    }

    #[test]
    fn test_batches_sorted_and_chunked() {
        let processor = processor(5);
        let sources: Vec<Source> = (0..12).map(|i| source(&format!("s{}", i), i)).collect();

        let plan = processor.distribute_processing_load(&sources);
        assert_eq!(plan.batches.len(), 3);
        assert_eq!(plan.batches[0].sources.len(), 5);
        assert_eq!(plan.batches[2].sources.len(), 2);
        assert_eq!(plan.batches[0].priority, 11);
        assert_eq!(plan.batches[1].priority, 6);
        assert_eq!(plan.batches[2].priority, 1);
        assert_eq!(plan.batches[0].sources[0].id, "s11");
    }

    #[test]
    fn test_batch_estimate_is_slowest_member() {
        let processor = processor(5);
        let mut flaky = source("flaky", 1);
        flaky.error_count = 9;
        flaky.success_rate = 0.5;
        let sources = vec![source("ok", 2), flaky];

        let plan = processor.distribute_processing_load(&sources);
        assert_eq!(plan.batches.len(), 1);
        assert_eq!(
            plan.batches[0].estimated_completion,
            Duration::from_millis(8000)
        );
        assert_eq!(plan.total_estimated_time, Duration::from_millis(8000));
    }

    #[test]
    fn test_resource_allocation_split() {
        let processor = processor(10);
        let sources: Vec<Source> = (0..40).map(|i| source(&i.to_string(), 0)).collect();

        let plan = processor.distribute_processing_load(&sources);
        assert_eq!(plan.batches.len(), 4);
        assert_eq!(
            plan.resource_allocation,
            ResourceAllocation {
                cpu_percent_per_batch: 20.0,
                memory_mb_per_batch: 25.0,
                connections_per_batch: 2,
            }
        );
        assert_eq!(plan.total_estimated_time, Duration::from_millis(20_000));
    }

    #[test]
    fn test_empty_plan() {
        let plan = processor(10).distribute_processing_load(&[]);
        assert!(plan.batches.is_empty());
        assert_eq!(plan.total_estimated_time, Duration::ZERO);
        assert_eq!(plan.resource_allocation.cpu_percent_per_batch, 80.0);
        assert_eq!(plan.resource_allocation.connections_per_batch, 10);
    }

    #[test]
    fn test_healthy_metrics_no_recommendations() {
        let report = recommend(&ResourceMetrics {
            average_latency_ms: 200,
            memory_utilization_percent: 40.0,
            error_rate: 0.01,
        });
        assert!(report.recommendations.is_empty());
        assert_eq!(report.priority_score, 0);
    }

    #[test]
    fn test_all_alerts() {
        let report = recommend(&ResourceMetrics {
            average_latency_ms: 6000,
            memory_utilization_percent: 90.0,
            error_rate: 0.5,
        });
        let areas: Vec<_> = report.recommendations.iter().map(|r| r.area).collect();
        assert_eq!(areas, vec!["network", "memory", "reliability"]);
        assert_eq!(report.priority_score, 3 + 2 + 3);
    }

    #[test]
    fn test_thresholds_are_strict() {
        let report = recommend(&ResourceMetrics {
            average_latency_ms: 5000,
            memory_utilization_percent: 80.0,
            error_rate: 0.10,
        });
        assert!(report.recommendations.is_empty());
    }

    #[test]
    fn test_fresh_processor_reports_no_errors() {
        let report = processor(10).optimize_resource_allocation();
        assert_eq!(report.metrics.error_rate, 0.0);
        assert_eq!(report.metrics.average_latency_ms, 0);
    }
}
