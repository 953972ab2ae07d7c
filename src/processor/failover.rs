use serde::Serialize;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::ParallelProcessor;
use crate::feed::{FeedItem, Source};

/// Outcome of out-of-band recovery for one source.
#[derive(Debug, Clone, Serialize)]
pub struct RetryResult {
    pub source_id: String,
    /// Fetches made, including the successful one.
    pub attempts: u32,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(serialize_with = "serialize_ms")]
    pub recovery_time: Duration,
    pub items: Vec<FeedItem>,
}

fn serialize_ms<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Delay after failed attempt `attempt` (0-based): 1s, 2s, 4s, ...
fn failover_backoff(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt))
}

impl ParallelProcessor {
    /// Best-effort recovery for sources that failed in a batch.
    ///
    /// Sources are retried one at a time, outside the task queue and without
    /// regard to `max_concurrency`. Each gets up to `failover_max_attempts`
    /// fetches with a `2^attempt` second pause between attempts; there is no
    /// pause after the last one.
    pub async fn handle_failover_retry(&self, failed_sources: &[Source]) -> Vec<RetryResult> {
        let max_attempts = self.config().failover_max_attempts.max(1);
        let cancel = CancellationToken::new();
        let mut results = Vec::with_capacity(failed_sources.len());

        for source in failed_sources {
            let started = Instant::now();
            let mut attempts = 0;
            let mut last_error = None;
            let mut items = Vec::new();

            for attempt in 0..max_attempts {
                attempts = attempt + 1;
                match self.fetch_and_parse(source, &cancel).await {
                    Ok(parsed) => {
                        items = parsed;
                        last_error = None;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            feed = %source.url,
                            attempt = attempts,
                            max_attempts = max_attempts,
                            error = %e,
                            "Failover attempt failed"
                        );
                        last_error = Some(e.to_string());
                        if attempts < max_attempts {
                            tokio::time::sleep(failover_backoff(attempt)).await;
                        }
                    }
                }
            }

            let success = last_error.is_none();
            self.connections().record_outcome(success);
            if success {
                tracing::info!(source = %source.id, attempts = attempts, "Source recovered");
            }

            results.push(RetryResult {
                source_id: source.id.clone(),
                attempts,
                success,
                error: last_error,
                recovery_time: started.elapsed(),
                items,
            });
        }

        results
    }
}
