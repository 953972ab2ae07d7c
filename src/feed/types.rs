use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Sources
// ============================================================================

/// Wire format of a feed body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    #[default]
    Rss,
    Atom,
    Json,
}

/// A configured feed endpoint.
///
/// `error_count` and `success_rate` are owned by the caller; the processor
/// reads them for load estimation but never writes them back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub format: FeedFormat,
    /// Higher is scheduled first.
    #[serde(default)]
    pub priority: i32,
    /// Seconds until the next regular refresh after a success.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default = "default_success_rate")]
    pub success_rate: f64,
}

fn default_refresh_interval_secs() -> u64 {
    3600
}

fn default_success_rate() -> f64 {
    1.0
}

impl Source {
    /// Base cost of fetching and parsing one source.
    const BASE_ESTIMATE_MS: u64 = 5000;
    /// Penalty for sources that fail often.
    const ERROR_PENALTY_MS: u64 = 2000;
    /// Penalty for sources with a poor success rate.
    const RELIABILITY_PENALTY_MS: u64 = 1000;

    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            format: FeedFormat::default(),
            priority: 0,
            refresh_interval_secs: default_refresh_interval_secs(),
            error_count: 0,
            success_rate: default_success_rate(),
        }
    }

    pub fn with_format(mut self, format: FeedFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// Rough wall-clock estimate for one fetch of this source.
    ///
    /// 5s base, +2s when `error_count > 5`, +1s when `success_rate < 0.8`.
    pub fn estimated_processing_time(&self) -> Duration {
        let mut ms = Self::BASE_ESTIMATE_MS;
        if self.error_count > 5 {
            ms += Self::ERROR_PENALTY_MS;
        }
        if self.success_rate < 0.8 {
            ms += Self::RELIABILITY_PENALTY_MS;
        }
        Duration::from_millis(ms)
    }
}

// ============================================================================
// Tasks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Success,
    Retry,
    Failure,
}

/// One scheduled attempt to fetch and parse a [`Source`].
#[derive(Debug, Clone)]
pub struct Task {
    pub source: Source,
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub status: TaskStatus,
}

impl Task {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    pub fn new(source: Source) -> Self {
        Self::resume(source, 0)
    }

    /// Rebuilds a task that has already used `retry_count` attempts.
    pub fn resume(source: Source, retry_count: u32) -> Self {
        Self {
            priority: source.priority,
            source,
            retry_count,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            created_at: Utc::now(),
            status: TaskStatus::Queued,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// The same task, re-queued with one more retry consumed.
    pub fn next_attempt(mut self) -> Self {
        self.retry_count = self.retry_count.saturating_add(1);
        self.status = TaskStatus::Queued;
        self
    }

    /// Whether a failed attempt still leaves budget for another one.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

// ============================================================================
// Connections
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Active,
    Closed,
}

/// Bookkeeping for one in-flight fetch. Used for snapshots only, never reused.
#[derive(Debug, Clone)]
pub struct Connection {
    pub source_id: String,
    pub url: String,
    pub status: ConnectionStatus,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub response_time: Option<Duration>,
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Success,
    Retry,
    Failure,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub memory_usage_bytes: u64,
    pub network_latency_ms: u64,
    pub concurrent_connections: usize,
}

/// The per-source outcome of running one [`Task`].
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingResult {
    pub source_id: String,
    pub status: ProcessingStatus,
    /// `retry_count` of the task that produced this result.
    pub attempt: u32,
    pub items: Vec<FeedItem>,
    #[serde(with = "duration_ms")]
    pub processing_time: Duration,
    pub resources: ResourceSnapshot,
    pub next_processing: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessingResult {
    pub fn is_success(&self) -> bool {
        self.status == ProcessingStatus::Success
    }
}

/// One normalized entry extracted from a feed body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: String,
    pub title: String,
    pub description: String,
    pub link: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub published_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub source_id: String,
    /// Source markup of the entry, kept for debugging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
