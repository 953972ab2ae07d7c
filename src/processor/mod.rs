//! Bounded-concurrency feed processing.
//!
//! [`ParallelProcessor`] turns a list of [`Source`]s into one
//! [`ProcessingResult`] each:
//!
//! - **Scheduling**: tasks are ordered by a stable priority queue ([`queue`])
//!   and run by `max_concurrency` concurrent workers until the queue is empty
//! - **Classification**: failed fetches become `retry` while the task still has
//!   budget, `failure` afterwards
//! - **Tuning**: [`adaptive`] retunes `max_concurrency` from host load
//! - **Recovery**: [`failover`] retries failed sources out of band
//! - **Planning**: [`planning`] estimates batches and emits advisory reports
//!
//! Retry results are handed back to the caller; they are not re-queued within
//! the same call. Resubmit with `process_task(Task::resume(source, attempt).next_attempt())`.

pub mod adaptive;
pub mod connections;
pub mod failover;
pub mod planning;
pub mod queue;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::feed::{
    build_client, fetch_bytes, parse_feed, FeedItem, FetchError, ProcessingResult,
    ProcessingStatus, ResourceSnapshot, Source, Task, TaskStatus,
};
use adaptive::SystemProbe;
use connections::ConnectionTracker;
use queue::TaskQueue;

/// How long an unknown source id waits before it is worth asking again.
const UNKNOWN_SOURCE_RETRY: Duration = Duration::from_secs(60);

/// Schedules fetch-and-parse work for feed sources.
pub struct ParallelProcessor {
    client: reqwest::Client,
    config: Config,
    max_concurrency: AtomicUsize,
    connections: ConnectionTracker,
    probe: SystemProbe,
    registry: RwLock<HashMap<String, Source>>,
}

impl ParallelProcessor {
    /// Creates a processor with an HTTP client built from `config`.
    ///
    /// Sources listed in the config are registered for
    /// [`Self::process_source_by_id`].
    pub fn new(config: Config) -> Result<Self, FetchError> {
        let client = build_client(&config)?;
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: Config, client: reqwest::Client) -> Self {
        let initial = config.max_concurrency.clamp(1, Config::MAX_CONCURRENCY);
        let registry = config
            .sources
            .iter()
            .map(|s| (s.id.clone(), s.clone()))
            .collect();

        Self {
            client,
            config,
            max_concurrency: AtomicUsize::new(initial),
            connections: ConnectionTracker::new(),
            probe: SystemProbe::new(),
            registry: RwLock::new(registry),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency.load(Ordering::Relaxed)
    }

    /// Sets the worker count for future batches, clamped to `[1, 20]`.
    pub fn set_max_concurrency(&self, value: usize) -> usize {
        let clamped = value.clamp(1, Config::MAX_CONCURRENCY);
        self.max_concurrency.store(clamped, Ordering::Relaxed);
        clamped
    }

    pub fn connections(&self) -> &ConnectionTracker {
        &self.connections
    }

    pub(crate) fn probe(&self) -> &SystemProbe {
        &self.probe
    }

    /// Makes sources available to [`Self::process_source_by_id`].
    pub fn register_sources<'a>(&self, sources: impl IntoIterator<Item = &'a Source>) {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        for source in sources {
            registry.insert(source.id.clone(), source.clone());
        }
    }

    pub fn source_by_id(&self, id: &str) -> Option<Source> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Fetches and parses every source, at most `max_concurrency` at a time.
    ///
    /// # Returns
    ///
    /// Exactly one [`ProcessingResult`] per input source, in completion order.
    /// Per-source failures are reported through `status`; nothing here errors.
    pub async fn process_parallel_feeds(&self, sources: &[Source]) -> Vec<ProcessingResult> {
        self.process_parallel_feeds_with_cancel(sources, &CancellationToken::new())
            .await
    }

    /// Like [`Self::process_parallel_feeds`], stopping early when `cancel` fires.
    ///
    /// In-flight fetches are aborted and tasks that have not started are not
    /// fetched; both are reported as `failure` so every source still gets a result.
    pub async fn process_parallel_feeds_with_cancel(
        &self,
        sources: &[Source],
        cancel: &CancellationToken,
    ) -> Vec<ProcessingResult> {
        if sources.is_empty() {
            return Vec::new();
        }

        self.register_sources(sources);

        // Worker count is fixed for the whole call; later tuning affects the next call
        let workers = self.max_concurrency().min(sources.len());
        let mut queue: TaskQueue = sources
            .iter()
            .cloned()
            .map(|s| Task::new(s).with_max_retries(self.config.max_retries))
            .collect();

        tracing::info!(
            sources = sources.len(),
            workers = workers,
            "Processing feeds"
        );

        let results: Vec<ProcessingResult> = stream::iter(queue.drain_ordered())
            .map(|task| self.run_task(task, cancel))
            .buffer_unordered(workers)
            .collect()
            .await;

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        tracing::info!(
            total = results.len(),
            succeeded = succeeded,
            failed = results.len() - succeeded,
            "Feed processing complete"
        );

        results
    }

    /// Runs a single task outside any batch.
    pub async fn process_task(&self, task: Task) -> ProcessingResult {
        self.run_task(task, &CancellationToken::new()).await
    }

    /// Processes the registered source with the given id.
    ///
    /// An unknown id yields an immediate `failure` with no items and a
    /// suggestion to try again in one minute.
    pub async fn process_source_by_id(&self, id: &str) -> ProcessingResult {
        match self.source_by_id(id) {
            Some(source) => {
                self.process_task(Task::new(source).with_max_retries(self.config.max_retries))
                    .await
            }
            None => {
                let error = FetchError::UnknownSource(id.to_string());
                tracing::warn!(source = %id, "Source not registered");
                ProcessingResult {
                    source_id: id.to_string(),
                    status: ProcessingStatus::Failure,
                    attempt: 0,
                    items: Vec::new(),
                    processing_time: Duration::ZERO,
                    resources: self.snapshot(None),
                    next_processing: later(Utc::now(), UNKNOWN_SOURCE_RETRY),
                    error: Some(error.to_string()),
                }
            }
        }
    }

    async fn run_task(&self, mut task: Task, cancel: &CancellationToken) -> ProcessingResult {
        let started = Instant::now();
        task.status = TaskStatus::Running;

        let outcome = if cancel.is_cancelled() {
            Err(FetchError::Cancelled)
        } else {
            self.fetch_and_parse(&task.source, cancel).await
        };

        let now = Utc::now();
        let processing_time = started.elapsed();
        let cancelled = matches!(outcome, Err(FetchError::Cancelled));

        let (status, items, next_processing, error) = match outcome {
            Ok(items) => (
                ProcessingStatus::Success,
                items,
                later(now, task.source.refresh_interval()),
                None,
            ),
            Err(e) if e.is_retryable() && task.can_retry() => {
                let delay = retry_backoff(task.retry_count);
                tracing::warn!(
                    feed = %task.source.url,
                    retry = task.retry_count,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "Fetch failed, retry suggested"
                );
                (ProcessingStatus::Retry, Vec::new(), later(now, delay), Some(e))
            }
            Err(e) => {
                tracing::warn!(
                    feed = %task.source.url,
                    retry = task.retry_count,
                    error = %e,
                    "Fetch failed permanently"
                );
                (
                    ProcessingStatus::Failure,
                    Vec::new(),
                    later(now, task.source.refresh_interval()),
                    Some(e),
                )
            }
        };

        task.status = match status {
            ProcessingStatus::Success => TaskStatus::Success,
            ProcessingStatus::Retry => TaskStatus::Retry,
            ProcessingStatus::Failure => TaskStatus::Failure,
        };
        // Cancellation says nothing about source health
        if !cancelled {
            self.connections
                .record_outcome(status == ProcessingStatus::Success);
        }

        let latency = self.connections.average_latency();
        ProcessingResult {
            source_id: task.source.id,
            status,
            attempt: task.retry_count,
            items,
            processing_time,
            resources: self.snapshot(Some(latency)),
            next_processing,
            error: error.map(|e| e.to_string()),
        }
    }

    /// One fetch plus parse. Body-level parse failures yield no items, not an error.
    pub(crate) async fn fetch_and_parse(
        &self,
        source: &Source,
        cancel: &CancellationToken,
    ) -> Result<Vec<FeedItem>, FetchError> {
        let connection = self.connections.open(source);
        let started = Instant::now();

        tracing::debug!(source = %source.id, feed = %source.url, "Fetching feed");
        let bytes = fetch_bytes(
            &self.client,
            &source.url,
            self.config.total_timeout(),
            self.config.max_feed_size_bytes,
            cancel,
        )
        .await?;
        connection.mark_active(started.elapsed());

        match parse_feed(source, &bytes) {
            Ok(parsed) => {
                if parsed.skipped > 0 {
                    tracing::warn!(
                        feed = %source.url,
                        skipped = parsed.skipped,
                        "Malformed feed items skipped"
                    );
                }
                tracing::debug!(source = %source.id, items = parsed.items.len(), "Feed parsed");
                Ok(parsed.items)
            }
            Err(e) => {
                tracing::warn!(feed = %source.url, error = %e, "Feed body could not be parsed");
                Ok(Vec::new())
            }
        }
    }

    fn snapshot(&self, latency: Option<Duration>) -> ResourceSnapshot {
        ResourceSnapshot {
            memory_usage_bytes: self.probe.process_memory(),
            network_latency_ms: latency.map(|d| d.as_millis() as u64).unwrap_or(0),
            concurrent_connections: self.connections.active_count(),
        }
    }
}

/// Suggested wait before retrying a task that has used `retry_count` retries.
pub fn retry_backoff(retry_count: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(retry_count))
}

fn later(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
