use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::feed::{Connection, ConnectionStatus, Source};

/// Number of recent response times kept for latency averages.
const LATENCY_WINDOW: usize = 100;

/// Tracks in-flight fetches and recent outcomes.
///
/// Each fetch owns exactly one entry for the lifetime of a
/// [`ConnectionGuard`], even when the same source is fetched twice at once.
/// Nothing here is pooled or reused.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    active: Mutex<HashMap<u64, Connection>>,
    next_id: AtomicU64,
    recent_latencies: Mutex<VecDeque<Duration>>,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fetch for `source`; the entry is removed when the guard drops.
    pub fn open(&self, source: &Source) -> ConnectionGuard<'_> {
        let now = Utc::now();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Connection {
                    source_id: source.id.clone(),
                    url: source.url.clone(),
                    status: ConnectionStatus::Connecting,
                    started_at: now,
                    last_activity: now,
                    response_time: None,
                },
            );

        ConnectionGuard { tracker: self, id }
    }

    pub fn active_count(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn snapshot(&self) -> Vec<Connection> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Mean response time of tracked connections that have one.
    ///
    /// Falls back to the recent-latency window when no in-flight connection
    /// has measured a response yet, and to zero when nothing was measured.
    pub fn average_latency(&self) -> Duration {
        let measured: Vec<Duration> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(|c| c.response_time)
            .collect();

        if !measured.is_empty() {
            return mean(&measured);
        }

        let recent = self
            .recent_latencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let recent: Vec<Duration> = recent.iter().copied().collect();
        mean(&recent)
    }

    pub fn record_outcome(&self, success: bool) {
        let counter = if success {
            &self.successes
        } else {
            &self.failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Fraction of finished tasks that did not succeed, 0.0 before any ran.
    pub fn error_rate(&self) -> f64 {
        let successes = self.successes.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        match successes + failures {
            0 => 0.0,
            total => failures as f64 / total as f64,
        }
    }

    fn mark_active(&self, id: u64, response_time: Duration) {
        if let Some(conn) = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&id)
        {
            conn.status = ConnectionStatus::Active;
            conn.last_activity = Utc::now();
            conn.response_time = Some(response_time);
        }

        let mut recent = self
            .recent_latencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if recent.len() == LATENCY_WINDOW {
            recent.pop_front();
        }
        recent.push_back(response_time);
    }

    fn close(&self, id: u64) {
        let removed = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(mut conn) = removed {
            conn.status = ConnectionStatus::Closed;
            tracing::trace!(source = %conn.source_id, url = %conn.url, "Connection closed");
        }
    }
}

fn mean(values: &[Duration]) -> Duration {
    if values.is_empty() {
        return Duration::ZERO;
    }
    values.iter().sum::<Duration>() / values.len() as u32
}

/// Owns one entry in a [`ConnectionTracker`] until dropped.
pub struct ConnectionGuard<'a> {
    tracker: &'a ConnectionTracker,
    id: u64,
}

impl ConnectionGuard<'_> {
    /// Records that the response arrived after `response_time`.
    pub fn mark_active(&self, response_time: Duration) {
        self.tracker.mark_active(self.id, response_time);
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.tracker.close(self.id);
    }
}
