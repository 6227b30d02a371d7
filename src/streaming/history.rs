//! Per-asset load history driving the per-identity circuit breaker

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::core::config::QueueConfig;

/// Attempts and failures recorded for one asset identity
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadHistory {
    pub attempts: u32,
    /// Failures since the last success
    pub failures: u32,
    #[serde(skip)]
    pub last_attempt: Instant,
}

/// Load histories keyed by asset identity
pub struct HistoryTable {
    entries: HashMap<String, LoadHistory>,
    failure_threshold: u32,
    failure_window: Duration,
    breaker_delay: Duration,
    ttl: Duration,
}

impl HistoryTable {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            entries: HashMap::new(),
            failure_threshold: config.failure_threshold,
            failure_window: config.failure_window(),
            breaker_delay: config.breaker_delay(),
            ttl: config.history_ttl(),
        }
    }

    /// Delay to impose on a new attempt, if `id` failed more than the
    /// threshold allows inside the trailing window
    pub fn breaker_delay(&self, id: &str, now: Instant) -> Option<Duration> {
        let history = self.entries.get(id)?;
        let recent = now.duration_since(history.last_attempt) < self.failure_window;
        (history.failures > self.failure_threshold && recent).then_some(self.breaker_delay)
    }

    pub fn record_attempt(&mut self, id: &str, now: Instant) {
        let history = self.entries.entry(id.to_string()).or_insert(LoadHistory {
            attempts: 0,
            failures: 0,
            last_attempt: now,
        });
        history.attempts += 1;
        history.last_attempt = now;
    }

    pub fn record_success(&mut self, id: &str) {
        if let Some(history) = self.entries.get_mut(id) {
            history.failures = 0;
        }
    }

    pub fn record_failure(&mut self, id: &str) {
        if let Some(history) = self.entries.get_mut(id) {
            history.failures += 1;
        }
    }

    pub fn get(&self, id: &str) -> Option<LoadHistory> {
        self.entries.get(id).copied()
    }

    /// Drop histories idle longer than the inactivity window
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries
            .retain(|_, h| now.duration_since(h.last_attempt) < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
