//! Scheduler configuration
//!
//! Every section deserializes with defaults, so a config file only needs the
//! values it overrides:
//!
//! ```
//! use figview::core::config::SchedulerConfig;
//!
//! let config = SchedulerConfig::from_json_str(r#"{ "context": { "initial_max_contexts": 4 } }"#).unwrap();
//! assert_eq!(config.context.initial_max_contexts, 4);
//! assert_eq!(config.queue.max_concurrent_loads, 2);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;

/// Absolute hardware-safe ceiling for simultaneous rendering contexts
pub const HARD_MAX_CONTEXTS: usize = 6;

/// Context admission settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Absolute ceiling, never exceeded by dynamic tuning
    pub hard_max_contexts: usize,
    /// Floor the ceiling may be lowered to under memory pressure
    pub min_contexts: usize,
    /// Ceiling at startup
    pub initial_max_contexts: usize,
    /// Delay between a release and the slot becoming free
    pub release_cooldown_ms: u64,
    /// Trailing window for counting context creations
    pub creation_window_ms: u64,
    /// Creations allowed inside the window before the breaker trips
    pub max_creations_per_window: usize,
    /// Breaker open time after a creation-rate trip
    pub rate_trip_cooldown_ms: u64,
    /// Breaker open time after a reported creation error
    pub error_trip_cooldown_ms: u64,
    /// No creation is allowed this long after a creation error
    pub error_rate_limit_ms: u64,
    /// Bound on waiting admission requests
    pub max_queue_len: usize,
    /// Waiting requests older than this are expired. Kept below the load
    /// timeout so a starved preview reports exhaustion, not a timeout.
    pub queue_timeout_ms: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            hard_max_contexts: HARD_MAX_CONTEXTS,
            min_contexts: 1,
            initial_max_contexts: HARD_MAX_CONTEXTS,
            release_cooldown_ms: 100,
            creation_window_ms: 10_000,
            max_creations_per_window: 5,
            rate_trip_cooldown_ms: 30_000,
            error_trip_cooldown_ms: 5_000,
            error_rate_limit_ms: 5_000,
            max_queue_len: 64,
            queue_timeout_ms: 8_000,
        }
    }
}

impl ContextConfig {
    pub fn release_cooldown(&self) -> Duration {
        Duration::from_millis(self.release_cooldown_ms)
    }

    pub fn creation_window(&self) -> Duration {
        Duration::from_millis(self.creation_window_ms)
    }

    pub fn rate_trip_cooldown(&self) -> Duration {
        Duration::from_millis(self.rate_trip_cooldown_ms)
    }

    pub fn error_trip_cooldown(&self) -> Duration {
        Duration::from_millis(self.error_trip_cooldown_ms)
    }

    pub fn error_rate_limit(&self) -> Duration {
        Duration::from_millis(self.error_rate_limit_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

/// Load queue settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_concurrent_loads: usize,
    pub min_concurrent_loads: usize,
    /// Stabilization delay before draining after a completion
    pub drain_delay_ms: u64,
    /// Failures above this inside the window delay the next attempt
    pub failure_threshold: u32,
    pub failure_window_ms: u64,
    pub breaker_delay_ms: u64,
    /// Load histories idle for longer than this are pruned
    pub history_ttl_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_loads: 2,
            min_concurrent_loads: 1,
            drain_delay_ms: 300,
            failure_threshold: 2,
            failure_window_ms: 10_000,
            breaker_delay_ms: 5_000,
            history_ttl_ms: 300_000,
        }
    }
}

impl QueueConfig {
    pub fn drain_delay(&self) -> Duration {
        Duration::from_millis(self.drain_delay_ms)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }

    pub fn breaker_delay(&self) -> Duration {
        Duration::from_millis(self.breaker_delay_ms)
    }

    pub fn history_ttl(&self) -> Duration {
        Duration::from_millis(self.history_ttl_ms)
    }
}

/// Batch loader settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Items taken from the pending list per tick
    pub max_batch_size: usize,
    /// Items executing at once
    pub max_concurrent: usize,
    pub process_interval_ms: u64,
    /// Automatic retries after the first attempt
    pub retry_attempts: u32,
    /// Priority subtracted on every retry
    pub priority_decay: f32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 4,
            max_concurrent: 2,
            process_interval_ms: 500,
            retry_attempts: 2,
            priority_decay: 0.1,
        }
    }
}

impl BatchConfig {
    pub fn process_interval(&self) -> Duration {
        Duration::from_millis(self.process_interval_ms)
    }
}

/// Resource pool capacities, per resource kind
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_materials: usize,
    pub max_textures: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_materials: 64,
            max_textures: 32,
        }
    }
}

/// Geometry and texture optimization settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizeConfig {
    /// LOD ratios relative to the base triangle count
    pub lod_ratios: Vec<f32>,
    /// Triangle budget for the highest LOD
    pub max_triangles: usize,
    /// Lower bound on the triangle target of any LOD
    pub min_lod_triangles: usize,
    pub texture_max_size: u32,
    pub generate_mipmaps: bool,
    pub anisotropy: u8,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            lod_ratios: vec![1.0, 0.5, 0.25],
            max_triangles: 50_000,
            min_lod_triangles: 100,
            texture_max_size: 1024,
            generate_mipmaps: true,
            anisotropy: 4,
        }
    }
}

/// Performance monitor thresholds
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sample_interval_ms: u64,
    /// Samples kept in the rolling window
    pub window_len: usize,
    pub optimal_fps: f32,
    pub degraded_fps: f32,
    pub optimal_memory_mb: f32,
    pub degraded_memory_mb: f32,
    /// Memory above this lowers capacity
    pub high_pressure_mb: f32,
    /// Memory below this lets capacity recover
    pub low_pressure_mb: f32,
    pub alert_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1_000,
            window_len: 30,
            optimal_fps: 30.0,
            degraded_fps: 20.0,
            optimal_memory_mb: 512.0,
            degraded_memory_mb: 1024.0,
            high_pressure_mb: 768.0,
            low_pressure_mb: 256.0,
            alert_interval_ms: 10_000,
        }
    }
}

impl MonitorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn alert_interval(&self) -> Duration {
        Duration::from_millis(self.alert_interval_ms)
    }
}

/// Full scheduler configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub context: ContextConfig,
    pub queue: QueueConfig,
    pub batch: BatchConfig,
    pub cache: CacheConfig,
    pub optimize: OptimizeConfig,
    pub monitor: MonitorConfig,
    /// Caller-visible load timeout
    pub load_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            context: ContextConfig::default(),
            queue: QueueConfig::default(),
            batch: BatchConfig::default(),
            cache: CacheConfig::default(),
            optimize: OptimizeConfig::default(),
            monitor: MonitorConfig::default(),
            load_timeout_ms: 10_000,
        }
    }
}

impl SchedulerConfig {
    /// Parse and validate a JSON config
    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        let mut config: SchedulerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&json)?;
        log::info!("Loaded scheduler config from {}", path.display());
        Ok(config)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    /// Clamp values into safe ranges. Unusable values are an error.
    pub fn validate(&mut self) -> Result<(), Error> {
        let ctx = &mut self.context;
        if ctx.hard_max_contexts == 0 || ctx.hard_max_contexts > HARD_MAX_CONTEXTS {
            log::warn!(
                "context.hard_max_contexts {} out of range, using {}",
                ctx.hard_max_contexts, HARD_MAX_CONTEXTS
            );
            ctx.hard_max_contexts = HARD_MAX_CONTEXTS;
        }
        let min_clamped = ctx.min_contexts.clamp(1, ctx.hard_max_contexts);
        if min_clamped != ctx.min_contexts {
            log::warn!("context.min_contexts {} clamped to {}", ctx.min_contexts, min_clamped);
            ctx.min_contexts = min_clamped;
        }
        let initial = ctx.initial_max_contexts.clamp(ctx.min_contexts, ctx.hard_max_contexts);
        if initial != ctx.initial_max_contexts {
            log::warn!(
                "context.initial_max_contexts {} clamped to {}",
                ctx.initial_max_contexts, initial
            );
            ctx.initial_max_contexts = initial;
        }

        // Admission expiry plus one batch tick must fit inside the load timeout
        let admission_budget = self
            .load_timeout_ms
            .saturating_sub(self.batch.process_interval_ms)
            .saturating_sub(1);
        if admission_budget == 0 {
            return Err(Error::Config(format!(
                "load_timeout_ms {} must exceed batch.process_interval_ms {}",
                self.load_timeout_ms, self.batch.process_interval_ms
            )));
        }
        if self.context.queue_timeout_ms > admission_budget {
            log::warn!(
                "context.queue_timeout_ms {} clamped to {} to expire before the load timeout",
                self.context.queue_timeout_ms, admission_budget
            );
            self.context.queue_timeout_ms = admission_budget;
        }

        let queue = &mut self.queue;
        let min_loads = queue.min_concurrent_loads.clamp(1, 2);
        let max_loads = queue.max_concurrent_loads.clamp(min_loads, 2);
        if min_loads != queue.min_concurrent_loads || max_loads != queue.max_concurrent_loads {
            log::warn!(
                "queue concurrency [{}, {}] clamped to [{}, {}]",
                queue.min_concurrent_loads, queue.max_concurrent_loads, min_loads, max_loads
            );
            queue.min_concurrent_loads = min_loads;
            queue.max_concurrent_loads = max_loads;
        }

        if self.batch.max_batch_size == 0 {
            log::warn!("batch.max_batch_size 0 raised to 1");
            self.batch.max_batch_size = 1;
        }
        if self.batch.max_concurrent == 0 {
            log::warn!("batch.max_concurrent 0 raised to 1");
            self.batch.max_concurrent = 1;
        }
        if self.batch.priority_decay < 0.0 || !self.batch.priority_decay.is_finite() {
            return Err(Error::Config(format!(
                "batch.priority_decay must be a non-negative number, got {}",
                self.batch.priority_decay
            )));
        }

        let cache = &mut self.cache;
        for (name, value) in [
            ("cache.max_materials", &mut cache.max_materials),
            ("cache.max_textures", &mut cache.max_textures),
        ] {
            if *value == 0 {
                log::warn!("{} 0 raised to 1", name);
                *value = 1;
            }
        }

        let opt = &self.optimize;
        if opt.lod_ratios.is_empty() {
            return Err(Error::Config("optimize.lod_ratios must not be empty".into()));
        }
        if let Some(bad) = opt.lod_ratios.iter().find(|r| !(**r > 0.0 && **r <= 1.0)) {
            return Err(Error::Config(format!(
                "optimize.lod_ratios values must be in (0, 1], got {}",
                bad
            )));
        }

        let mon = &self.monitor;
        if mon.degraded_fps > mon.optimal_fps || mon.optimal_memory_mb > mon.degraded_memory_mb {
            return Err(Error::Config(
                "monitor thresholds must satisfy degraded_fps <= optimal_fps and optimal_memory_mb <= degraded_memory_mb".into(),
            ));
        }
        if mon.low_pressure_mb > mon.high_pressure_mb {
            return Err(Error::Config(
                "monitor.low_pressure_mb must not exceed monitor.high_pressure_mb".into(),
            ));
        }
        if self.monitor.window_len == 0 {
            self.monitor.window_len = 1;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let mut config = SchedulerConfig::default();
        let before = config.clone();
        config.validate().unwrap();
        assert_eq!(config, before);
        assert_eq!(config.context.hard_max_contexts, 6);
        assert_eq!(config.load_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SchedulerConfig::from_json_str(
            r#"{ "batch": { "retry_attempts": 5 }, "load_timeout_ms": 2000 }"#,
        )
        .unwrap();
        assert_eq!(config.batch.retry_attempts, 5);
        assert_eq!(config.batch.max_batch_size, 4);
        assert_eq!(config.load_timeout(), Duration::from_secs(2));
        assert_eq!(config.context, ContextConfig::default());
    }

    #[test]
    fn test_context_ceiling_clamped() {
        let config = SchedulerConfig::from_json_str(
            r#"{ "context": { "hard_max_contexts": 16, "initial_max_contexts": 12, "min_contexts": 0 } }"#,
        )
        .unwrap();
        assert_eq!(config.context.hard_max_contexts, HARD_MAX_CONTEXTS);
        assert_eq!(config.context.initial_max_contexts, HARD_MAX_CONTEXTS);
        assert_eq!(config.context.min_contexts, 1);
    }

    #[test]
    fn test_admission_expires_before_load_timeout() {
        let config = SchedulerConfig::from_json_str(
            r#"{ "context": { "queue_timeout_ms": 10000 }, "load_timeout_ms": 10000 }"#,
        )
        .unwrap();
        assert_eq!(config.context.queue_timeout_ms, 10_000 - 500 - 1);

        let defaults = SchedulerConfig::default();
        assert!(
            defaults.context.queue_timeout_ms + defaults.batch.process_interval_ms
                < defaults.load_timeout_ms
        );

        let err = SchedulerConfig::from_json_str(r#"{ "load_timeout_ms": 400 }"#);
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[test]
    fn test_concurrency_clamped() {
        let config = SchedulerConfig::from_json_str(
            r#"{ "queue": { "max_concurrent_loads": 8, "min_concurrent_loads": 0 } }"#,
        )
        .unwrap();
        assert_eq!(config.queue.min_concurrent_loads, 1);
        assert_eq!(config.queue.max_concurrent_loads, 2);
    }

    #[test]
    fn test_invalid_lod_ratios_rejected() {
        let err = SchedulerConfig::from_json_str(r#"{ "optimize": { "lod_ratios": [] } }"#);
        assert!(matches!(err, Err(Error::Config(_))));

        let err = SchedulerConfig::from_json_str(r#"{ "optimize": { "lod_ratios": [1.0, 1.5] } }"#);
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[test]
    fn test_malformed_json() {
        let err = SchedulerConfig::from_json_str("{ not json");
        assert!(matches!(err, Err(Error::Json(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.json");
        std::fs::write(&path, r#"{ "cache": { "max_textures": 8 } }"#).unwrap();

        let config = SchedulerConfig::load(&path).unwrap();
        assert_eq!(config.cache.max_textures, 8);

        let missing = SchedulerConfig::load(dir.path().join("missing.json"));
        assert!(matches!(missing, Err(Error::Io(_))));
    }
}
