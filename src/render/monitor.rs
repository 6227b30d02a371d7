//! Frame rate and memory sampling with throttled alerts

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::core::config::MonitorConfig;

/// One periodic performance sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PerformanceSample {
    /// Frames per second since the previous sample, `None` if no frames were drawn
    pub fps: Option<f32>,
    pub memory_usage_mb: f32,
    /// Average render time of the frames in this sample
    pub render_time_ms: f32,
    /// Milliseconds since the monitor started
    pub timestamp_ms: u64,
}

/// Coarse performance classification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum PerformanceState {
    #[default]
    Optimal,
    Fair,
    Degraded,
}

/// Memory pressure derived from the latest sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum MemoryPressure {
    Low,
    #[default]
    Normal,
    High,
}

/// Adjustment signal emitted after every sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PerformanceSignal {
    pub state: PerformanceState,
    pub pressure: MemoryPressure,
    pub antialias: bool,
}

/// Rolling summary for observers
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub state: PerformanceState,
    pub pressure: MemoryPressure,
    pub average_fps: Option<f32>,
    pub average_render_ms: f32,
    pub latest_memory_mb: f32,
    pub samples: usize,
    pub alerts_suppressed: u32,
}

/// Samples frame rate and memory, classifying the result over a short window
pub struct PerformanceMonitor {
    config: MonitorConfig,
    started: Instant,
    last_sample: Instant,
    frames_since_sample: u32,
    render_ms_since_sample: f32,
    window: VecDeque<PerformanceSample>,
    state: PerformanceState,
    pressure: MemoryPressure,
    last_alert: Option<Instant>,
    alerts_suppressed: u32,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            started: now,
            last_sample: now,
            frames_since_sample: 0,
            render_ms_since_sample: 0.0,
            window: VecDeque::new(),
            state: PerformanceState::Optimal,
            pressure: MemoryPressure::Normal,
            last_alert: None,
            alerts_suppressed: 0,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Call once per presented frame
    pub fn record_frame(&mut self, render_time_ms: f32) {
        self.frames_since_sample += 1;
        self.render_ms_since_sample += render_time_ms.max(0.0);
    }

    /// Close the current sample period and classify
    pub fn sample(&mut self, memory_usage_mb: f32) -> PerformanceSignal {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample).as_secs_f32();
        let frames = self.frames_since_sample;
        let fps = (frames > 0 && elapsed > 0.0).then(|| frames as f32 / elapsed);
        let render_time_ms = if frames > 0 {
            self.render_ms_since_sample / frames as f32
        } else {
            0.0
        };

        let sample = PerformanceSample {
            fps,
            memory_usage_mb,
            render_time_ms,
            timestamp_ms: now.duration_since(self.started).as_millis() as u64,
        };
        log::trace!("Performance sample: {:?}", sample);

        self.window.push_back(sample);
        while self.window.len() > self.config.window_len.max(1) {
            self.window.pop_front();
        }
        self.last_sample = now;
        self.frames_since_sample = 0;
        self.render_ms_since_sample = 0.0;

        let previous = self.state;
        self.state = self.classify();
        self.pressure = self.pressure_for(memory_usage_mb);
        if self.state != previous {
            log::info!("Performance state {:?} -> {:?}", previous, self.state);
        }
        if self.state == PerformanceState::Degraded {
            self.alert(now, &sample);
        }

        self.signal()
    }

    /// Average fps over the window, ignoring samples without frames
    pub fn average_fps(&self) -> Option<f32> {
        let (sum, count) = self
            .window
            .iter()
            .filter_map(|s| s.fps)
            .fold((0.0, 0u32), |(sum, n), fps| (sum + fps, n + 1));
        (count > 0).then(|| sum / count as f32)
    }

    fn classify(&self) -> PerformanceState {
        let Some(latest) = self.window.back() else {
            return PerformanceState::Optimal;
        };
        let memory = latest.memory_usage_mb;
        let fps = self.average_fps();
        let cfg = &self.config;

        if fps.is_some_and(|f| f < cfg.degraded_fps) || memory > cfg.degraded_memory_mb {
            PerformanceState::Degraded
        } else if fps.is_none_or(|f| f >= cfg.optimal_fps) && memory < cfg.optimal_memory_mb {
            PerformanceState::Optimal
        } else {
            PerformanceState::Fair
        }
    }

    fn pressure_for(&self, memory_usage_mb: f32) -> MemoryPressure {
        if memory_usage_mb > self.config.high_pressure_mb {
            MemoryPressure::High
        } else if memory_usage_mb < self.config.low_pressure_mb {
            MemoryPressure::Low
        } else {
            MemoryPressure::Normal
        }
    }

    fn alert(&mut self, now: Instant, sample: &PerformanceSample) {
        let interval = self.config.alert_interval();
        if self
            .last_alert
            .is_some_and(|t| now.duration_since(t) < interval)
        {
            self.alerts_suppressed += 1;
            return;
        }
        log::warn!(
            "Preview performance degraded: fps {:?}, memory {:.0} MB ({} alerts suppressed)",
            self.average_fps(),
            sample.memory_usage_mb,
            self.alerts_suppressed
        );
        self.last_alert = Some(now);
        self.alerts_suppressed = 0;
    }

    pub fn signal(&self) -> PerformanceSignal {
        PerformanceSignal {
            state: self.state,
            pressure: self.pressure,
            antialias: self.state != PerformanceState::Degraded,
        }
    }

    pub fn state(&self) -> PerformanceState {
        self.state
    }

    pub fn latest(&self) -> Option<&PerformanceSample> {
        self.window.back()
    }

    pub fn samples(&self) -> impl Iterator<Item = &PerformanceSample> {
        self.window.iter()
    }

    pub fn report(&self) -> PerformanceReport {
        let render: Vec<f32> = self
            .window
            .iter()
            .filter(|s| s.fps.is_some())
            .map(|s| s.render_time_ms)
            .collect();
        let average_render_ms = if render.is_empty() {
            0.0
        } else {
            render.iter().sum::<f32>() / render.len() as f32
        };
        PerformanceReport {
            state: self.state,
            pressure: self.pressure,
            average_fps: self.average_fps(),
            average_render_ms,
            latest_memory_mb: self.latest().map_or(0.0, |s| s.memory_usage_mb),
            samples: self.window.len(),
            alerts_suppressed: self.alerts_suppressed,
        }
    }

    /// Time until the next sample is due
    pub fn until_next_sample(&self) -> Duration {
        self.config
            .sample_interval()
            .saturating_sub(self.last_sample.elapsed())
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run_second(monitor: &mut PerformanceMonitor, frames: u32, memory_mb: f32) -> PerformanceSignal {
        for _ in 0..frames {
            monitor.record_frame(4.0);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        monitor.sample(memory_mb)
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimal_when_fast_and_small() {
        let mut monitor = PerformanceMonitor::new(MonitorConfig::default());
        let signal = run_second(&mut monitor, 60, 100.0).await;
        assert_eq!(signal.state, PerformanceState::Optimal);
        assert_eq!(signal.pressure, MemoryPressure::Low);
        assert!(signal.antialias);

        let sample = monitor.latest().unwrap();
        assert!((sample.fps.unwrap() - 60.0).abs() < 0.01);
        assert!((sample.render_time_ms - 4.0).abs() < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_fps_degrades() {
        let mut monitor = PerformanceMonitor::new(MonitorConfig::default());
        run_second(&mut monitor, 12, 100.0).await;
        let signal = monitor.signal();
        assert_eq!(signal.state, PerformanceState::Degraded);
        assert!(!signal.antialias);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_drives_state_and_pressure() {
        let mut monitor = PerformanceMonitor::new(MonitorConfig::default());
        let signal = run_second(&mut monitor, 60, 800.0).await;
        assert_eq!(signal.state, PerformanceState::Fair);
        assert_eq!(signal.pressure, MemoryPressure::High);

        let signal = run_second(&mut monitor, 60, 2048.0).await;
        assert_eq!(signal.state, PerformanceState::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_headless_classifies_on_memory_only() {
        let mut monitor = PerformanceMonitor::new(MonitorConfig::default());
        let signal = run_second(&mut monitor, 0, 64.0).await;
        assert_eq!(signal.state, PerformanceState::Optimal);
        assert_eq!(monitor.latest().unwrap().fps, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_is_bounded() {
        let mut monitor = PerformanceMonitor::new(MonitorConfig {
            window_len: 3,
            ..Default::default()
        });
        for _ in 0..5 {
            run_second(&mut monitor, 30, 100.0).await;
        }
        assert_eq!(monitor.samples().count(), 3);
        assert_eq!(monitor.latest().unwrap().timestamp_ms, 5_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alerts_are_throttled() {
        let mut monitor = PerformanceMonitor::new(MonitorConfig::default());
        for _ in 0..4 {
            run_second(&mut monitor, 5, 100.0).await;
        }
        // First degraded sample alerts, the next three fall inside the interval
        assert_eq!(monitor.report().alerts_suppressed, 3);

        tokio::time::sleep(Duration::from_secs(10)).await;
        monitor.sample(100.0);
        assert_eq!(monitor.report().alerts_suppressed, 0);
    }
}
