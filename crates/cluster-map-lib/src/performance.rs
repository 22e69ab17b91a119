//! Rolling frame-time measurement

use crate::{MapError, Result};
use std::collections::VecDeque;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct PerformanceConfig {
    /// Number of recent frames in the rolling average
    pub window: usize,
    /// Emit a budget sample every this many frames
    pub sample_every: usize,
    /// Frame times above this are clamped (tab switches, debugger pauses)
    pub max_frame_time: Duration,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            window: 60,
            sample_every: 30,
            max_frame_time: Duration::from_millis(500),
        }
    }
}

impl PerformanceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window == 0 || self.sample_every == 0 {
            return Err(MapError::InvalidConfig(
                "performance window and sample_every must be positive".to_string(),
            ));
        }
        if self.max_frame_time.is_zero() {
            return Err(MapError::InvalidConfig(
                "max_frame_time must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Rolling performance budget derived from recent frames
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PerformanceBudget {
    /// Average frames per second over the window
    pub fps: f64,
    pub mean_frame_time: Duration,
    pub worst_frame_time: Duration,
    /// Frames in the window
    pub frames: usize,
}

/// Measures frame time and exposes a rolling FPS average
#[derive(Clone, Debug)]
pub struct PerformanceMonitor {
    config: PerformanceConfig,
    frames: VecDeque<Duration>,
    total: Duration,
    since_sample: usize,
    recorded: u64,
}

impl PerformanceMonitor {
    pub fn new(config: PerformanceConfig) -> Self {
        Self {
            frames: VecDeque::with_capacity(config.window),
            config,
            total: Duration::ZERO,
            since_sample: 0,
            recorded: 0,
        }
    }

    /// Record one frame; returns a fresh budget sample every `sample_every` frames
    pub fn record_frame(&mut self, frame_time: Duration) -> Option<PerformanceBudget> {
        let frame_time = frame_time.min(self.config.max_frame_time);
        if self.frames.len() == self.config.window
            && let Some(oldest) = self.frames.pop_front()
        {
            self.total -= oldest;
        }
        self.frames.push_back(frame_time);
        self.total += frame_time;
        self.recorded += 1;
        self.since_sample += 1;

        if self.since_sample >= self.config.sample_every {
            self.since_sample = 0;
            let budget = self.budget();
            if let Some(budget) = &budget {
                tracing::debug!(fps = budget.fps, frames = budget.frames, "Performance sample");
            }
            budget
        } else {
            None
        }
    }

    /// Current rolling average, `None` until a frame has been recorded
    pub fn fps(&self) -> Option<f64> {
        if self.frames.is_empty() || self.total.is_zero() {
            return None;
        }
        Some(self.frames.len() as f64 / self.total.as_secs_f64())
    }

    pub fn budget(&self) -> Option<PerformanceBudget> {
        let fps = self.fps()?;
        let worst = self.frames.iter().max().copied().unwrap_or_default();
        Some(PerformanceBudget {
            fps,
            mean_frame_time: self.total / self.frames.len() as u32,
            worst_frame_time: worst,
            frames: self.frames.len(),
        })
    }

    /// Total frames recorded since creation
    pub fn recorded(&self) -> u64 {
        self.recorded
    }

    pub fn reset(&mut self) {
        self.frames.clear();
        self.total = Duration::ZERO;
        self.since_sample = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_fps(fps: f64) -> Duration {
        Duration::from_secs_f64(1.0 / fps)
    }

    #[test]
    fn test_no_frames_no_fps() {
        let monitor = PerformanceMonitor::new(PerformanceConfig::default());
        assert!(monitor.fps().is_none());
        assert!(monitor.budget().is_none());
    }

    #[test]
    fn test_rolling_average() {
        let mut monitor = PerformanceMonitor::new(PerformanceConfig {
            window: 10,
            sample_every: 5,
            ..Default::default()
        });
        for _ in 0..10 {
            monitor.record_frame(at_fps(60.0));
        }
        assert!((monitor.fps().unwrap() - 60.0).abs() < 0.5);

        // The window slides: ten slow frames replace the fast ones completely
        for _ in 0..10 {
            monitor.record_frame(at_fps(25.0));
        }
        assert!((monitor.fps().unwrap() - 25.0).abs() < 0.5);
        assert_eq!(monitor.recorded(), 20);
    }

    #[test]
    fn test_samples_emitted_periodically() {
        let mut monitor = PerformanceMonitor::new(PerformanceConfig {
            window: 10,
            sample_every: 3,
            ..Default::default()
        });
        let samples: Vec<_> = (0..9)
            .map(|_| monitor.record_frame(at_fps(30.0)))
            .collect();
        assert_eq!(samples.iter().filter(|s| s.is_some()).count(), 3);
        assert!(samples[2].is_some());
    }

    #[test]
    fn test_long_frames_clamped() {
        let mut monitor = PerformanceMonitor::new(PerformanceConfig::default());
        monitor.record_frame(Duration::from_secs(10));
        let budget = monitor.budget().unwrap();
        assert_eq!(budget.worst_frame_time, Duration::from_millis(500));
        assert!((budget.fps - 2.0).abs() < 1e-9);
    }
}
