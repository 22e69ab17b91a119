//! Adaptive choice between clustered and flat rendering
//!
//! The planner is a feedback controller: every viewport change and every performance
//! sample re-evaluates the mode and item cap from the latest rolling FPS, trading
//! rendering fidelity for frame-rate stability.

use crate::source::CapPolicy;
use crate::{MapError, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct PlannerConfig {
    /// Below this zoom the map always clusters
    pub individual_points_zoom_threshold: f64,
    /// Below this FPS the map clusters regardless of zoom
    pub low_fps_threshold: f64,
    /// FPS under which the smallest cap applies
    pub low_cap_fps: f64,
    /// FPS under which the medium cap applies
    pub medium_cap_fps: f64,
    pub low_cap: usize,
    pub medium_cap: usize,
    pub high_cap: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            individual_points_zoom_threshold: 14.0,
            low_fps_threshold: 20.0,
            low_cap_fps: 30.0,
            medium_cap_fps: 45.0,
            low_cap: 100,
            medium_cap: 200,
            high_cap: 500,
        }
    }
}

impl PlannerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.low_cap_fps < self.medium_cap_fps) {
            return Err(MapError::InvalidConfig(format!(
                "cap FPS tiers must increase: {} < {}",
                self.low_cap_fps, self.medium_cap_fps
            )));
        }
        if self.low_cap == 0 || self.low_cap > self.medium_cap || self.medium_cap > self.high_cap {
            return Err(MapError::InvalidConfig(format!(
                "item caps must be positive and non-decreasing: {}/{}/{}",
                self.low_cap, self.medium_cap, self.high_cap
            )));
        }
        if !(self.low_fps_threshold >= 0.0 && self.individual_points_zoom_threshold.is_finite()) {
            return Err(MapError::InvalidConfig(
                "invalid planner thresholds".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum RenderMode {
    /// Aggregate nearby points into clusters
    Cluster,
    /// Render capped individual points without clustering
    Flat,
}

/// Outcome of one planner evaluation
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RenderPlan {
    pub mode: RenderMode,
    /// Maximum number of individual points fetched and rendered
    pub cap: usize,
    /// FPS the decision was based on (`None` before the first sample)
    pub fps: Option<f64>,
}

impl RenderPlan {
    pub fn cap_policy(&self) -> CapPolicy {
        CapPolicy {
            limit: self.cap,
            clustering: self.mode == RenderMode::Cluster,
        }
    }
}

/// Chooses the render mode and item cap from zoom and measured FPS
#[derive(Clone, Debug)]
pub struct AdaptiveRenderPlanner {
    config: PlannerConfig,
    current: Option<RenderPlan>,
}

impl AdaptiveRenderPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }

    /// Pure decision for a zoom level and FPS measurement
    pub fn evaluate(&self, zoom: f64, fps: Option<f64>) -> RenderPlan {
        let low_fps = fps.is_some_and(|fps| fps < self.config.low_fps_threshold);
        let mode = if zoom < self.config.individual_points_zoom_threshold || low_fps {
            RenderMode::Cluster
        } else {
            RenderMode::Flat
        };
        let cap = match fps {
            Some(fps) if fps < self.config.low_cap_fps => self.config.low_cap,
            Some(fps) if fps < self.config.medium_cap_fps => self.config.medium_cap,
            _ => self.config.high_cap,
        };
        RenderPlan { mode, cap, fps }
    }

    /// Re-evaluate and remember the plan; returns it with whether mode or cap changed
    pub fn update(&mut self, zoom: f64, fps: Option<f64>) -> (RenderPlan, bool) {
        let plan = self.evaluate(zoom, fps);
        let changed = self
            .current
            .is_none_or(|current| current.mode != plan.mode || current.cap != plan.cap);
        if changed {
            tracing::info!(mode = ?plan.mode, cap = plan.cap, fps = ?plan.fps, zoom, "Render plan changed");
        }
        self.current = Some(plan);
        (plan, changed)
    }

    pub fn current(&self) -> Option<RenderPlan> {
        self.current
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner() -> AdaptiveRenderPlanner {
        AdaptiveRenderPlanner::new(PlannerConfig::default())
    }

    #[test]
    fn test_low_zoom_clusters() {
        let plan = planner().evaluate(10.0, Some(60.0));
        assert_eq!(plan.mode, RenderMode::Cluster);
        assert_eq!(plan.cap, 500);
    }

    #[test]
    fn test_high_zoom_goes_flat() {
        let plan = planner().evaluate(15.0, Some(60.0));
        assert_eq!(plan.mode, RenderMode::Flat);
        assert!(!plan.cap_policy().clustering);
    }

    #[test]
    fn test_low_fps_forces_clustering() {
        let plan = planner().evaluate(18.0, Some(12.0));
        assert_eq!(plan.mode, RenderMode::Cluster);
        assert_eq!(plan.cap, 100);
    }

    #[test]
    fn test_cap_tiers() {
        let planner = planner();
        assert_eq!(planner.evaluate(15.0, Some(25.0)).cap, 100);
        assert_eq!(planner.evaluate(15.0, Some(30.0)).cap, 200);
        assert_eq!(planner.evaluate(15.0, Some(44.9)).cap, 200);
        assert_eq!(planner.evaluate(15.0, Some(45.0)).cap, 500);
        // Unknown FPS assumes a healthy device
        assert_eq!(planner.evaluate(15.0, None).cap, 500);
    }

    #[test]
    fn test_fps_25_caps_at_100() {
        let plan = planner().evaluate(16.0, Some(25.0));
        assert_eq!(plan.mode, RenderMode::Flat);
        assert_eq!(plan.cap_policy().limit, 100);
    }

    #[test]
    fn test_update_reports_changes() {
        let mut planner = planner();
        assert!(planner.update(15.0, Some(60.0)).1);
        assert!(!planner.update(15.5, Some(58.0)).1);
        let (plan, changed) = planner.update(15.5, Some(40.0));
        assert!(changed);
        assert_eq!(plan.cap, 200);
        assert_eq!(planner.current(), Some(plan));
    }

    #[test]
    fn test_config_validation() {
        assert!(PlannerConfig::default().validate().is_ok());
        let bad = PlannerConfig {
            medium_cap: 50,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
