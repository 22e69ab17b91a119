//! Engine-wide configuration
//!
//! Thresholds, caps and timings are defaults, not contracts; every value can be
//! tuned per deployment and is checked by [`EngineConfig::validate`].

use crate::index::ClusterConfig;
use crate::marker::Theme;
use crate::performance::PerformanceConfig;
use crate::planner::PlannerConfig;
use crate::realtime::MergeConfig;
use crate::retry::RetryPolicy;
use crate::source::{CacheConfig, SourceMode};
use crate::viewport::ViewportConfig;
use crate::{ChangeFilter, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Configuration of a [`MapEngine`](crate::MapEngine)
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct EngineConfig {
    /// Full-index or windowed retrieval
    pub mode: SourceMode,
    /// Eligibility filter for the point query and the change feed
    pub filter: ChangeFilter,
    pub cluster: ClusterConfig,
    pub viewport: ViewportConfig,
    pub planner: PlannerConfig,
    pub merge: MergeConfig,
    pub performance: PerformanceConfig,
    pub retry: RetryPolicy,
    pub cache: CacheConfig,
    pub theme: Theme,
}

impl EngineConfig {
    /// Reject inconsistent values before any component is built
    pub fn validate(&self) -> Result<()> {
        self.cluster.validate()?;
        self.viewport.validate()?;
        self.planner.validate()?;
        self.merge.validate()?;
        self.performance.validate()?;
        self.retry.validate()?;
        self.cache.validate()?;
        self.theme.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MapError;
    use std::time::Duration;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cluster.radius, 80.0);
        assert_eq!(config.cluster.min_points, 2);
        assert_eq!(config.planner.low_cap, 100);
        assert_eq!(config.planner.medium_cap, 200);
        assert_eq!(config.planner.high_cap, 500);
        assert_eq!(config.viewport.debounce, Duration::from_millis(200));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.mode, SourceMode::Full);
    }

    #[test]
    fn test_nested_errors_surface() {
        let mut config = EngineConfig::default();
        config.cache.marker_entries = 0;
        assert!(matches!(config.validate(), Err(MapError::InvalidConfig(_))));

        let mut config = EngineConfig::default();
        config.merge.min_rebuild_interval = Duration::from_secs(5);
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.cluster.min_zoom = 12;
        config.cluster.max_zoom = 4;
        assert!(config.validate().is_err());
    }
}
