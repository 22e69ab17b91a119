//! Cluster Map Library - Live Clustering Engine for Large Point Sets
//!
//! This library decides, for any camera position and any measured frame rate, exactly
//! which features a map should draw. Tens of thousands of geolocated records are grouped
//! into clusters at low zoom and expanded into individual markers at high zoom, while a
//! live change feed keeps inserting, updating and deleting records.
//!
//! # Architecture
//!
//! - **[`SpatialIndex`]**: Zoom-tiered greedy clustering published as immutable snapshots
//! - **[`DataSource`]**: Full-index or windowed point retrieval for a bounding box
//! - **[`RealtimeMerger`]**: Applies change events and coalesces index rebuilds
//! - **[`ViewportTracker`]**: Filters sub-threshold camera movement and debounces changes
//! - **[`PerformanceMonitor`]**: Rolling frame-time budget
//! - **[`AdaptiveRenderPlanner`]**: Chooses cluster/flat mode and the item cap
//! - **[`MarkerFactory`]**: Pure mapping of a feature and theme to a marker description
//! - **[`MapEngine`]**: Wires everything together behind the map [`Lifecycle`]
//!
//! # Performance Characteristics
//!
//! - **Build Time**: O(N log N) per zoom level, projection parallelized with rayon
//! - **Query Time**: O(log N + K) where K = returned features
//! - **Memory**: O(N × L) for the index (L = zoom levels), bounded LRU caches elsewhere

mod collaborators;
mod config;
mod engine;
mod index;
mod lifecycle;
mod marker;
mod model;
mod performance;
mod planner;
mod quadtree;
mod realtime;
mod retry;
mod source;
pub mod utils;
mod viewport;

// Public API exports
pub use collaborators::{
    ChangeFeed, ChannelFeed, ConnectionState, FeedMessage, InMemoryPointQuery, PointQuery,
    StaticToken, TokenProvider,
};
pub use config::EngineConfig;
pub use engine::{EngineInput, EngineUpdate, MapEngine, RenderFrame};
pub use index::{ClusterConfig, IndexSnapshot, IndexStats, MAX_SUPPORTED_ZOOM, SpatialIndex};
pub use lifecycle::{Lifecycle, LifecycleEvent, LifecycleState};
pub use marker::{
    ClusterTier, DrawnMarker, MarkerArena, MarkerDiff, MarkerFactory, MarkerSpec, Rgba, Theme,
    count_label, describe,
};
pub use model::{
    Attributes, BoundingBox, ChangeEvent, ChangeFilter, ChangeKind, ClusterFeature, ClusterId,
    Feature, FeatureId, LatLon, Point, PointId, Viewport,
};
pub use performance::{PerformanceBudget, PerformanceConfig, PerformanceMonitor};
pub use planner::{AdaptiveRenderPlanner, PlannerConfig, RenderMode, RenderPlan};
pub use realtime::{FeedStatus, MergeConfig, MergeOutcome, PointSet, RealtimeMerger};
pub use retry::{RetryExhausted, RetryPolicy};
pub use source::{
    CacheConfig, CapPolicy, DataSource, FullIndexSource, LoadedWindow, SourceMode, WindowLoader,
    WindowResult, WindowedSource, cluster_window, window_from_snapshot,
};
pub use viewport::{ViewportConfig, ViewportTracker};

/// Error types for the engine
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("Invalid coordinate for point {id}: lat={lat}, lon={lon}")]
    InvalidCoordinate { id: PointId, lat: f64, lon: f64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No access token available")]
    TokenUnavailable,

    #[error("Token provider error: {0}")]
    Token(String),

    #[error("Fetch failed after {attempts} attempt(s): {reason}")]
    Fetch { attempts: u32, reason: String },

    #[error("Change feed closed")]
    FeedClosed,

    #[error("Realtime error: {0}")]
    Realtime(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Unknown cluster id {0}")]
    UnknownCluster(u32),

    #[error("Invalid lifecycle transition from {from:?} on {event:?}")]
    InvalidTransition {
        from: LifecycleState,
        event: LifecycleEvent,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MapError {
    /// Whether retrying the failed operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MapError::Token(_)
                | MapError::Fetch { .. }
                | MapError::FeedClosed
                | MapError::Realtime(_)
                | MapError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that all public types are accessible
        let _: fn() -> EngineConfig = EngineConfig::default;
        let _: fn(ClusterConfig) -> Result<SpatialIndex> = SpatialIndex::new;
        let _: fn() -> Lifecycle = Lifecycle::new;
    }

    #[test]
    fn test_transient_errors() {
        assert!(
            MapError::Fetch {
                attempts: 1,
                reason: "timeout".into()
            }
            .is_transient()
        );
        assert!(!MapError::TokenUnavailable.is_transient());
        assert!(!MapError::InvalidConfig("x".into()).is_transient());
    }
}
