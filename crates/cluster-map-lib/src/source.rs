//! Point retrieval strategies
//!
//! Two interchangeable [`DataSource`]s answer "what is inside this bounding box":
//!
//! - **[`FullIndexSource`]**: loads every eligible point once, keeps one
//!   [`SpatialIndex`] and answers every viewport locally
//! - **[`WindowedSource`]**: queries the point service for each viewport, with
//!   retries and a bounded cache of recent windows
//!
//! [`WindowLoader`] runs fetches in the background, keeps exactly one in flight and
//! stamps every result with a version so that late answers never overwrite fresher ones.

use crate::collaborators::PointQuery;
use crate::index::{ClusterConfig, IndexSnapshot, SpatialIndex};
use crate::retry::RetryPolicy;
use crate::{
    BoundingBox, ChangeFilter, ClusterFeature, Feature, MapError, Point, Result, Viewport,
};
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Which strategy backs the map
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum SourceMode {
    /// Load the full eligible set and cluster locally
    #[default]
    Full,
    /// Query the point service per viewport
    Windowed,
}

/// Sizes of the bounded caches
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct CacheConfig {
    /// Cached windows in windowed mode
    pub window_entries: usize,
    /// Cached marker descriptions
    pub marker_entries: usize,
    /// Grid in degrees used to quantize window cache keys
    pub bbox_quantum: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            window_entries: 32,
            marker_entries: 1024,
            bbox_quantum: 0.0001,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_entries == 0 || self.marker_entries == 0 {
            return Err(MapError::InvalidConfig(
                "cache sizes must be positive".to_string(),
            ));
        }
        if !(self.bbox_quantum.is_finite() && self.bbox_quantum > 0.0) {
            return Err(MapError::InvalidConfig(
                "bbox_quantum must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn window_capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.window_entries).unwrap_or(NonZeroUsize::MIN)
    }

    pub(crate) fn marker_capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.marker_entries).unwrap_or(NonZeroUsize::MIN)
    }
}

/// How many individual points may be fetched and rendered, and whether to cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CapPolicy {
    pub limit: usize,
    pub clustering: bool,
}

impl CapPolicy {
    pub fn clustered(limit: usize) -> Self {
        Self {
            limit,
            clustering: true,
        }
    }

    pub fn flat(limit: usize) -> Self {
        Self {
            limit,
            clustering: false,
        }
    }

    /// Keep at most `limit` points, highest priority first
    ///
    /// Priority: verified points, then higher vote score, then id.
    pub fn apply(&self, mut points: Vec<Point>) -> Vec<Point> {
        points.sort_by(|a, b| {
            b.attributes
                .verified
                .cmp(&a.attributes.verified)
                .then_with(|| b.attributes.vote_score.cmp(&a.attributes.vote_score))
                .then_with(|| a.id.cmp(&b.id))
        });
        points.truncate(self.limit);
        points
    }
}

/// Answer for one bounding box
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WindowResult {
    /// Individual points to render, capped
    pub points: Vec<Point>,
    /// Clusters to render (never capped)
    pub clusters: Vec<ClusterFeature>,
    /// Points inside the window before capping
    pub total_count: usize,
    /// Raw eligible points of the window as fetched (windowed mode only)
    pub window_points: Vec<Point>,
}

impl WindowResult {
    /// Clusters followed by points
    pub fn features(&self) -> Vec<Feature> {
        self.clusters
            .iter()
            .cloned()
            .map(Feature::Cluster)
            .chain(self.points.iter().cloned().map(Feature::Point))
            .collect()
    }

    /// Number of drawable items
    pub fn rendered_count(&self) -> usize {
        self.clusters.len() + self.points.len()
    }
}

/// Render a window from an index snapshot
pub fn window_from_snapshot(
    snapshot: &IndexSnapshot,
    bbox: &BoundingBox,
    zoom: f64,
    cap: &CapPolicy,
) -> WindowResult {
    if !cap.clustering {
        let points = snapshot.query_points(bbox);
        let total_count = points.len();
        return WindowResult {
            points: cap.apply(points),
            total_count,
            ..Default::default()
        };
    }

    let mut clusters = Vec::new();
    let mut points = Vec::new();
    let mut total_count = 0;
    for feature in snapshot.query(bbox, zoom) {
        total_count += feature.point_count();
        match feature {
            Feature::Cluster(cluster) => clusters.push(cluster),
            Feature::Point(point) => points.push(point),
        }
    }
    WindowResult {
        points: cap.apply(points),
        clusters,
        total_count,
        window_points: Vec::new(),
    }
}

/// Render a window from a plain list of points, clustering it on the fly if needed
pub fn cluster_window(
    points: &[Point],
    bbox: &BoundingBox,
    zoom: f64,
    cap: &CapPolicy,
    config: &ClusterConfig,
) -> Result<WindowResult> {
    let inside: Vec<Point> = points
        .iter()
        .filter(|p| bbox.contains(p.lat, p.lon))
        .cloned()
        .collect();
    if !cap.clustering {
        let total_count = inside.len();
        return Ok(WindowResult {
            points: cap.apply(inside),
            total_count,
            ..Default::default()
        });
    }
    let snapshot = IndexSnapshot::build(&inside, config, 0)?;
    Ok(window_from_snapshot(&snapshot, bbox, zoom, cap))
}

/// Retrieves points and cluster aggregates for a bounding box
#[async_trait]
pub trait DataSource: Send + Sync {
    fn mode(&self) -> SourceMode;

    /// Raw eligible points that back the live point set
    ///
    /// Full-index sources return every eligible point and ignore the viewport;
    /// windowed sources return the points of the viewport (none without one).
    async fn load_points(&self, viewport: Option<&Viewport>) -> Result<Vec<Point>>;

    /// Points and clusters to render for a window
    async fn fetch_window(&self, bbox: &BoundingBox, zoom: f64, cap: &CapPolicy) -> Result<WindowResult>;

    /// Install a new live point set; returns the resulting data version
    async fn refresh(&self, points: Vec<Point>) -> Result<u64>;

    /// Render the live point set without network access
    fn render_local(
        &self,
        points: &[Point],
        bbox: &BoundingBox,
        zoom: f64,
        cap: &CapPolicy,
    ) -> Result<WindowResult>;
}

/// Loads the whole eligible set once and answers viewports from a local index
pub struct FullIndexSource {
    query: Arc<dyn PointQuery>,
    filter: ChangeFilter,
    retry: RetryPolicy,
    index: Arc<SpatialIndex>,
}

impl FullIndexSource {
    pub fn new(
        query: Arc<dyn PointQuery>,
        filter: ChangeFilter,
        retry: RetryPolicy,
        cluster: ClusterConfig,
    ) -> Result<Self> {
        Ok(Self {
            query,
            filter,
            retry,
            index: Arc::new(SpatialIndex::new(cluster)?),
        })
    }

    pub fn index(&self) -> &Arc<SpatialIndex> {
        &self.index
    }
}

#[async_trait]
impl DataSource for FullIndexSource {
    fn mode(&self) -> SourceMode {
        SourceMode::Full
    }

    async fn load_points(&self, _viewport: Option<&Viewport>) -> Result<Vec<Point>> {
        let world = BoundingBox::world();
        let points = self
            .retry
            .run("load_points", |_| self.query.list_points(&world, &self.filter, None))
            .await?;
        tracing::info!(points = points.len(), "Loaded full point set");
        Ok(points)
    }

    async fn fetch_window(&self, bbox: &BoundingBox, zoom: f64, cap: &CapPolicy) -> Result<WindowResult> {
        Ok(window_from_snapshot(&self.index.snapshot(), bbox, zoom, cap))
    }

    async fn refresh(&self, points: Vec<Point>) -> Result<u64> {
        let snapshot = self.index.rebuild_in_background(points).await?;
        Ok(snapshot.version())
    }

    fn render_local(
        &self,
        _points: &[Point],
        bbox: &BoundingBox,
        zoom: f64,
        cap: &CapPolicy,
    ) -> Result<WindowResult> {
        Ok(window_from_snapshot(&self.index.snapshot(), bbox, zoom, cap))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct WindowKey {
    bbox: [i64; 4],
    zoom: i64,
    cap: CapPolicy,
}

/// Queries the point service for every viewport
pub struct WindowedSource {
    query: Arc<dyn PointQuery>,
    filter: ChangeFilter,
    retry: RetryPolicy,
    cluster: ClusterConfig,
    bbox_quantum: f64,
    cache: Mutex<LruCache<WindowKey, WindowResult>>,
    version: AtomicU64,
}

impl WindowedSource {
    pub fn new(
        query: Arc<dyn PointQuery>,
        filter: ChangeFilter,
        retry: RetryPolicy,
        cluster: ClusterConfig,
        cache: &CacheConfig,
    ) -> Result<Self> {
        cluster.validate()?;
        cache.validate()?;
        Ok(Self {
            query,
            filter,
            retry,
            cluster,
            bbox_quantum: cache.bbox_quantum,
            cache: Mutex::new(LruCache::new(cache.window_capacity())),
            version: AtomicU64::new(0),
        })
    }

    fn key(&self, bbox: &BoundingBox, zoom: f64, cap: &CapPolicy) -> WindowKey {
        WindowKey {
            bbox: bbox.quantized(self.bbox_quantum),
            zoom: zoom.floor() as i64,
            cap: *cap,
        }
    }

    /// Every eligible point of the window; caps are applied locally so that the
    /// total count and the cap priority see the whole window
    async fn fetch_raw(&self, bbox: &BoundingBox) -> Result<Vec<Point>> {
        let points = self
            .retry
            .run("list_points", |_| self.query.list_points(bbox, &self.filter, None))
            .await?;
        Ok(points)
    }

    pub fn cached_windows(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn invalidate(&self) {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.version.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataSource for WindowedSource {
    fn mode(&self) -> SourceMode {
        SourceMode::Windowed
    }

    async fn load_points(&self, viewport: Option<&Viewport>) -> Result<Vec<Point>> {
        match viewport {
            Some(viewport) => self.fetch_raw(&viewport.bbox).await,
            None => Ok(Vec::new()),
        }
    }

    async fn fetch_window(&self, bbox: &BoundingBox, zoom: f64, cap: &CapPolicy) -> Result<WindowResult> {
        let key = self.key(bbox, zoom, cap);
        let cached = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();
        if let Some(result) = cached {
            tracing::debug!(zoom, "Window cache hit");
            return Ok(result);
        }

        let raw = self.fetch_raw(bbox).await?;
        let mut result = cluster_window(&raw, bbox, zoom, cap, &self.cluster)?;
        result.window_points = raw;
        tracing::debug!(
            zoom,
            fetched = result.window_points.len(),
            rendered = result.rendered_count(),
            "Fetched window"
        );

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(key, result.clone());
        Ok(result)
    }

    async fn refresh(&self, _points: Vec<Point>) -> Result<u64> {
        self.invalidate();
        Ok(self.version.load(Ordering::SeqCst))
    }

    fn render_local(
        &self,
        points: &[Point],
        bbox: &BoundingBox,
        zoom: f64,
        cap: &CapPolicy,
    ) -> Result<WindowResult> {
        let mut result = cluster_window(points, bbox, zoom, cap, &self.cluster)?;
        result.window_points = points.to_vec();
        Ok(result)
    }
}

/// A completed background fetch
#[derive(Debug)]
pub struct LoadedWindow {
    pub version: u64,
    pub viewport: Viewport,
    pub cap: CapPolicy,
    pub result: Result<WindowResult>,
}

/// Keeps exactly one window fetch in flight
///
/// Every request gets a new version and aborts the previous task. Results are
/// delivered through a channel; [`WindowLoader::accept`] rejects anything that
/// is not the latest request, even if it slipped past the abort.
pub struct WindowLoader {
    source: Arc<dyn DataSource>,
    version: u64,
    in_flight: Option<JoinHandle<()>>,
    results: mpsc::UnboundedSender<LoadedWindow>,
}

impl WindowLoader {
    pub fn new(source: Arc<dyn DataSource>) -> (Self, mpsc::UnboundedReceiver<LoadedWindow>) {
        let (results, receiver) = mpsc::unbounded_channel();
        (
            Self {
                source,
                version: 0,
                in_flight: None,
                results,
            },
            receiver,
        )
    }

    /// Start fetching `viewport`, superseding any fetch in flight; returns its version
    pub fn request(&mut self, viewport: Viewport, cap: CapPolicy) -> u64 {
        self.cancel();
        self.version += 1;
        let version = self.version;
        let source = Arc::clone(&self.source);
        let results = self.results.clone();

        self.in_flight = Some(tokio::spawn(async move {
            let result = source.fetch_window(&viewport.bbox, viewport.zoom, &cap).await;
            // The receiver is gone only when the engine shut down
            let _ = results.send(LoadedWindow {
                version,
                viewport,
                cap,
                result,
            });
        }));
        tracing::debug!(version, zoom = viewport.zoom, "Requested window");
        version
    }

    /// Whether `loaded` answers the latest request
    pub fn accept(&mut self, loaded: &LoadedWindow) -> bool {
        if loaded.version != self.version {
            tracing::warn!(
                version = loaded.version,
                current = self.version,
                "Discarding stale window result"
            );
            return false;
        }
        self.in_flight = None;
        true
    }

    /// Abort the fetch in flight, if any
    pub fn cancel(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            handle.abort();
        }
    }

    /// Invalidate outstanding results without starting a new fetch
    pub fn supersede(&mut self) {
        self.cancel();
        self.version += 1;
    }

    pub fn current_version(&self) -> u64 {
        self.version
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn source(&self) -> &Arc<dyn DataSource> {
        &self.source
    }
}

impl Drop for WindowLoader {
    fn drop(&mut self) {
        self.cancel();
    }
}
