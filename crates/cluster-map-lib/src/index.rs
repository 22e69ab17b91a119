//! Hierarchical cluster index with immutable, versioned snapshots
//!
//! The index is a stack of zoom levels. The finest level (`max_zoom + 1`) holds the
//! raw points; every coarser level is produced by greedily merging the items of the
//! level below that lie within `radius` pixels of each other at that zoom. Items are
//! visited in insertion order, so the same input always yields the same clusters.
//!
//! # Architecture
//!
//! - **[`IndexSnapshot`]**: one immutable build over a point set, safe to share
//! - **[`SpatialIndex`]**: publishes snapshots through an atomic pointer swap so
//!   readers never observe a half-built index
//!
//! # Performance Characteristics
//!
//! - **Build Time**: O(N log N) per level (quadtree insert + radius queries)
//! - **Query Time**: O(log N + K) where K = returned features

use crate::quadtree::{Entry, Quadtree};
use crate::{
    BoundingBox, ClusterFeature, ClusterId, Feature, LatLon, MapError, Point, Result, utils,
};

use arc_swap::ArcSwap;
use geo::{Coord, Rect};
use rayon::prelude::*;
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Highest zoom level the index accepts for `max_zoom`
pub const MAX_SUPPORTED_ZOOM: u8 = 22;

/// Configuration of the clustering algorithm
///
/// Changing any of these values is a structural change and requires a full rebuild.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct ClusterConfig {
    /// Cluster radius in screen pixels
    pub radius: f64,
    /// Coarsest zoom level that gets clustered
    pub min_zoom: u8,
    /// Finest zoom level that gets clustered; above it every point is shown individually
    pub max_zoom: u8,
    /// Minimum number of points that form a cluster
    pub min_points: usize,
    /// Weight cluster centroids by vote score instead of a plain average
    pub vote_weighted: bool,
    /// Leaf capacity of the per-level quadtrees
    pub max_items_per_node: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            radius: 80.0,
            min_zoom: 0,
            max_zoom: 16,
            min_points: 2,
            vote_weighted: false,
            max_items_per_node: 64,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.radius.is_finite() && self.radius > 0.0) {
            return Err(MapError::InvalidConfig(format!(
                "cluster radius must be positive, got {}",
                self.radius
            )));
        }
        if self.min_points < 2 {
            return Err(MapError::InvalidConfig(format!(
                "min_points must be at least 2, got {}",
                self.min_points
            )));
        }
        if self.min_zoom > self.max_zoom || self.max_zoom > MAX_SUPPORTED_ZOOM {
            return Err(MapError::InvalidConfig(format!(
                "invalid zoom range {}..={} (max {MAX_SUPPORTED_ZOOM})",
                self.min_zoom, self.max_zoom
            )));
        }
        if self.max_items_per_node == 0 {
            return Err(MapError::InvalidConfig(
                "max_items_per_node must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn point_weight(&self, point: &Point) -> f64 {
        if self.vote_weighted {
            1.0 + point.attributes.vote_score.max(0) as f64
        } else {
            1.0
        }
    }
}

/// Reference to an item of a level: a raw point or a cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NodeRef {
    Point(u32),
    Cluster(u32),
}

#[derive(Clone, Copy, Debug)]
struct IndexedPoint {
    coord: Coord<f64>,
    weight: f64,
}

#[derive(Clone, Debug)]
struct ClusterNode {
    centroid: Coord<f64>,
    weight: f64,
    count: usize,
    verified_count: usize,
    total_votes: i64,
    /// Bounding box of all member points in normalized coordinates
    bounds: Rect<f64>,
    /// Member latitudes as `[min, max]`; the projection saturates near the poles
    lat_range: [f64; 2],
    /// Zoom level at which this cluster was produced
    zoom: u8,
    children: SmallVec<[NodeRef; 4]>,
}

#[derive(Clone, Debug)]
struct Level {
    items: Vec<NodeRef>,
    /// Items indexed by their member bounds
    tree: Quadtree,
}

/// Aggregated values of one level item, used while merging
#[derive(Clone, Copy, Debug)]
struct Aggregate {
    centroid: Coord<f64>,
    weight: f64,
    count: usize,
    verified_count: usize,
    total_votes: i64,
    bounds: Rect<f64>,
    lat_range: [f64; 2],
}

/// Summary of a snapshot
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IndexStats {
    pub version: u64,
    /// Number of indexed points
    pub point_count: usize,
    /// Points rejected during build (malformed coordinates)
    pub dropped_count: usize,
    /// Number of features visible at each zoom level, coarsest first
    pub features_per_zoom: Vec<(u8, usize)>,
    /// Bounding box of all points in WGS84 (None if empty)
    pub bounds: Option<BoundingBox>,
}

impl IndexStats {
    /// Center of all indexed points in WGS84
    pub fn center(&self) -> Option<LatLon> {
        self.bounds.map(|b| b.center())
    }
}

/// Immutable result of clustering a point set
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    version: u64,
    config: ClusterConfig,
    points: Vec<Point>,
    projected: Vec<IndexedPoint>,
    clusters: Vec<ClusterNode>,
    /// Levels from `min_zoom` to `max_zoom + 1`
    levels: Vec<Level>,
    dropped: usize,
    bounds: Option<BoundingBox>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl IndexSnapshot {
    /// An index without points
    pub fn empty(config: ClusterConfig) -> Result<Self> {
        Self::build(&[], &config, 0)
    }

    /// Cluster `points` into a new snapshot
    ///
    /// Points with NaN or out-of-range coordinates are dropped with a warning; they
    /// never abort the build. Only an invalid configuration is an error.
    pub fn build(points: &[Point], config: &ClusterConfig, version: u64) -> Result<Self> {
        #[cfg(feature = "profiling")]
        profiling::scope!("index::build");

        config.validate()?;

        let mut accepted = Vec::with_capacity(points.len());
        let mut dropped = 0usize;
        for point in points {
            match point.validate() {
                Ok(()) => accepted.push(point.clone()),
                Err(err) => {
                    dropped += 1;
                    tracing::warn!(%err, "Dropping malformed point from index build");
                }
            }
        }

        let projected: Vec<IndexedPoint> = accepted
            .par_iter()
            .map(|point| IndexedPoint {
                coord: point.projected(),
                weight: config.point_weight(point),
            })
            .collect();

        let bounds = wgs84_bounds(&accepted);

        let mut snapshot = Self {
            version,
            config: config.clone(),
            points: accepted,
            projected,
            clusters: Vec::new(),
            levels: Vec::new(),
            dropped,
            bounds,
        };

        // Finest level: raw points
        let items: Vec<NodeRef> = (0..snapshot.points.len() as u32).map(NodeRef::Point).collect();
        let mut levels = vec![snapshot.make_level(items)];

        for zoom in (config.min_zoom..=config.max_zoom).rev() {
            let finer = levels.last().map(|l| l.items.as_slice()).unwrap_or(&[]);
            let items = snapshot.cluster_items(finer, zoom);
            levels.push(snapshot.make_level(items));
        }

        levels.reverse();
        snapshot.levels = levels;

        tracing::debug!(
            version,
            points = snapshot.points.len(),
            clusters = snapshot.clusters.len(),
            dropped,
            "Built cluster index"
        );

        Ok(snapshot)
    }

    /// Greedily merge the items of a finer level at `zoom`
    fn cluster_items(&mut self, finer: &[NodeRef], zoom: u8) -> Vec<NodeRef> {
        let radius = utils::pixels_to_normalized(self.config.radius, zoom as f64);
        let radius_sq = radius * radius;

        let aggregates: Vec<Aggregate> = finer.iter().map(|&n| self.aggregate(n)).collect();
        let centroid_tree = Quadtree::from_entries(
            aggregates
                .iter()
                .enumerate()
                .map(|(i, a)| Entry::point(i as u32, a.centroid)),
            self.config.max_items_per_node,
        );

        let mut visited = vec![false; finer.len()];
        let mut items = Vec::with_capacity(finer.len());
        let mut neighbors: Vec<u32> = Vec::new();

        for i in 0..finer.len() {
            if visited[i] {
                continue;
            }
            visited[i] = true;
            let origin = aggregates[i];

            neighbors.clear();
            centroid_tree.query_around(origin.centroid, radius, &mut neighbors);
            neighbors.retain(|&j| {
                let j = j as usize;
                !visited[j] && distance_sq(origin.centroid, aggregates[j].centroid) <= radius_sq
            });
            // Ties are broken by original insertion order
            neighbors.sort_unstable();

            if neighbors.is_empty() {
                items.push(finer[i]);
                continue;
            }

            let total: usize =
                origin.count + neighbors.iter().map(|&j| aggregates[j as usize].count).sum::<usize>();

            if total >= self.config.min_points {
                let mut merged = origin;
                let mut wx = origin.centroid.x * origin.weight;
                let mut wy = origin.centroid.y * origin.weight;
                let mut children: SmallVec<[NodeRef; 4]> = SmallVec::new();
                children.push(finer[i]);

                for &j in &neighbors {
                    let j = j as usize;
                    visited[j] = true;
                    let a = aggregates[j];
                    wx += a.centroid.x * a.weight;
                    wy += a.centroid.y * a.weight;
                    merged.weight += a.weight;
                    merged.count += a.count;
                    merged.verified_count += a.verified_count;
                    merged.total_votes = merged.total_votes.saturating_add(a.total_votes);
                    merged.bounds = utils::rect_union(&merged.bounds, &a.bounds);
                    merged.lat_range = [
                        merged.lat_range[0].min(a.lat_range[0]),
                        merged.lat_range[1].max(a.lat_range[1]),
                    ];
                    children.push(finer[j]);
                }

                let id = self.clusters.len() as u32;
                self.clusters.push(ClusterNode {
                    centroid: Coord {
                        x: wx / merged.weight,
                        y: wy / merged.weight,
                    },
                    weight: merged.weight,
                    count: merged.count,
                    verified_count: merged.verified_count,
                    total_votes: merged.total_votes,
                    bounds: merged.bounds,
                    lat_range: merged.lat_range,
                    zoom,
                    children,
                });
                items.push(NodeRef::Cluster(id));
            } else {
                // Too few points for a cluster: keep every member as an individual item
                items.push(finer[i]);
                for &j in &neighbors {
                    visited[j as usize] = true;
                    items.push(finer[j as usize]);
                }
            }
        }

        items
    }

    fn make_level(&self, items: Vec<NodeRef>) -> Level {
        let tree = Quadtree::from_entries(
            items.iter().enumerate().map(|(i, &node)| Entry {
                id: i as u32,
                rect: self.bounds_of(node),
            }),
            self.config.max_items_per_node,
        );
        Level { items, tree }
    }

    fn aggregate(&self, node: NodeRef) -> Aggregate {
        match node {
            NodeRef::Point(i) => {
                let p = &self.projected[i as usize];
                let point = &self.points[i as usize];
                Aggregate {
                    centroid: p.coord,
                    weight: p.weight,
                    count: 1,
                    verified_count: point.attributes.verified as usize,
                    total_votes: point.attributes.vote_score,
                    bounds: Rect::new(p.coord, p.coord),
                    lat_range: [point.lat, point.lat],
                }
            }
            NodeRef::Cluster(c) => {
                let c = &self.clusters[c as usize];
                Aggregate {
                    centroid: c.centroid,
                    weight: c.weight,
                    count: c.count,
                    verified_count: c.verified_count,
                    total_votes: c.total_votes,
                    bounds: c.bounds,
                    lat_range: c.lat_range,
                }
            }
        }
    }

    fn bounds_of(&self, node: NodeRef) -> Rect<f64> {
        match node {
            NodeRef::Point(i) => {
                let coord = self.projected[i as usize].coord;
                Rect::new(coord, coord)
            }
            NodeRef::Cluster(c) => self.clusters[c as usize].bounds,
        }
    }

    /// Index into `levels` for a (fractional) zoom
    fn level_index(&self, zoom: f64) -> usize {
        let min = self.config.min_zoom as f64;
        let max = self.config.max_zoom as f64 + 1.0;
        let z = if zoom.is_nan() { min } else { zoom.floor().clamp(min, max) };
        (z - min) as usize
    }

    /// Features visible in `bbox` at `zoom`
    ///
    /// A cluster is returned only when all of its members lie inside the box; a
    /// cluster that straddles the edge is replaced by its children, so the returned
    /// features account for exactly the points inside the box.
    pub fn query(&self, bbox: &BoundingBox, zoom: f64) -> Vec<Feature> {
        #[cfg(feature = "profiling")]
        profiling::scope!("index::query");

        let Some(level) = self.levels.get(self.level_index(zoom)) else {
            return Vec::new();
        };

        let mut features = Vec::new();
        let mut candidates = Vec::new();
        for rect in bbox.projected_rects() {
            candidates.clear();
            level.tree.query(rect, &mut candidates);
            candidates.sort_unstable();
            for &item in &candidates {
                self.collect(level.items[item as usize], &rect, bbox, &mut features);
            }
        }
        features
    }

    /// `rect` is one projected piece of `bbox`. Latitudes are checked against `bbox`
    /// itself because every latitude beyond the Mercator limit projects onto the edge.
    fn collect(
        &self,
        node: NodeRef,
        rect: &Rect<f64>,
        bbox: &BoundingBox,
        out: &mut Vec<Feature>,
    ) {
        match node {
            NodeRef::Point(i) => {
                let point = &self.points[i as usize];
                if utils::rect_contains(rect, self.projected[i as usize].coord)
                    && bbox.contains(point.lat, point.lon)
                {
                    out.push(Feature::Point(point.clone()));
                }
            }
            NodeRef::Cluster(c) => {
                let cluster = &self.clusters[c as usize];
                let [south, north] = cluster.lat_range;
                if utils::rect_covers(rect, &cluster.bounds)
                    && bbox.south <= south
                    && north <= bbox.north
                {
                    out.push(Feature::Cluster(self.cluster_feature(c)));
                } else if utils::rects_intersect(rect, &cluster.bounds) {
                    for &child in &cluster.children {
                        self.collect(child, rect, bbox, out);
                    }
                }
            }
        }
    }

    /// Individual points inside `bbox`, in insertion order
    pub fn query_points(&self, bbox: &BoundingBox) -> Vec<Point> {
        let Some(level) = self.levels.last() else {
            return Vec::new();
        };
        let mut candidates = Vec::new();
        for rect in bbox.projected_rects() {
            level.tree.query(rect, &mut candidates);
        }
        candidates.sort_unstable();
        candidates.dedup();
        candidates
            .into_iter()
            .filter_map(|item| match level.items[item as usize] {
                NodeRef::Point(i) => Some(&self.points[i as usize]),
                NodeRef::Cluster(_) => None,
            })
            .filter(|p| bbox.contains(p.lat, p.lon))
            .cloned()
            .collect()
    }

    fn cluster_feature(&self, id: u32) -> ClusterFeature {
        let cluster = &self.clusters[id as usize];
        let (lat, lon) = utils::unproject(cluster.centroid);
        ClusterFeature {
            id: ClusterId(id),
            centroid: LatLon::new(lat, lon),
            count: cluster.count,
            verified_count: cluster.verified_count,
            total_votes: cluster.total_votes,
            expansion_zoom: cluster.zoom as f64 + 1.0,
        }
    }

    fn cluster(&self, id: ClusterId) -> Result<&ClusterNode> {
        self.clusters
            .get(id.0 as usize)
            .ok_or(MapError::UnknownCluster(id.0))
    }

    /// Zoom level at which the cluster splits into its children
    pub fn expansion_zoom(&self, id: ClusterId) -> Result<f64> {
        Ok(self.cluster(id)?.zoom as f64 + 1.0)
    }

    /// Zoom level at which the cluster was produced
    pub fn cluster_zoom(&self, id: ClusterId) -> Result<u8> {
        Ok(self.cluster(id)?.zoom)
    }

    /// Direct children of a cluster (sub-clusters and points one zoom level finer)
    pub fn children(&self, id: ClusterId) -> Result<Vec<Feature>> {
        let cluster = self.cluster(id)?;
        Ok(cluster
            .children
            .iter()
            .map(|&child| match child {
                NodeRef::Point(i) => Feature::Point(self.points[i as usize].clone()),
                NodeRef::Cluster(c) => Feature::Cluster(self.cluster_feature(c)),
            })
            .collect())
    }

    /// Up to `limit` member points of a cluster, depth first
    pub fn leaves(&self, id: ClusterId, limit: usize) -> Result<Vec<Point>> {
        let cluster = self.cluster(id)?;
        let mut leaves = Vec::new();
        let mut stack: Vec<NodeRef> = cluster.children.iter().rev().copied().collect();
        while let Some(node) = stack.pop() {
            if leaves.len() >= limit {
                break;
            }
            match node {
                NodeRef::Point(i) => leaves.push(self.points[i as usize].clone()),
                NodeRef::Cluster(c) => {
                    stack.extend(self.clusters[c as usize].children.iter().rev().copied())
                }
            }
        }
        Ok(leaves)
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Indexed points in insertion order
    #[inline]
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    #[inline]
    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn dropped_count(&self) -> usize {
        self.dropped
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            version: self.version,
            point_count: self.points.len(),
            dropped_count: self.dropped,
            features_per_zoom: self
                .levels
                .iter()
                .enumerate()
                .map(|(i, level)| (self.config.min_zoom + i as u8, level.items.len()))
                .collect(),
            bounds: self.bounds,
        }
    }
}

fn distance_sq(a: Coord<f64>, b: Coord<f64>) -> f64 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    dx * dx + dy * dy
}

fn wgs84_bounds(points: &[Point]) -> Option<BoundingBox> {
    let first = points.first()?;
    let mut bbox = BoundingBox {
        north: first.lat,
        south: first.lat,
        east: first.lon,
        west: first.lon,
    };
    for p in &points[1..] {
        bbox.north = bbox.north.max(p.lat);
        bbox.south = bbox.south.min(p.lat);
        bbox.east = bbox.east.max(p.lon);
        bbox.west = bbox.west.min(p.lon);
    }
    Some(bbox)
}

/// Publisher of index snapshots
///
/// Readers call [`SpatialIndex::snapshot`] and keep working with that snapshot for
/// as long as they need; rebuilds produce a fresh snapshot and swap the published
/// pointer atomically. Snapshots are never mutated in place.
#[derive(Debug)]
pub struct SpatialIndex {
    current: ArcSwap<IndexSnapshot>,
    next_version: AtomicU64,
}

impl SpatialIndex {
    /// Create an index with an empty snapshot (version 0)
    pub fn new(config: ClusterConfig) -> Result<Self> {
        let empty = IndexSnapshot::empty(config)?;
        Ok(Self {
            current: ArcSwap::from_pointee(empty),
            next_version: AtomicU64::new(1),
        })
    }

    /// The currently published snapshot
    #[inline]
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.current.load_full()
    }

    /// Rebuild over `points` with the current configuration and publish the result
    pub fn rebuild(&self, points: &[Point]) -> Result<Arc<IndexSnapshot>> {
        let config = self.current.load().config.clone();
        self.build_and_publish(points, &config)
    }

    /// Structural change: rebuild with a new configuration
    pub fn reconfigure(&self, config: ClusterConfig, points: &[Point]) -> Result<Arc<IndexSnapshot>> {
        tracing::info!(?config, "Reconfiguring cluster index");
        self.build_and_publish(points, &config)
    }

    /// Run the rebuild on the blocking thread pool
    pub async fn rebuild_in_background(
        self: &Arc<Self>,
        points: Vec<Point>,
    ) -> Result<Arc<IndexSnapshot>> {
        let index = Arc::clone(self);
        tokio::task::spawn_blocking(move || index.rebuild(&points))
            .await
            .map_err(|err| MapError::Index(format!("background rebuild failed: {err}")))?
    }

    fn build_and_publish(
        &self,
        points: &[Point],
        config: &ClusterConfig,
    ) -> Result<Arc<IndexSnapshot>> {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let snapshot = Arc::new(IndexSnapshot::build(points, config, version)?);

        // A slower, older build must never replace a newer one
        self.current.rcu(|current| {
            if current.version() > snapshot.version() {
                Arc::clone(current)
            } else {
                Arc::clone(&snapshot)
            }
        });

        tracing::info!(
            version,
            points = snapshot.point_count(),
            dropped = snapshot.dropped_count(),
            "Published index snapshot"
        );
        Ok(snapshot)
    }

    /// Query the currently published snapshot
    pub fn query(&self, bbox: &BoundingBox, zoom: f64) -> Vec<Feature> {
        self.current.load().query(bbox, zoom)
    }

    pub fn expansion_zoom(&self, id: ClusterId) -> Result<f64> {
        self.current.load().expansion_zoom(id)
    }
}
