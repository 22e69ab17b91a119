//! Core value types shared by every stage of the pipeline
//!
//! Points come in from the query and change-feed collaborators, the spatial index
//! turns them into [`Feature`]s for a [`Viewport`], and the marker factory
//! describes those features for the render surface.

use crate::{MapError, Result, utils};
use geo::{Coord, Rect};
use smallvec::SmallVec;
use std::collections::BTreeSet;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Stable identifier of a geolocated record
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct PointId(pub String);

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PointId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PointId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Record attributes that influence clustering weight and marker styling
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "camelCase", default)
)]
pub struct Attributes {
    pub verified: bool,
    pub vote_score: i64,
    pub category: String,
    pub title: String,
}

/// A single geolocated record
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Point {
    pub id: PointId,
    pub lat: f64,
    pub lon: f64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub attributes: Attributes,
}

impl Point {
    /// Create a point with default attributes
    pub fn new(id: impl Into<PointId>, lat: f64, lon: f64) -> Self {
        Self {
            id: id.into(),
            lat,
            lon,
            attributes: Attributes::default(),
        }
    }

    /// Replace the attributes of this point
    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Reject NaN, infinite and out-of-range coordinates
    pub fn validate(&self) -> Result<()> {
        if utils::is_valid_wgs84(self.lat, self.lon) {
            Ok(())
        } else {
            Err(MapError::InvalidCoordinate {
                id: self.id.clone(),
                lat: self.lat,
                lon: self.lon,
            })
        }
    }

    /// Position in normalized Web Mercator space
    #[inline]
    pub fn projected(&self) -> Coord<f64> {
        utils::project(self.lat, self.lon)
    }

    #[inline]
    pub fn position(&self) -> LatLon {
        LatLon::new(self.lat, self.lon)
    }
}

/// A WGS84 position in degrees
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Geographic bounding box in degrees
///
/// `west > east` describes a box that crosses the antimeridian.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BoundingBox {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl BoundingBox {
    /// Create a validated bounding box
    pub fn new(north: f64, south: f64, east: f64, west: f64) -> Result<Self> {
        let bbox = Self {
            north,
            south,
            east,
            west,
        };
        if !utils::is_valid_wgs84(north, east) || !utils::is_valid_wgs84(south, west) {
            return Err(MapError::InvalidConfig(format!(
                "bounding box out of range: {bbox:?}"
            )));
        }
        if south > north {
            return Err(MapError::InvalidConfig(format!(
                "bounding box south {south} is above north {north}"
            )));
        }
        Ok(bbox)
    }

    /// The whole world
    pub const fn world() -> Self {
        Self {
            north: 90.0,
            south: -90.0,
            east: 180.0,
            west: -180.0,
        }
    }

    /// Box centered on `center` spanning `lat_span` x `lon_span` degrees
    ///
    /// Latitudes are clamped to the poles and longitudes wrap around the antimeridian.
    pub fn around(center: LatLon, lat_span: f64, lon_span: f64) -> Self {
        let half_lat = lat_span.abs() / 2.0;
        let half_lon = (lon_span.abs() / 2.0).min(180.0);
        if half_lon >= 180.0 {
            return Self {
                north: (center.lat + half_lat).min(90.0),
                south: (center.lat - half_lat).max(-90.0),
                east: 180.0,
                west: -180.0,
            };
        }
        Self {
            north: (center.lat + half_lat).min(90.0),
            south: (center.lat - half_lat).max(-90.0),
            east: wrap_lon(center.lon + half_lon),
            west: wrap_lon(center.lon - half_lon),
        }
    }

    #[inline]
    pub fn crosses_antimeridian(&self) -> bool {
        self.west > self.east
    }

    /// Inclusive containment test in degrees
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        if lat < self.south || lat > self.north {
            return false;
        }
        if self.crosses_antimeridian() {
            lon >= self.west || lon <= self.east
        } else {
            lon >= self.west && lon <= self.east
        }
    }

    pub fn center(&self) -> LatLon {
        let lat = (self.north + self.south) / 2.0;
        let lon = if self.crosses_antimeridian() {
            wrap_lon((self.west + self.east + 360.0) / 2.0)
        } else {
            (self.west + self.east) / 2.0
        };
        LatLon::new(lat, lon)
    }

    /// Project into normalized Web Mercator rectangles
    ///
    /// Antimeridian-crossing boxes are split into two rectangles.
    pub fn projected_rects(&self) -> SmallVec<[Rect<f64>; 2]> {
        let top = utils::lat_to_y(self.north);
        let bottom = utils::lat_to_y(self.south);
        let rect = |west: f64, east: f64| {
            Rect::new(
                Coord {
                    x: utils::lon_to_x(west),
                    y: top,
                },
                Coord {
                    x: utils::lon_to_x(east),
                    y: bottom,
                },
            )
        };
        let mut rects = SmallVec::new();
        if self.crosses_antimeridian() {
            rects.push(rect(self.west, 180.0));
            rects.push(rect(-180.0, self.east));
        } else {
            rects.push(rect(self.west, self.east));
        }
        rects
    }

    /// Quantize the box to a grid of `step` degrees (used for cache keys)
    pub fn quantized(&self, step: f64) -> [i64; 4] {
        let q = |v: f64| (v / step).round() as i64;
        [q(self.north), q(self.south), q(self.east), q(self.west)]
    }
}

fn wrap_lon(lon: f64) -> f64 {
    if lon > 180.0 {
        lon - 360.0
    } else if lon < -180.0 {
        lon + 360.0
    } else {
        lon
    }
}

/// Camera state as seen by the engine
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Viewport {
    pub bbox: BoundingBox,
    pub zoom: f64,
    pub center: LatLon,
}

impl Viewport {
    pub fn new(bbox: BoundingBox, zoom: f64, center: LatLon) -> Self {
        Self { bbox, zoom, center }
    }

    /// Viewport whose center is the middle of `bbox`
    pub fn from_bbox(bbox: BoundingBox, zoom: f64) -> Self {
        Self::new(bbox, zoom, bbox.center())
    }

    /// Two viewports are equivalent when neither the zoom nor the center moved enough
    /// to be worth a new query.
    pub fn is_equivalent(&self, other: &Viewport, zoom_epsilon: f64, center_epsilon: f64) -> bool {
        if (self.zoom - other.zoom).abs() >= zoom_epsilon {
            return false;
        }
        let d_lat = (self.center.lat - other.center.lat).abs();
        let mut d_lon = (self.center.lon - other.center.lon).abs();
        if d_lon > 180.0 {
            d_lon = 360.0 - d_lon;
        }
        d_lat < center_epsilon && d_lon < center_epsilon
    }
}

/// Identifier of a cluster inside one index snapshot
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct ClusterId(pub u32);

/// An aggregate of nearby points at a given zoom level
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "camelCase")
)]
pub struct ClusterFeature {
    pub id: ClusterId,
    pub centroid: LatLon,
    pub count: usize,
    pub verified_count: usize,
    pub total_votes: i64,
    pub expansion_zoom: f64,
}

/// The unit returned by a viewport query
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(tag = "type", rename_all = "lowercase")
)]
pub enum Feature {
    Cluster(ClusterFeature),
    Point(Point),
}

/// Key of a feature in the marker arena
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum FeatureId {
    Cluster(ClusterId),
    Point(PointId),
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureId::Cluster(id) => write!(f, "cluster:{}", id.0),
            FeatureId::Point(id) => write!(f, "point:{id}"),
        }
    }
}

impl Feature {
    pub fn id(&self) -> FeatureId {
        match self {
            Feature::Cluster(c) => FeatureId::Cluster(c.id),
            Feature::Point(p) => FeatureId::Point(p.id.clone()),
        }
    }

    /// Number of input points represented by this feature
    pub fn point_count(&self) -> usize {
        match self {
            Feature::Cluster(c) => c.count,
            Feature::Point(_) => 1,
        }
    }

    pub fn position(&self) -> LatLon {
        match self {
            Feature::Cluster(c) => c.centroid,
            Feature::Point(p) => p.position(),
        }
    }

    pub fn is_cluster(&self) -> bool {
        matches!(self, Feature::Cluster(_))
    }
}

/// Kind of change carried by a realtime event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A single insert/update/delete from the change feed
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub point: Point,
}

impl ChangeEvent {
    pub fn insert(point: Point) -> Self {
        Self {
            kind: ChangeKind::Insert,
            point,
        }
    }

    pub fn update(point: Point) -> Self {
        Self {
            kind: ChangeKind::Update,
            point,
        }
    }

    pub fn delete(point: Point) -> Self {
        Self {
            kind: ChangeKind::Delete,
            point,
        }
    }
}

/// Eligibility filter for records, shared by the point query and the change feed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct ChangeFilter {
    /// Only verified records are eligible
    pub verified_only: bool,
    /// Restrict to these categories (`None` accepts every category)
    pub categories: Option<BTreeSet<String>>,
}

impl ChangeFilter {
    pub fn matches(&self, point: &Point) -> bool {
        if self.verified_only && !point.attributes.verified {
            return false;
        }
        match &self.categories {
            Some(categories) => categories.contains(&point.attributes.category),
            None => true,
        }
    }
}
