//! Marker descriptions for the render surface
//!
//! [`describe`] is a pure function of a feature and a [`Theme`]; the same inputs always
//! produce the same [`MarkerSpec`]. [`MarkerFactory`] memoizes it in a bounded LRU
//! cache, and [`MarkerArena`] keeps the markers currently on screen so that each new
//! feature set turns into a small add/update/remove diff.

use crate::{Feature, FeatureId, LatLon, MapError, Result};
use lru::LruCache;
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroUsize;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 8-bit RGBA color
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    /// Blend towards `other`; `t = 0` keeps `self`, `t = 255` yields `other`
    pub fn mix(self, other: Rgba, t: u8) -> Rgba {
        let lerp = |a: u8, b: u8| -> u8 {
            let t = t as u16;
            ((a as u16 * (255 - t) + b as u16 * t) / 255) as u8
        };
        Rgba {
            r: lerp(self.r, other.r),
            g: lerp(self.g, other.g),
            b: lerp(self.b, other.b),
            a: lerp(self.a, other.a),
        }
    }
}

impl fmt::Display for Rgba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
    }
}

/// Size and color step for clusters with at least `min_count` points
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClusterTier {
    pub min_count: usize,
    pub size: f32,
    pub color: Rgba,
}

/// Visual parameters for markers
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct Theme {
    pub point_size: f32,
    pub verified_bonus: f32,
    /// Size added per positive vote
    pub popularity_bonus_per_vote: f32,
    /// Upper bound of the popularity bonus
    pub popularity_bonus_cap: f32,
    /// Extra size for prioritized categories
    pub category_bonus: BTreeMap<String, f32>,
    pub point_color: Rgba,
    pub category_colors: BTreeMap<String, Rgba>,
    /// Votes above this get a popularity ring
    pub ring_vote_threshold: i64,
    /// Ascending by `min_count`; the first tier must start at 0
    pub cluster_tiers: Vec<ClusterTier>,
    pub mostly_verified_color: Rgba,
    /// How far (0-255) a mostly verified cluster shifts towards `mostly_verified_color`
    pub mostly_verified_mix: u8,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            point_size: 24.0,
            verified_bonus: 6.0,
            popularity_bonus_per_vote: 0.5,
            popularity_bonus_cap: 10.0,
            category_bonus: BTreeMap::new(),
            point_color: Rgba::rgb(0x3b, 0x82, 0xf6),
            category_colors: BTreeMap::new(),
            ring_vote_threshold: 10,
            cluster_tiers: vec![
                ClusterTier {
                    min_count: 0,
                    size: 32.0,
                    color: Rgba::rgb(0x51, 0xbb, 0xd6),
                },
                ClusterTier {
                    min_count: 10,
                    size: 40.0,
                    color: Rgba::rgb(0xf1, 0xf0, 0x75),
                },
                ClusterTier {
                    min_count: 50,
                    size: 48.0,
                    color: Rgba::rgb(0xf2, 0x8c, 0xb1),
                },
                ClusterTier {
                    min_count: 100,
                    size: 56.0,
                    color: Rgba::rgb(0xe5, 0x48, 0x4d),
                },
            ],
            mostly_verified_color: Rgba::rgb(0x22, 0xc5, 0x5e),
            mostly_verified_mix: 128,
        }
    }
}

impl Theme {
    pub fn validate(&self) -> Result<()> {
        let Some(first) = self.cluster_tiers.first() else {
            return Err(MapError::InvalidConfig(
                "theme needs at least one cluster tier".to_string(),
            ));
        };
        if first.min_count != 0 {
            return Err(MapError::InvalidConfig(
                "first cluster tier must start at count 0".to_string(),
            ));
        }
        if self
            .cluster_tiers
            .windows(2)
            .any(|w| w[0].min_count >= w[1].min_count)
        {
            return Err(MapError::InvalidConfig(
                "cluster tiers must be strictly ascending".to_string(),
            ));
        }
        if !(self.point_size > 0.0 && self.popularity_bonus_cap >= 0.0) {
            return Err(MapError::InvalidConfig(
                "marker sizes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn tier(&self, count: usize) -> Option<&ClusterTier> {
        self.cluster_tiers
            .iter()
            .rev()
            .find(|tier| tier.min_count <= count)
    }
}

/// Everything the render surface needs to draw one marker
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MarkerSpec {
    pub size: f32,
    pub color: Rgba,
    /// Verification badge
    pub badge: bool,
    /// Pulsing popularity ring
    pub ring: bool,
    /// Text drawn on the marker (cluster counts)
    pub label: Option<String>,
}

/// Compact count label: `42`, `1.2k`, `35k`, `1.2M`
pub fn count_label(count: usize) -> String {
    match count {
        0..1_000 => count.to_string(),
        1_000..10_000 => {
            let tenths = count / 100;
            format!("{}.{}k", tenths / 10, tenths % 10)
        }
        10_000..1_000_000 => format!("{}k", count / 1_000),
        _ => {
            let tenths = count / 100_000;
            format!("{}.{}M", tenths / 10, tenths % 10)
        }
    }
}

/// Describe a feature with a theme
pub fn describe(feature: &Feature, theme: &Theme) -> MarkerSpec {
    match feature {
        Feature::Point(point) => {
            let attributes = &point.attributes;
            let votes = attributes.vote_score.max(0) as f32;
            let popularity = (votes * theme.popularity_bonus_per_vote).min(theme.popularity_bonus_cap);
            let category = theme
                .category_bonus
                .get(&attributes.category)
                .copied()
                .unwrap_or(0.0);
            let verified = if attributes.verified {
                theme.verified_bonus
            } else {
                0.0
            };
            MarkerSpec {
                size: theme.point_size + verified + popularity + category,
                color: theme
                    .category_colors
                    .get(&attributes.category)
                    .copied()
                    .unwrap_or(theme.point_color),
                badge: attributes.verified,
                ring: attributes.vote_score > theme.ring_vote_threshold,
                label: None,
            }
        }
        Feature::Cluster(cluster) => {
            let (size, base) = theme
                .tier(cluster.count)
                .map(|tier| (tier.size, tier.color))
                .unwrap_or((theme.point_size, theme.point_color));
            let color = if cluster.verified_count * 2 > cluster.count {
                base.mix(theme.mostly_verified_color, theme.mostly_verified_mix)
            } else {
                base
            };
            MarkerSpec {
                size,
                color,
                badge: false,
                ring: false,
                label: Some(count_label(cluster.count)),
            }
        }
    }
}

/// Inputs of [`describe`] that influence the output
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum MarkerKey {
    Point {
        verified: bool,
        vote_score: i64,
        category: String,
    },
    Cluster {
        count: usize,
        verified_count: usize,
    },
}

impl MarkerKey {
    fn of(feature: &Feature) -> Self {
        match feature {
            Feature::Point(p) => MarkerKey::Point {
                verified: p.attributes.verified,
                vote_score: p.attributes.vote_score,
                category: p.attributes.category.clone(),
            },
            Feature::Cluster(c) => MarkerKey::Cluster {
                count: c.count,
                verified_count: c.verified_count,
            },
        }
    }
}

/// Memoizing wrapper around [`describe`]
#[derive(Debug)]
pub struct MarkerFactory {
    theme: Theme,
    cache: LruCache<MarkerKey, MarkerSpec>,
}

impl MarkerFactory {
    pub fn new(theme: Theme, capacity: NonZeroUsize) -> Self {
        Self {
            theme,
            cache: LruCache::new(capacity),
        }
    }

    pub fn describe(&mut self, feature: &Feature) -> MarkerSpec {
        let key = MarkerKey::of(feature);
        if let Some(spec) = self.cache.get(&key) {
            return spec.clone();
        }
        let spec = describe(feature, &self.theme);
        self.cache.put(key, spec.clone());
        spec
    }

    /// Switch themes; cached descriptions are dropped
    pub fn set_theme(&mut self, theme: Theme) {
        self.theme = theme;
        self.cache.clear();
    }

    pub fn theme(&self) -> &Theme {
        &self.theme
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

/// A marker as currently drawn
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DrawnMarker {
    pub position: LatLon,
    pub spec: MarkerSpec,
}

/// Changes the render surface must apply to match a new feature set
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MarkerDiff {
    pub added: Vec<(FeatureId, DrawnMarker)>,
    pub updated: Vec<(FeatureId, DrawnMarker)>,
    pub removed: Vec<FeatureId>,
}

impl MarkerDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Markers currently on screen, keyed by feature id
#[derive(Clone, Debug, Default)]
pub struct MarkerArena {
    markers: BTreeMap<FeatureId, DrawnMarker>,
}

impl MarkerArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the drawn set with `features` and report what changed
    pub fn reconcile(&mut self, features: &[Feature], factory: &mut MarkerFactory) -> MarkerDiff {
        let mut next = BTreeMap::new();
        let mut diff = MarkerDiff::default();

        for feature in features {
            let id = feature.id();
            let marker = DrawnMarker {
                position: feature.position(),
                spec: factory.describe(feature),
            };
            match self.markers.get(&id) {
                None => diff.added.push((id.clone(), marker.clone())),
                Some(previous) if *previous != marker => {
                    diff.updated.push((id.clone(), marker.clone()))
                }
                Some(_) => {}
            }
            next.insert(id, marker);
        }

        diff.removed = self
            .markers
            .keys()
            .filter(|id| !next.contains_key(*id))
            .cloned()
            .collect();
        self.markers = next;
        diff
    }

    /// Drop every marker (render resources released); returns the removed ids
    pub fn clear(&mut self) -> Vec<FeatureId> {
        std::mem::take(&mut self.markers).into_keys().collect()
    }

    pub fn get(&self, id: &FeatureId) -> Option<&DrawnMarker> {
        self.markers.get(id)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}
