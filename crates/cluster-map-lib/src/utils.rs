//! Utility functions for coordinate conversions and spatial operations
//!
//! The clustering index works in *normalized* Web Mercator space, where the whole
//! world maps to the unit square `[0, 1] x [0, 1]` (x grows eastwards, y grows
//! southwards like tile coordinates). Pixel distances at a zoom level are then a
//! simple scale: one unit equals `TILE_SIZE * 2^zoom` pixels.

use geo::{Coord, Rect};

/// Maximum latitude that can be represented in Web Mercator
pub const MAX_LATITUDE: f64 = 85.05112878;

/// Size in pixels of a map tile at zoom 0
pub const TILE_SIZE: f64 = 256.0;

/// Project a longitude onto the normalized `[0, 1]` x axis
#[inline(always)]
pub fn lon_to_x(lon: f64) -> f64 {
    lon / 360.0 + 0.5
}

/// Project a latitude onto the normalized `[0, 1]` y axis (north is 0)
#[inline(always)]
pub fn lat_to_y(lat: f64) -> f64 {
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    let sin = lat.to_radians().sin();
    let y = 0.5 - 0.25 * ((1.0 + sin) / (1.0 - sin)).ln() / std::f64::consts::PI;
    y.clamp(0.0, 1.0)
}

/// Inverse of [`lon_to_x`]
#[inline(always)]
pub fn x_to_lon(x: f64) -> f64 {
    (x - 0.5) * 360.0
}

/// Inverse of [`lat_to_y`]
#[inline(always)]
pub fn y_to_lat(y: f64) -> f64 {
    let y2 = (180.0 - y * 360.0).to_radians();
    360.0 * y2.exp().atan() / std::f64::consts::PI - 90.0
}

/// Project WGS84 (lat, lon) onto the normalized unit square
#[inline(always)]
pub fn project(lat: f64, lon: f64) -> Coord<f64> {
    Coord {
        x: lon_to_x(lon),
        y: lat_to_y(lat),
    }
}

/// Convert a normalized coordinate back to WGS84 `(lat, lon)`
#[inline(always)]
pub fn unproject(coord: Coord<f64>) -> (f64, f64) {
    (y_to_lat(coord.y), x_to_lon(coord.x))
}

/// Convert a pixel distance at `zoom` into normalized units
#[inline(always)]
pub fn pixels_to_normalized(pixels: f64, zoom: f64) -> f64 {
    pixels / (TILE_SIZE * 2f64.powf(zoom))
}

/// Check whether a latitude/longitude pair is a usable coordinate
#[inline(always)]
pub fn is_valid_wgs84(lat: f64, lon: f64) -> bool {
    lat.is_finite()
        && lon.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lon)
}

/// Inclusive containment test for a coordinate in a rectangle
#[inline(always)]
pub fn rect_contains(rect: &Rect<f64>, coord: Coord<f64>) -> bool {
    let min = rect.min();
    let max = rect.max();
    coord.x >= min.x && coord.x <= max.x && coord.y >= min.y && coord.y <= max.y
}

/// Inclusive test for `inner` lying completely inside `outer`
#[inline(always)]
pub fn rect_covers(outer: &Rect<f64>, inner: &Rect<f64>) -> bool {
    rect_contains(outer, inner.min()) && rect_contains(outer, inner.max())
}

/// Inclusive intersection test (touching edges count as intersecting)
#[inline(always)]
pub fn rects_intersect(a: &Rect<f64>, b: &Rect<f64>) -> bool {
    let (amin, amax) = (a.min(), a.max());
    let (bmin, bmax) = (b.min(), b.max());
    !(amax.x < bmin.x || amin.x > bmax.x || amax.y < bmin.y || amin.y > bmax.y)
}

/// Smallest rectangle containing both inputs
#[inline(always)]
pub fn rect_union(a: &Rect<f64>, b: &Rect<f64>) -> Rect<f64> {
    Rect::new(
        Coord {
            x: a.min().x.min(b.min().x),
            y: a.min().y.min(b.min().y),
        },
        Coord {
            x: a.max().x.max(b.max().x),
            y: a.max().y.max(b.max().y),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_projection_corners() {
        assert!((lon_to_x(-180.0) - 0.0).abs() < 1e-12);
        assert!((lon_to_x(180.0) - 1.0).abs() < 1e-12);
        assert!((lat_to_y(0.0) - 0.5).abs() < 1e-12);
        assert!(lat_to_y(MAX_LATITUDE) < 1e-6);
        assert!(lat_to_y(-MAX_LATITUDE) > 1.0 - 1e-6);
        // Beyond the Mercator limit the projection saturates
        assert_eq!(lat_to_y(89.0), lat_to_y(MAX_LATITUDE));
    }

    #[test]
    fn test_project_unproject_roundtrip() {
        for (lat, lon) in [(51.5074, -0.1278), (-33.86, 151.2), (0.0, 0.0), (64.1, -21.9)] {
            let (lat2, lon2) = unproject(project(lat, lon));
            assert!((lat - lat2).abs() < 1e-9, "lat {lat} -> {lat2}");
            assert!((lon - lon2).abs() < 1e-9, "lon {lon} -> {lon2}");
        }
    }

    #[test]
    fn test_pixels_to_normalized() {
        // At zoom 0 the world is exactly one tile wide
        assert!((pixels_to_normalized(TILE_SIZE, 0.0) - 1.0).abs() < 1e-12);
        // Every zoom level halves the normalized size of a pixel
        let z5 = pixels_to_normalized(80.0, 5.0);
        let z6 = pixels_to_normalized(80.0, 6.0);
        assert!((z5 / z6 - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_is_valid_wgs84() {
        assert!(is_valid_wgs84(45.0, 90.0));
        assert!(is_valid_wgs84(-90.0, 180.0));
        assert!(!is_valid_wgs84(90.1, 0.0));
        assert!(!is_valid_wgs84(0.0, -180.5));
        assert!(!is_valid_wgs84(f64::NAN, 0.0));
        assert!(!is_valid_wgs84(0.0, f64::INFINITY));
    }

    #[test]
    fn test_rect_helpers() {
        let outer = Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 10.0, y: 10.0 });
        let inner = Rect::new(Coord { x: 2.0, y: 2.0 }, Coord { x: 10.0, y: 5.0 });
        let apart = Rect::new(Coord { x: 11.0, y: 0.0 }, Coord { x: 12.0, y: 1.0 });
        assert!(rect_covers(&outer, &inner));
        assert!(!rect_covers(&inner, &outer));
        assert!(rects_intersect(&outer, &inner));
        assert!(!rects_intersect(&outer, &apart));
        let union = rect_union(&inner, &apart);
        assert_eq!(union.min(), Coord { x: 2.0, y: 0.0 });
        assert_eq!(union.max(), Coord { x: 12.0, y: 5.0 });
    }
}
