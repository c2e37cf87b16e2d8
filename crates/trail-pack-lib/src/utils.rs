//! Utility functions for coordinate conversions, tile math and distances

use geo::{Coord, Distance, Haversine, Point, Rect};

/// Web Mercator bounds in meters (EPSG:3857)
pub const EARTH_MERCATOR_MAX: f64 = 20037508.34;
pub const EARTH_MERCATOR_MIN: f64 = -20037508.34;
pub const EARTH_SIZE_METERS: f64 = EARTH_MERCATOR_MAX - EARTH_MERCATOR_MIN;

/// Maximum latitude that can be represented in Web Mercator
pub const MAX_LATITUDE: f64 = 85.05112878;

/// Deepest zoom level a tile coordinate can address
pub const MAX_ZOOM: u8 = 22;

/// Mean Earth radius in meters, matching the radius used by [`Haversine`]
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Precomputed constant: EARTH_MERCATOR_MAX / 180.0
const LON_TO_X_FACTOR: f64 = EARTH_MERCATOR_MAX / 180.0;

/// Precomputed constant: EARTH_MERCATOR_MAX / PI
const Y_FACTOR: f64 = EARTH_MERCATOR_MAX / std::f64::consts::PI;

/// Precomputed constant: 180.0 / EARTH_MERCATOR_MAX
const X_TO_LON_FACTOR: f64 = 180.0 / EARTH_MERCATOR_MAX;

/// Precomputed constant: PI / EARTH_MERCATOR_MAX
const Y_TO_LAT_FACTOR: f64 = std::f64::consts::PI / EARTH_MERCATOR_MAX;

/// Convert WGS84 (lat, lon) to Web Mercator (x, y) in meters
///
/// # Arguments
/// * `lat` - Latitude in degrees (-85.05 to 85.05)
/// * `lon` - Longitude in degrees (-180 to 180)
///
/// # Returns
/// A `Point<f64>` with x (easting) and y (northing) in meters
#[inline(always)]
pub fn wgs84_to_mercator(lat: f64, lon: f64) -> Point<f64> {
    // Clamp latitude to valid Web Mercator range
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);

    let x = lon * LON_TO_X_FACTOR;
    let lat_rad = lat.to_radians();
    let y = (lat_rad.tan() + (1.0 / lat_rad.cos())).ln() * Y_FACTOR;

    Point::new(x, y)
}

/// Convert a geographic coordinate (x = lon, y = lat) to a Web Mercator coordinate
#[inline(always)]
pub fn coord_to_mercator(coord: Coord<f64>) -> Coord<f64> {
    wgs84_to_mercator(coord.y, coord.x).into()
}

/// Convert Web Mercator (x, y) in meters to WGS84 (lat, lon)
///
/// # Returns
/// A tuple of (latitude, longitude) in degrees
#[inline(always)]
pub fn mercator_to_wgs84(x: f64, y: f64) -> (f64, f64) {
    let lon = x * X_TO_LON_FACTOR;
    let lat =
        (std::f64::consts::PI / 2.0 - 2.0 * ((-y * Y_TO_LAT_FACTOR).exp()).atan()).to_degrees();
    (lat, lon)
}

/// Check that a geographic coordinate is finite and inside lon/lat ranges
#[inline]
pub fn is_valid_lon_lat(coord: Coord<f64>) -> bool {
    coord.x.is_finite()
        && coord.y.is_finite()
        && (-180.0..=180.0).contains(&coord.x)
        && (-90.0..=90.0).contains(&coord.y)
}

/// Edge length of a tile at `zoom`, in Web Mercator meters
#[inline]
pub fn tile_size_meters(zoom: u8) -> f64 {
    EARTH_SIZE_METERS / (1u64 << zoom) as f64
}

/// Number of tiles along one axis at `zoom`
#[inline]
pub fn tiles_per_axis(zoom: u8) -> u32 {
    1u32 << zoom
}

/// Bounding box of tile (zoom, x, y) in Web Mercator meters.
///
/// Tile rows grow southwards (XYZ convention), so row 0 touches `EARTH_MERCATOR_MAX`.
pub fn tile_bounds_mercator(zoom: u8, x: u32, y: u32) -> Rect<f64> {
    let size = tile_size_meters(zoom);
    let min_x = EARTH_MERCATOR_MIN + x as f64 * size;
    let max_y = EARTH_MERCATOR_MAX - y as f64 * size;
    Rect::new(
        Coord {
            x: min_x,
            y: max_y - size,
        },
        Coord {
            x: min_x + size,
            y: max_y,
        },
    )
}

/// Tile column/row containing the Web Mercator coordinate, clamped to the valid range
pub fn mercator_to_tile(zoom: u8, coord: Coord<f64>) -> (u32, u32) {
    let size = tile_size_meters(zoom);
    let last = (tiles_per_axis(zoom) - 1) as f64;
    let x = ((coord.x - EARTH_MERCATOR_MIN) / size).floor().clamp(0.0, last);
    let y = ((EARTH_MERCATOR_MAX - coord.y) / size).floor().clamp(0.0, last);
    (x as u32, y as u32)
}

/// Inclusive tile ranges `(x0..=x1, y0..=y1)` covering a Web Mercator rectangle
pub fn tile_range_for_rect(zoom: u8, rect: Rect<f64>) -> (u32, u32, u32, u32) {
    let (x0, y0) = mercator_to_tile(
        zoom,
        Coord {
            x: rect.min().x,
            y: rect.max().y,
        },
    );
    let (x1, y1) = mercator_to_tile(
        zoom,
        Coord {
            x: rect.max().x,
            y: rect.min().y,
        },
    );
    (x0, x1, y0, y1)
}

/// Great-circle distance in meters between two geographic coordinates
#[inline]
pub fn haversine_distance(a: Coord<f64>, b: Coord<f64>) -> f64 {
    Haversine.distance(Point::from(a), Point::from(b))
}

/// Geodesic length of a geographic polyline in meters
pub fn geodesic_length(coords: &[Coord<f64>]) -> f64 {
    coords
        .windows(2)
        .map(|pair| haversine_distance(pair[0], pair[1]))
        .sum()
}

/// Equirectangular projection centred on an origin, in meters.
///
/// Accurate to well under a percent over corridor-sized areas, which is all the buffering,
/// snapping and intersection steps need.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalProjection {
    origin: Coord<f64>,
    meters_per_degree_x: f64,
    meters_per_degree_y: f64,
}

impl LocalProjection {
    pub fn new(origin: Coord<f64>) -> Self {
        let meters_per_degree_y = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;
        let meters_per_degree_x = meters_per_degree_y * origin.y.to_radians().cos().max(1e-6);
        Self {
            origin,
            meters_per_degree_x,
            meters_per_degree_y,
        }
    }

    /// Projection centred on the middle of a geographic rectangle
    pub fn centered_on(rect: Rect<f64>) -> Self {
        Self::new(rect.center())
    }

    /// Geographic (lon, lat) to local meters
    #[inline]
    pub fn project(&self, coord: Coord<f64>) -> Coord<f64> {
        Coord {
            x: (coord.x - self.origin.x) * self.meters_per_degree_x,
            y: (coord.y - self.origin.y) * self.meters_per_degree_y,
        }
    }

    /// Local meters back to geographic (lon, lat)
    #[inline]
    pub fn unproject(&self, coord: Coord<f64>) -> Coord<f64> {
        Coord {
            x: coord.x / self.meters_per_degree_x + self.origin.x,
            y: coord.y / self.meters_per_degree_y + self.origin.y,
        }
    }

    /// Meters covered by one degree of longitude / latitude at the origin
    #[inline]
    pub fn meters_per_degree(&self) -> (f64, f64) {
        (self.meters_per_degree_x, self.meters_per_degree_y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wgs84_to_mercator_origin() {
        let point = wgs84_to_mercator(0.0, 0.0);
        assert!((point.x() - 0.0).abs() < 0.01);
        assert!((point.y() - 0.0).abs() < 0.01);
    }

    #[test]
    fn test_wgs84_to_mercator_bounds() {
        let west = wgs84_to_mercator(0.0, -180.0);
        assert!((west.x() - EARTH_MERCATOR_MIN).abs() < 1.0);

        let east = wgs84_to_mercator(0.0, 180.0);
        assert!((east.x() - EARTH_MERCATOR_MAX).abs() < 1.0);
    }

    #[test]
    fn test_mercator_to_wgs84_roundtrip() {
        let lat = 44.5588;
        let lon = -72.5778;

        let mercator = wgs84_to_mercator(lat, lon);
        let (lat2, lon2) = mercator_to_wgs84(mercator.x(), mercator.y());

        assert!((lat - lat2).abs() < 0.0001);
        assert!((lon - lon2).abs() < 0.0001);
    }

    #[test]
    fn test_tile_bounds_cover_world_at_zoom_zero() {
        let bounds = tile_bounds_mercator(0, 0, 0);
        assert!((bounds.min().x - EARTH_MERCATOR_MIN).abs() < 1e-6);
        assert!((bounds.max().y - EARTH_MERCATOR_MAX).abs() < 1e-6);
        assert!((bounds.width() - EARTH_SIZE_METERS).abs() < 1e-6);
    }

    #[test]
    fn test_mercator_to_tile_matches_xyz_convention() {
        // Null Island sits at the corner of the four central tiles
        let origin = coord_to_mercator(Coord { x: 0.001, y: -0.001 });
        assert_eq!(mercator_to_tile(1, origin), (1, 1));

        // Burlington, VT at zoom 10
        let btv = coord_to_mercator(Coord {
            x: -73.2121,
            y: 44.4759,
        });
        assert_eq!(mercator_to_tile(10, btv), (303, 370));
    }

    #[test]
    fn test_mercator_to_tile_clamps() {
        let far = Coord {
            x: EARTH_MERCATOR_MAX * 2.0,
            y: EARTH_MERCATOR_MIN * 2.0,
        };
        assert_eq!(mercator_to_tile(3, far), (7, 7));
    }

    #[test]
    fn test_tile_bounds_contain_their_own_coordinate() {
        let zoom = 12;
        let coord = coord_to_mercator(Coord { x: 7.65, y: 45.97 });
        let (x, y) = mercator_to_tile(zoom, coord);
        let bounds = tile_bounds_mercator(zoom, x, y);
        assert!(coord.x >= bounds.min().x && coord.x <= bounds.max().x);
        assert!(coord.y >= bounds.min().y && coord.y <= bounds.max().y);
    }

    #[test]
    fn test_haversine_one_degree_latitude() {
        let d = haversine_distance(Coord { x: 0.0, y: 0.0 }, Coord { x: 0.0, y: 1.0 });
        assert!((d - 111_195.0).abs() < 10.0);
    }

    #[test]
    fn test_local_projection_roundtrip() {
        let projection = LocalProjection::new(Coord { x: -72.8, y: 44.0 });
        let coord = Coord { x: -72.81, y: 44.02 };
        let back = projection.unproject(projection.project(coord));
        assert!((back.x - coord.x).abs() < 1e-12);
        assert!((back.y - coord.y).abs() < 1e-12);
    }

    #[test]
    fn test_local_projection_agrees_with_haversine() {
        let projection = LocalProjection::new(Coord { x: -72.8, y: 44.0 });
        let a = Coord { x: -72.8, y: 44.0 };
        let b = Coord { x: -72.79, y: 44.005 };
        let pa = projection.project(a);
        let pb = projection.project(b);
        let planar = ((pa.x - pb.x).powi(2) + (pa.y - pb.y).powi(2)).sqrt();
        let geodesic = haversine_distance(a, b);
        assert!((planar - geodesic).abs() / geodesic < 1e-3);
    }
}
