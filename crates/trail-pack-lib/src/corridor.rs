//! Corridor builder: the buffered area of interest around the reference trail

use crate::config::CorridorConfig;
use crate::utils::{self, LocalProjection};
use crate::{PackError, Result, geojson};

use geo::{
    Area, BooleanOps, BoundingRect, Buffer, Coord, Geometry, GeometryCollection, Intersects,
    LineString, MapCoords, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon, Rect,
    Simplify,
};

/// Immutable area of interest, in WGS84 (x = longitude, y = latitude)
#[derive(Debug, Clone)]
pub struct Corridor {
    polygon: MultiPolygon<f64>,
    bounds: Rect<f64>,
    reference: MultiLineString<f64>,
    buffer_radius_m: f64,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl Corridor {
    /// Buffer the reference trail by the configured radius.
    ///
    /// The buffer is computed in a local equirectangular projection centred on the trail so the
    /// radius is honoured in meters, then simplified and projected back to WGS84.
    pub fn build(reference: &MultiLineString<f64>, config: &CorridorConfig) -> Result<Self> {
        #[cfg(feature = "profiling")]
        profiling::scope!("corridor::build");

        if !(config.buffer_radius_m.is_finite() && config.buffer_radius_m > 0.0) {
            return Err(PackError::InvalidConfig(format!(
                "buffer radius must be > 0 (got {})",
                config.buffer_radius_m
            )));
        }

        let reference = sanitize_reference(reference)?;
        let reference_bounds = reference.bounding_rect().ok_or_else(|| {
            PackError::InputGeometry("reference geometry has no extent".to_string())
        })?;

        let projection = LocalProjection::centered_on(reference_bounds);
        let projected = reference.map_coords(|c| projection.project(c));
        let buffered = projected.buffer(config.buffer_radius_m);

        let tolerance = config.effective_simplify_tolerance();
        let outline = if tolerance > 0.0 {
            simplify_outline(&buffered, tolerance)
        } else {
            buffered
        };

        let polygon = outline.map_coords(|c| projection.unproject(c));
        let bounds = polygon.bounding_rect().ok_or_else(|| {
            PackError::DegenerateGeometry("buffered corridor is empty".to_string())
        })?;

        tracing::info!(
            "Corridor built: radius {:.0} m, {} polygon(s), bounds W {:.5} S {:.5} E {:.5} N {:.5}",
            config.buffer_radius_m,
            polygon.0.len(),
            bounds.min().x,
            bounds.min().y,
            bounds.max().x,
            bounds.max().y
        );

        Ok(Self {
            polygon,
            bounds,
            reference,
            buffer_radius_m: config.buffer_radius_m,
        })
    }

    pub fn polygon(&self) -> &MultiPolygon<f64> {
        &self.polygon
    }

    /// Bounding box (west/south as min, east/north as max)
    pub fn bounds(&self) -> Rect<f64> {
        self.bounds
    }

    pub fn reference(&self) -> &MultiLineString<f64> {
        &self.reference
    }

    pub fn buffer_radius_m(&self) -> f64 {
        self.buffer_radius_m
    }

    /// Length of the reference trail in meters
    pub fn reference_length_m(&self) -> f64 {
        self.reference
            .0
            .iter()
            .map(|line| utils::geodesic_length(&line.0))
            .sum()
    }

    /// Whether the coordinate lies inside or on the corridor
    pub fn contains_coord(&self, coord: Coord<f64>) -> bool {
        rect_contains(self.bounds, coord) && self.polygon.intersects(&Point::from(coord))
    }

    /// Clip a geometry to the corridor.
    ///
    /// Points are kept by containment, lines are cut with the corridor outline and polygons
    /// are intersected with it. Returns `None` when nothing is left.
    pub fn clip(&self, geometry: &Geometry<f64>) -> Option<Geometry<f64>> {
        let bounds = geometry.bounding_rect()?;
        if !self.bounds.intersects(&bounds) {
            return None;
        }

        match geometry {
            Geometry::Point(p) => self.contains_coord(p.0).then_some(Geometry::Point(*p)),
            Geometry::MultiPoint(mp) => {
                let kept: Vec<Point<f64>> = mp
                    .0
                    .iter()
                    .copied()
                    .filter(|p| self.contains_coord(p.0))
                    .collect();
                match kept.len() {
                    0 => None,
                    1 => Some(Geometry::Point(kept[0])),
                    _ => Some(Geometry::MultiPoint(MultiPoint(kept))),
                }
            }
            Geometry::Line(line) => self.clip_lines(MultiLineString::new(vec![LineString::new(
                vec![line.start, line.end],
            )])),
            Geometry::LineString(ls) => self.clip_lines(MultiLineString::new(vec![ls.clone()])),
            Geometry::MultiLineString(mls) => self.clip_lines(mls.clone()),
            Geometry::Polygon(p) => self.clip_polygons(MultiPolygon::new(vec![p.clone()])),
            Geometry::MultiPolygon(mp) => self.clip_polygons(mp.clone()),
            Geometry::Rect(r) => self.clip_polygons(MultiPolygon::new(vec![r.to_polygon()])),
            Geometry::Triangle(t) => self.clip_polygons(MultiPolygon::new(vec![t.to_polygon()])),
            Geometry::GeometryCollection(gc) => {
                let mut parts: Vec<Geometry<f64>> =
                    gc.0.iter().filter_map(|g| self.clip(g)).collect();
                match parts.len() {
                    0 => None,
                    1 => parts.pop(),
                    _ => Some(Geometry::GeometryCollection(GeometryCollection(parts))),
                }
            }
        }
    }

    fn clip_lines(&self, lines: MultiLineString<f64>) -> Option<Geometry<f64>> {
        let clipped = self.polygon.clip(&lines, false);
        let mut parts: Vec<LineString<f64>> = clipped
            .0
            .into_iter()
            .filter(|ls| ls.0.len() >= 2)
            .collect();
        match parts.len() {
            0 => None,
            1 => parts.pop().map(Geometry::LineString),
            _ => Some(Geometry::MultiLineString(MultiLineString::new(parts))),
        }
    }

    fn clip_polygons(&self, polygons: MultiPolygon<f64>) -> Option<Geometry<f64>> {
        let mut clipped = self.polygon.intersection(&polygons);
        clipped.0.retain(|p| p.unsigned_area() > 0.0);
        match clipped.0.len() {
            0 => None,
            1 => clipped.0.pop().map(Geometry::Polygon),
            _ => Some(Geometry::MultiPolygon(clipped)),
        }
    }

    /// GeoJSON FeatureCollection with the corridor polygon
    pub fn to_geojson(&self) -> serde_json::Value {
        let properties = serde_json::json!({
            "buffer_radius_m": self.buffer_radius_m,
            "reference_length_m": self.reference_length_m(),
        });
        geojson::feature_collection(vec![geojson::feature(
            None,
            &Geometry::MultiPolygon(self.polygon.clone()),
            properties,
        )])
    }
}

fn rect_contains(rect: Rect<f64>, coord: Coord<f64>) -> bool {
    coord.x >= rect.min().x
        && coord.x <= rect.max().x
        && coord.y >= rect.min().y
        && coord.y <= rect.max().y
}

/// Drop invalid coordinates and consecutive duplicates, keep lines with two or more points
fn sanitize_reference(reference: &MultiLineString<f64>) -> Result<MultiLineString<f64>> {
    let mut lines = Vec::with_capacity(reference.0.len());
    for (index, line) in reference.0.iter().enumerate() {
        if let Some(bad) = line.0.iter().find(|c| !utils::is_valid_lon_lat(**c)) {
            return Err(PackError::InputGeometry(format!(
                "line {index} has an invalid coordinate ({}, {})",
                bad.x, bad.y
            )));
        }
        let mut coords: Vec<Coord<f64>> = line.0.clone();
        coords.dedup();
        if coords.len() >= 2 {
            lines.push(LineString::new(coords));
        } else {
            tracing::debug!("Ignoring reference line {} with fewer than 2 points", index);
        }
    }
    if lines.is_empty() {
        return Err(PackError::InputGeometry(
            "reference geometry has no line with at least 2 distinct points".to_string(),
        ));
    }
    Ok(MultiLineString::new(lines))
}

/// Simplify the buffered outline, keeping the raw buffer if simplification damages it
fn simplify_outline(buffered: &MultiPolygon<f64>, tolerance: f64) -> MultiPolygon<f64> {
    let simplified = buffered.simplify(tolerance);
    let intact = simplified.0.len() == buffered.0.len()
        && simplified.0.iter().all(|p: &Polygon<f64>| p.exterior().0.len() >= 4)
        && simplified.unsigned_area() >= 0.5 * buffered.unsigned_area();
    if intact {
        simplified
    } else {
        tracing::debug!("Corridor simplification degenerated, keeping the raw buffer");
        buffered.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn straight_trail() -> MultiLineString<f64> {
        // Roughly 1.6 km west-east at 44N
        MultiLineString::new(vec![LineString::from(vec![(-72.81, 44.0), (-72.79, 44.0)])])
    }

    fn corridor(radius: f64) -> Corridor {
        let config = CorridorConfig {
            buffer_radius_m: radius,
            ..CorridorConfig::default()
        };
        Corridor::build(&straight_trail(), &config).unwrap()
    }

    #[test]
    fn test_corridor_contains_reference() {
        let corridor = corridor(500.0);
        for coord in &corridor.reference().0[0].0 {
            assert!(corridor.contains_coord(*coord));
        }
    }

    #[test]
    fn test_corridor_respects_radius() {
        let corridor = corridor(500.0);
        // ~0.0027 deg latitude is ~300 m: inside. ~0.0072 deg is ~800 m: outside.
        assert!(corridor.contains_coord(Coord { x: -72.80, y: 44.0027 }));
        assert!(!corridor.contains_coord(Coord { x: -72.80, y: 44.0072 }));

        let height_m = (corridor.bounds().height()) * 111_195.0;
        assert!((height_m - 1000.0).abs() < 60.0, "height {height_m}");
    }

    #[test]
    fn test_empty_reference_is_input_error() {
        let degenerate = MultiLineString::new(vec![LineString::from(vec![(1.0, 1.0), (1.0, 1.0)])]);
        assert!(matches!(
            Corridor::build(&degenerate, &CorridorConfig::default()),
            Err(PackError::InputGeometry(_))
        ));

        let invalid = MultiLineString::new(vec![LineString::from(vec![(1.0, 95.0), (1.0, 1.0)])]);
        assert!(matches!(
            Corridor::build(&invalid, &CorridorConfig::default()),
            Err(PackError::InputGeometry(_))
        ));
    }

    #[test]
    fn test_clip_line_crossing_corridor() {
        let corridor = corridor(500.0);
        // North-south line much longer than the corridor is wide
        let line = Geometry::LineString(LineString::from(vec![(-72.80, 43.98), (-72.80, 44.02)]));
        let clipped = corridor.clip(&line).unwrap();
        let bounds = clipped.bounding_rect().unwrap();
        assert!(bounds.min().y > 43.99 && bounds.max().y < 44.01);
    }

    #[test]
    fn test_clip_drops_outside_geometry() {
        let corridor = corridor(500.0);
        let far_point = Geometry::Point(Point::new(-72.0, 45.0));
        assert!(corridor.clip(&far_point).is_none());

        let near_point = Geometry::Point(Point::new(-72.80, 44.001));
        assert!(corridor.clip(&near_point).is_some());
    }

    #[test]
    fn test_clip_polygon_is_intersected() {
        let corridor = corridor(500.0);
        let big = Geometry::Polygon(Polygon::new(
            LineString::from(vec![
                (-72.80, 43.9),
                (-72.70, 43.9),
                (-72.70, 44.1),
                (-72.80, 44.1),
                (-72.80, 43.9),
            ]),
            vec![],
        ));
        let clipped = corridor.clip(&big).unwrap();
        let bounds = clipped.bounding_rect().unwrap();
        assert!(bounds.min().x >= -72.8001);
        assert!(bounds.max().x <= corridor.bounds().max().x + 1e-9);
        assert!(bounds.height() < 0.02);
    }
}
