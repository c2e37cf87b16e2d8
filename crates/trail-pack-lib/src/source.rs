//! Readers for the materialized inputs: reference trail, tagged features and DEM grid

use crate::geojson;
use crate::{ElevationGrid, PackError, RawFeature, Result};

use geo::{Coord, Geometry, LineString, MultiLineString};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// OSM numbers share one space per element type, so the type goes in the top two bits of
/// a feature id. Ways and untyped ids keep their plain number.
const ID_NUMBER_MASK: u64 = (1 << 62) - 1;
const NODE_ID_TAG: u64 = 1 << 62;
const RELATION_ID_TAG: u64 = 2 << 62;
/// Ids handed to features that carry none
const SYNTHETIC_ID_BASE: u64 = 3 << 62;

fn is_gpx(path: &Path, text: &str) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("gpx") => true,
        Some(ext) if ext.eq_ignore_ascii_case("geojson") || ext.eq_ignore_ascii_case("json") => {
            false
        }
        _ => text.trim_start().starts_with('<'),
    }
}

/// Read the reference trail from a GPX (tracks and routes) or GeoJSON file
pub fn read_reference_geometry(path: impl AsRef<Path>) -> Result<MultiLineString<f64>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let lines = if is_gpx(path, &text) {
        parse_reference_gpx(&text)?
    } else {
        parse_reference_geojson(&text)?
    };
    tracing::info!(
        "Read reference geometry from {} ({} lines, {} points)",
        path.display(),
        lines.0.len(),
        lines.0.iter().map(|l| l.0.len()).sum::<usize>()
    );
    Ok(lines)
}

fn usable(lines: Vec<LineString<f64>>, origin: &str) -> Result<MultiLineString<f64>> {
    let lines: Vec<LineString<f64>> = lines.into_iter().filter(|l| l.0.len() >= 2).collect();
    if lines.is_empty() {
        return Err(PackError::InputGeometry(format!(
            "{origin} has no line with at least 2 points"
        )));
    }
    Ok(MultiLineString::new(lines))
}

/// Track segments and routes of a GPX document, one line each
pub fn parse_reference_gpx(text: &str) -> Result<MultiLineString<f64>> {
    let data = gpx::read(text.as_bytes())?;
    let mut lines = Vec::new();
    for track in &data.tracks {
        for segment in &track.segments {
            lines.push(LineString::new(
                segment.points.iter().map(|w| w.point().0).collect(),
            ));
        }
    }
    for route in &data.routes {
        lines.push(LineString::new(
            route.points.iter().map(|w| w.point().0).collect(),
        ));
    }
    usable(lines, "GPX reference")
}

fn collect_lines(geometry: Geometry<f64>, out: &mut Vec<LineString<f64>>) {
    match geometry {
        Geometry::LineString(ls) => out.push(ls),
        Geometry::MultiLineString(mls) => out.extend(mls.0),
        Geometry::Line(l) => out.push(LineString::new(vec![l.start, l.end])),
        Geometry::GeometryCollection(gc) => {
            for g in gc.0 {
                collect_lines(g, out);
            }
        }
        _ => {}
    }
}

/// Line work of a GeoJSON Geometry, Feature or FeatureCollection
pub fn parse_reference_geojson(text: &str) -> Result<MultiLineString<f64>> {
    let mut lines = Vec::new();
    for feature in geojson::parse_features(text)? {
        if let Some(geometry) = feature.geometry {
            collect_lines(geometry.into_geo()?, &mut lines);
        }
    }
    usable(lines, "GeoJSON reference")
}

/// Plain number from a JSON value: a non-negative number, or the digits after the last `/`
/// (`relation/123`)
fn parse_number(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let digits = s
                .rsplit('/')
                .next()?
                .trim_start_matches(|c: char| c.is_ascii_alphabetic());
            digits.parse().ok()
        }
        _ => None,
    }
}

/// Feature id from a JSON value, tagged with the element type of `node/..` and
/// `relation/..` (also `n123`/`r123`). Negative ids (unsaved edits) are not usable.
fn parse_element_id(value: &Value) -> Option<u64> {
    let number = parse_number(value)?;
    if number > ID_NUMBER_MASK {
        return None;
    }
    let kind = match value {
        Value::String(s) => s
            .rsplit('/')
            .nth(1)
            .map(str::to_ascii_lowercase)
            .or_else(|| s.chars().next().map(|c| c.to_ascii_lowercase().to_string())),
        _ => None,
    };
    Some(match kind.as_deref() {
        Some("node" | "n") => NODE_ID_TAG | number,
        Some("relation" | "r") => RELATION_ID_TAG | number,
        _ => number,
    })
}

fn tag_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "yes" } else { "no" }.to_string()),
        _ => None,
    }
}

/// Parse one GeoJSON document of tagged features. `first_index` seeds the ids of features
/// that have none, so several files can be read without collisions.
pub fn parse_features(text: &str, first_index: usize) -> Result<Vec<RawFeature>> {
    let mut features = Vec::new();
    for (offset, feature) in geojson::parse_features(text)?.into_iter().enumerate() {
        let Some(geometry) = feature.geometry else {
            continue;
        };
        let geometry = match geometry.into_geo() {
            Ok(geometry) => geometry,
            Err(err) => {
                tracing::warn!("Skipping feature #{}: {}", first_index + offset, err);
                continue;
            }
        };
        let properties = feature.properties.unwrap_or_default();

        let id = feature
            .id
            .as_ref()
            .and_then(parse_element_id)
            .or_else(|| properties.get("@id").and_then(parse_element_id))
            .or_else(|| properties.get("osm_id").and_then(parse_element_id))
            .unwrap_or(SYNTHETIC_ID_BASE + (first_index + offset) as u64);

        let relations = match properties.get("@relations") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| match item {
                    Value::Object(member) => member.get("rel").and_then(parse_number),
                    other => parse_number(other),
                })
                .collect(),
            _ => Vec::new(),
        };

        let tags: BTreeMap<String, String> = properties
            .iter()
            .filter(|(key, _)| !key.starts_with('@') && key.as_str() != "osm_id")
            .filter_map(|(key, value)| tag_value(value).map(|v| (key.clone(), v)))
            .collect();

        features.push(RawFeature {
            id,
            geometry,
            tags,
            relations,
        });
    }
    Ok(features)
}

/// Read every feature file in order
pub fn read_features<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<RawFeature>> {
    let mut features: Vec<RawFeature> = Vec::new();
    for path in paths {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let parsed = parse_features(&text, features.len())?;
        tracing::info!("Read {} features from {}", parsed.len(), path.display());
        features.extend(parsed);
    }
    Ok(features)
}

/// Read an ESRI ASCII grid (`AAIGrid`) in geographic coordinates
pub fn read_ascii_grid(path: impl AsRef<Path>) -> Result<ElevationGrid> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let grid = parse_ascii_grid(&text)?;
    let bounds = grid.bounds();
    tracing::info!(
        "Read DEM {} ({}x{} cells, W {:.5} S {:.5} E {:.5} N {:.5})",
        path.display(),
        grid.cols(),
        grid.rows(),
        bounds.min().x,
        bounds.min().y,
        bounds.max().x,
        bounds.max().y
    );
    Ok(grid)
}

/// Parse the text of an ESRI ASCII grid
pub fn parse_ascii_grid(text: &str) -> Result<ElevationGrid> {
    let raster_err = |msg: String| PackError::Raster(msg);
    let mut header: BTreeMap<String, f64> = BTreeMap::new();
    let mut tokens = text.split_whitespace().peekable();

    // Header: `key value` pairs until the first numeric token
    while let Some(token) = tokens.peek() {
        if token.parse::<f64>().is_ok() {
            break;
        }
        let key = token.to_ascii_lowercase();
        tokens.next();
        let value = tokens
            .next()
            .ok_or_else(|| raster_err(format!("header key '{key}' has no value")))?;
        let value: f64 = value
            .parse()
            .map_err(|_| raster_err(format!("header '{key}' has non-numeric value '{value}'")))?;
        header.insert(key, value);
    }

    let get = |key: &str| header.get(key).copied();
    let count = |key: &str| -> Result<usize> {
        match get(key) {
            Some(v) if v >= 1.0 && v.fract() == 0.0 => Ok(v as usize),
            Some(v) => Err(raster_err(format!("invalid {key} {v}"))),
            None => Err(raster_err(format!("missing {key} in header"))),
        }
    };
    let cols = count("ncols")?;
    let rows = count("nrows")?;
    let (dx, dy) = match (get("cellsize"), get("dx"), get("dy")) {
        (Some(size), _, _) => (size, size),
        (None, Some(dx), Some(dy)) => (dx, dy),
        _ => return Err(raster_err("missing cellsize in header".to_string())),
    };
    let west = match (get("xllcorner"), get("xllcenter")) {
        (Some(x), _) => x,
        (None, Some(x)) => x - dx / 2.0,
        _ => return Err(raster_err("missing xllcorner in header".to_string())),
    };
    let south = match (get("yllcorner"), get("yllcenter")) {
        (Some(y), _) => y,
        (None, Some(y)) => y - dy / 2.0,
        _ => return Err(raster_err("missing yllcorner in header".to_string())),
    };
    let nodata = get("nodata_value");

    let values: Vec<f64> = tokens
        .map(|t| {
            t.parse::<f64>()
                .map_err(|_| raster_err(format!("invalid cell value '{t}'")))
        })
        .collect::<Result<_>>()?;

    ElevationGrid::new(
        west,
        south + rows as f64 * dy,
        dx,
        dy,
        cols,
        rows,
        values,
        nodata,
    )
}

/// Reference line from a list of `(lon, lat)` pairs
pub fn line_from_lon_lat(points: &[(f64, f64)]) -> MultiLineString<f64> {
    MultiLineString::new(vec![LineString::new(
        points.iter().map(|&(x, y)| Coord { x, y }).collect(),
    )])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const GPX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="test" xmlns="http://www.topografix.com/GPX/1/1">
  <trk>
    <name>Long Trail</name>
    <trkseg>
      <trkpt lat="44.5000" lon="-72.8000"></trkpt>
      <trkpt lat="44.5050" lon="-72.8010"></trkpt>
      <trkpt lat="44.5100" lon="-72.8030"></trkpt>
    </trkseg>
    <trkseg>
      <trkpt lat="44.6000" lon="-72.8000"></trkpt>
    </trkseg>
  </trk>
  <rte>
    <rtept lat="44.5100" lon="-72.8030"></rtept>
    <rtept lat="44.5200" lon="-72.8100"></rtept>
  </rte>
</gpx>"#;

    #[test]
    fn test_gpx_tracks_and_routes() {
        let lines = parse_reference_gpx(GPX).unwrap();
        // The single-point segment is ignored
        assert_eq!(lines.0.len(), 2);
        assert_eq!(lines.0[0].0.len(), 3);
        assert_eq!(lines.0[0].0[0], Coord { x: -72.8, y: 44.5 });
        assert_eq!(lines.0[1].0.len(), 2);
    }

    #[test]
    fn test_geojson_reference() {
        let text = r#"{"type": "Feature", "properties": {},
            "geometry": {"type": "MultiLineString", "coordinates": [[[-72.8, 44.5], [-72.81, 44.51]], [[-72.9, 44.6]]]}}"#;
        let lines = parse_reference_geojson(text).unwrap();
        assert_eq!(lines.0.len(), 1);

        let point = r#"{"type": "Point", "coordinates": [-72.8, 44.5]}"#;
        assert!(matches!(
            parse_reference_geojson(point),
            Err(PackError::InputGeometry(_))
        ));
    }

    #[test]
    fn test_gpx_detection() {
        assert!(is_gpx(Path::new("trail.GPX"), "{}"));
        assert!(!is_gpx(Path::new("trail.geojson"), "<gpx>"));
        assert!(is_gpx(Path::new("trail"), "  <?xml version=\"1.0\"?>"));
    }

    #[test]
    fn test_feature_ids_tags_and_relations() {
        let text = r#"{"type": "FeatureCollection", "features": [
            {"type": "Feature", "id": "way/4242",
             "properties": {"highway": "path", "name": "Long Trail", "lit": false, "width": 1.5,
                            "@relations": [{"rel": 391736, "role": ""}, 17]},
             "geometry": {"type": "LineString", "coordinates": [[-72.8, 44.5], [-72.81, 44.51]]}},
            {"type": "Feature", "properties": {"@id": "node/77", "natural": "peak", "ele": 1339},
             "geometry": {"type": "Point", "coordinates": [-72.81, 44.54]}},
            {"type": "Feature", "properties": {"osm_id": 12},
             "geometry": {"type": "Point", "coordinates": [-72.8, 44.5]}},
            {"type": "Feature", "properties": {"tourism": "camp_site"},
             "geometry": {"type": "Point", "coordinates": [-72.8, 44.5]}},
            {"type": "Feature", "properties": {"note": "no geometry"}, "geometry": null}
        ]}"#;
        let features = parse_features(text, 10).unwrap();
        assert_eq!(features.len(), 4);

        assert_eq!(features[0].id, 4242);
        assert_eq!(features[0].tag("highway"), Some("path"));
        assert_eq!(features[0].tag("lit"), Some("no"));
        assert_eq!(features[0].tag("width"), Some("1.5"));
        assert_eq!(features[0].tag("@relations"), None);
        assert_eq!(features[0].relations, vec![391736, 17]);

        assert_eq!(features[1].id, NODE_ID_TAG | 77);
        assert_eq!(features[1].tag("ele"), Some("1339"));
        assert_eq!(features[1].tag("@id"), None);
        assert_eq!(features[2].id, 12);
        assert_eq!(features[2].tag("osm_id"), None);
        assert_eq!(features[3].id, SYNTHETIC_ID_BASE + 13);
    }

    #[test]
    fn test_element_type_is_part_of_the_id() {
        let ids: Vec<Option<u64>> = [
            json!("node/5"),
            json!("way/5"),
            json!("relation/5"),
            json!("n5"),
            json!("r5"),
            json!(5),
            json!(-5),
            json!("way/abc"),
        ]
        .iter()
        .map(parse_element_id)
        .collect();
        assert_eq!(
            ids,
            vec![
                Some(NODE_ID_TAG | 5),
                Some(5),
                Some(RELATION_ID_TAG | 5),
                Some(NODE_ID_TAG | 5),
                Some(RELATION_ID_TAG | 5),
                Some(5),
                None,
                None,
            ]
        );
        assert!(SYNTHETIC_ID_BASE > RELATION_ID_TAG | ID_NUMBER_MASK);
        assert_eq!(parse_number(&json!("relation/391736")), Some(391736));
    }

    #[test]
    fn test_ascii_grid() {
        let text = "ncols 3\nnrows 2\nxllcorner -73.0\nyllcorner 44.0\ncellsize 0.5\nNODATA_value -9999\n\
                    100 110 120\n130 -9999 150\n";
        let grid = parse_ascii_grid(text).unwrap();
        assert_eq!(grid.cols(), 3);
        assert_eq!(grid.rows(), 2);
        let bounds = grid.bounds();
        assert!((bounds.min().x + 73.0).abs() < 1e-12);
        assert!((bounds.max().y - 45.0).abs() < 1e-12);
        assert_eq!(grid.value(0, 2), Some(120.0));
        assert_eq!(grid.value(1, 1), None);
    }

    #[test]
    fn test_ascii_grid_cell_centres() {
        let text = "NCOLS 2\nNROWS 2\nXLLCENTER 0.5\nYLLCENTER 0.5\nCELLSIZE 1\n1 2 3 4";
        let grid = parse_ascii_grid(text).unwrap();
        assert!((grid.bounds().min().x).abs() < 1e-12);
        assert!((grid.bounds().max().y - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_ascii_grid_errors() {
        assert!(matches!(
            parse_ascii_grid("ncols 2\nnrows 2\nxllcorner 0\nyllcorner 0\n1 2 3 4"),
            Err(PackError::Raster(_))
        ));
        assert!(matches!(
            parse_ascii_grid("ncols 2\nnrows 2\nxllcorner 0\nyllcorner 0\ncellsize 1\n1 2 3"),
            Err(PackError::Raster(_))
        ));
    }
}
