//! Minimal GeoJSON reading and writing on top of `serde_json`

use crate::{PackError, Result};

use geo::{
    Coord, Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon,
    Point, Polygon,
};
use serde::Deserialize;
use serde_json::{Map, Value, json};

type Position = Vec<f64>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum GeoJsonGeometry {
    Point {
        coordinates: Position,
    },
    MultiPoint {
        coordinates: Vec<Position>,
    },
    LineString {
        coordinates: Vec<Position>,
    },
    MultiLineString {
        coordinates: Vec<Vec<Position>>,
    },
    Polygon {
        coordinates: Vec<Vec<Position>>,
    },
    MultiPolygon {
        coordinates: Vec<Vec<Vec<Position>>>,
    },
    GeometryCollection {
        geometries: Vec<GeoJsonGeometry>,
    },
}

#[derive(Debug, Deserialize)]
pub(crate) struct GeoJsonFeature {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub geometry: Option<GeoJsonGeometry>,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
}

fn coord(position: &[f64]) -> Result<Coord<f64>> {
    match position {
        [x, y, ..] if x.is_finite() && y.is_finite() => Ok(Coord { x: *x, y: *y }),
        _ => Err(PackError::InputGeometry(format!(
            "invalid GeoJSON position {position:?}"
        ))),
    }
}

fn line(positions: &[Position]) -> Result<LineString<f64>> {
    positions
        .iter()
        .map(|p| coord(p))
        .collect::<Result<Vec<_>>>()
        .map(LineString::new)
}

fn polygon(rings: &[Vec<Position>]) -> Result<Polygon<f64>> {
    let mut rings = rings.iter().map(|r| line(r));
    let exterior = rings
        .next()
        .transpose()?
        .ok_or_else(|| PackError::InputGeometry("polygon without rings".to_string()))?;
    let interiors = rings.collect::<Result<Vec<_>>>()?;
    Ok(Polygon::new(exterior, interiors))
}

impl GeoJsonGeometry {
    pub fn into_geo(self) -> Result<Geometry<f64>> {
        Ok(match self {
            GeoJsonGeometry::Point { coordinates } => Geometry::Point(Point(coord(&coordinates)?)),
            GeoJsonGeometry::MultiPoint { coordinates } => Geometry::MultiPoint(MultiPoint(
                coordinates
                    .iter()
                    .map(|p| coord(p).map(Point))
                    .collect::<Result<_>>()?,
            )),
            GeoJsonGeometry::LineString { coordinates } => {
                Geometry::LineString(line(&coordinates)?)
            }
            GeoJsonGeometry::MultiLineString { coordinates } => {
                Geometry::MultiLineString(MultiLineString::new(
                    coordinates
                        .iter()
                        .map(|l| line(l))
                        .collect::<Result<_>>()?,
                ))
            }
            GeoJsonGeometry::Polygon { coordinates } => Geometry::Polygon(polygon(&coordinates)?),
            GeoJsonGeometry::MultiPolygon { coordinates } => {
                Geometry::MultiPolygon(MultiPolygon::new(
                    coordinates
                        .iter()
                        .map(|p| polygon(p))
                        .collect::<Result<_>>()?,
                ))
            }
            GeoJsonGeometry::GeometryCollection { geometries } => {
                Geometry::GeometryCollection(GeometryCollection(
                    geometries
                        .into_iter()
                        .map(GeoJsonGeometry::into_geo)
                        .collect::<Result<_>>()?,
                ))
            }
        })
    }
}

/// Parse a GeoJSON document into its features.
/// A bare geometry becomes a single feature without properties.
pub(crate) fn parse_features(text: &str) -> Result<Vec<GeoJsonFeature>> {
    let mut value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| PackError::InputGeometry("GeoJSON object without a type".to_string()))?;

    match kind.as_str() {
        "FeatureCollection" => {
            let features = value
                .get_mut("features")
                .map(Value::take)
                .unwrap_or_else(|| Value::Array(Vec::new()));
            Ok(serde_json::from_value(features)?)
        }
        "Feature" => Ok(vec![serde_json::from_value(value)?]),
        _ => Ok(vec![GeoJsonFeature {
            id: None,
            geometry: Some(serde_json::from_value(value)?),
            properties: None,
        }]),
    }
}

fn position(c: &Coord<f64>) -> Value {
    json!([c.x, c.y])
}

fn ring(ls: &LineString<f64>) -> Value {
    Value::Array(ls.0.iter().map(position).collect())
}

fn polygon_rings(p: &Polygon<f64>) -> Value {
    let mut rings = vec![ring(p.exterior())];
    rings.extend(p.interiors().iter().map(ring));
    Value::Array(rings)
}

/// GeoJSON geometry object
pub(crate) fn geometry(geometry: &Geometry<f64>) -> Value {
    match geometry {
        Geometry::Point(p) => json!({"type": "Point", "coordinates": position(&p.0)}),
        Geometry::MultiPoint(mp) => json!({
            "type": "MultiPoint",
            "coordinates": mp.0.iter().map(|p| position(&p.0)).collect::<Vec<_>>(),
        }),
        Geometry::Line(l) => json!({
            "type": "LineString",
            "coordinates": [position(&l.start), position(&l.end)],
        }),
        Geometry::LineString(ls) => json!({"type": "LineString", "coordinates": ring(ls)}),
        Geometry::MultiLineString(mls) => json!({
            "type": "MultiLineString",
            "coordinates": mls.0.iter().map(ring).collect::<Vec<_>>(),
        }),
        Geometry::Polygon(p) => json!({"type": "Polygon", "coordinates": polygon_rings(p)}),
        Geometry::MultiPolygon(mp) => json!({
            "type": "MultiPolygon",
            "coordinates": mp.0.iter().map(polygon_rings).collect::<Vec<_>>(),
        }),
        Geometry::Rect(r) => {
            json!({"type": "Polygon", "coordinates": polygon_rings(&r.to_polygon())})
        }
        Geometry::Triangle(t) => {
            json!({"type": "Polygon", "coordinates": polygon_rings(&t.to_polygon())})
        }
        Geometry::GeometryCollection(gc) => json!({
            "type": "GeometryCollection",
            "geometries": gc.0.iter().map(self::geometry).collect::<Vec<_>>(),
        }),
    }
}

pub(crate) fn feature(id: Option<u64>, geom: &Geometry<f64>, properties: Value) -> Value {
    let mut feature = json!({
        "type": "Feature",
        "geometry": geometry(geom),
        "properties": properties,
    });
    if let (Some(id), Some(object)) = (id, feature.as_object_mut()) {
        object.insert("id".to_string(), json!(id));
    }
    feature
}

pub(crate) fn feature_collection(features: Vec<Value>) -> Value {
    json!({"type": "FeatureCollection", "features": features})
}
