//! Tiles: identifiers, tile-local geometry and the compressed payload

mod clip;
mod pyramid;

pub use pyramid::{Pyramid, PyramidReport, TilePyramidGenerator};

use crate::{AttributeValue, Category, PackError, Result, utils};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use geo::Rect;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::PathBuf;

/// Magic prefix of every tile payload, followed by a gzip stream of the bincode body
pub const TILE_MAGIC: &[u8; 8] = b"TPTILE01";

/// XYZ tile address (rows grow southwards)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileId {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
}

impl TileId {
    pub fn new(zoom: u8, x: u32, y: u32) -> Result<Self> {
        let id = Self { zoom, x, y };
        if zoom > utils::MAX_ZOOM {
            return Err(PackError::InvalidZoomRange {
                min: zoom,
                max: zoom,
            });
        }
        if !id.is_valid() {
            return Err(PackError::Serialization(format!(
                "tile {id} is outside the zoom {zoom} grid"
            )));
        }
        Ok(id)
    }

    /// Coordinates inside `[0, 2^zoom)`
    pub fn is_valid(&self) -> bool {
        self.zoom <= utils::MAX_ZOOM
            && self.x < utils::tiles_per_axis(self.zoom)
            && self.y < utils::tiles_per_axis(self.zoom)
    }

    /// Web Mercator bounds of the tile
    pub fn bounds(&self) -> Rect<f64> {
        utils::tile_bounds_mercator(self.zoom, self.x, self.y)
    }

    /// Relative path inside the package: `tiles/{z}/{x}/{y}.tile`
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from("tiles")
            .join(self.zoom.to_string())
            .join(self.x.to_string())
            .join(format!("{}.tile", self.y))
    }
}

impl std::fmt::Display for TileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.x, self.y)
    }
}

/// Point in tile-local units, y down, may extend into the buffer
pub type TilePoint = [i32; 2];

/// Geometry of one fragment in tile-local coordinates
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TileGeometry {
    pub points: Vec<TilePoint>,
    pub lines: Vec<Vec<TilePoint>>,
    /// Polygons as rings, exterior first, each ring closed
    pub polygons: Vec<Vec<Vec<TilePoint>>>,
}

impl TileGeometry {
    pub fn is_empty(&self) -> bool {
        self.points.is_empty() && self.lines.is_empty() && self.polygons.is_empty()
    }
}

/// The part of one feature that falls into one tile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileFragment {
    pub feature_id: u64,
    pub category: Category,
    pub attributes: Vec<(String, AttributeValue)>,
    pub geometry: TileGeometry,
}

/// The part of one graph edge that falls into one tile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayFragment {
    pub edge_id: u32,
    pub from_node: u32,
    pub to_node: u32,
    pub category: Category,
    pub weight: f64,
    pub lines: Vec<Vec<TilePoint>>,
}

/// Content of one tile, fragments ordered by category priority then feature id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tile {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
    pub extent: u32,
    pub features: Vec<TileFragment>,
    /// Present when the overlay was requested and an edge reaches this tile
    pub graph_overlay: Option<Vec<OverlayFragment>>,
}

impl Tile {
    pub fn id(&self) -> TileId {
        TileId {
            zoom: self.zoom,
            x: self.x,
            y: self.y,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty() && self.graph_overlay.as_ref().is_none_or(Vec::is_empty)
    }

    /// Compact payload: `TPTILE01` then gzip(bincode(tile)).
    ///
    /// The gzip header carries no timestamp, so equal tiles always give equal bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serde::encode_to_vec(self, bincode::config::standard())?;
        let mut encoder = GzEncoder::new(TILE_MAGIC.to_vec(), Compression::default());
        encoder.write_all(&body)?;
        Ok(encoder.finish()?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let compressed = bytes.strip_prefix(TILE_MAGIC.as_slice()).ok_or_else(|| {
            PackError::Serialization("tile payload has no TPTILE01 header".to_string())
        })?;
        let mut body = Vec::new();
        GzDecoder::new(compressed)
            .read_to_end(&mut body)
            .map_err(|e| PackError::Serialization(format!("tile payload is corrupt: {e}")))?;
        let (tile, _): (Tile, usize) =
            bincode::serde::decode_from_slice(&body, bincode::config::standard())?;
        Ok(tile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tile() -> Tile {
        Tile {
            zoom: 12,
            x: 1218,
            y: 1478,
            extent: 4096,
            features: vec![TileFragment {
                feature_id: 7,
                category: Category::Trail,
                attributes: vec![(
                    "name".to_string(),
                    AttributeValue::Text("Long Trail".to_string()),
                )],
                geometry: TileGeometry {
                    lines: vec![vec![[0, 0], [100, 250], [4200, 300]]],
                    ..TileGeometry::default()
                },
            }],
            graph_overlay: Some(vec![OverlayFragment {
                edge_id: 3,
                from_node: 1,
                to_node: 2,
                category: Category::Trail,
                weight: 1200.5,
                lines: vec![vec![[0, 0], [100, 250]]],
            }]),
        }
    }

    #[test]
    fn test_tile_id_validation() {
        assert!(TileId::new(0, 0, 0).is_ok());
        assert!(TileId::new(2, 3, 3).is_ok());
        assert!(TileId::new(2, 4, 0).is_err());
        assert!(matches!(
            TileId::new(23, 0, 0),
            Err(PackError::InvalidZoomRange { .. })
        ));
    }

    #[test]
    fn test_tile_path_layout() {
        let id = TileId { zoom: 14, x: 4823, y: 5912 };
        assert_eq!(id.relative_path(), PathBuf::from("tiles/14/4823/5912.tile"));
        assert_eq!(id.to_string(), "14/4823/5912");
    }

    #[test]
    fn test_tile_ordering_is_zoom_major() {
        let mut ids = vec![
            TileId { zoom: 10, x: 5, y: 1 },
            TileId { zoom: 9, x: 9, y: 9 },
            TileId { zoom: 10, x: 4, y: 7 },
        ];
        ids.sort();
        assert_eq!(ids[0].zoom, 9);
        assert_eq!(ids[1], TileId { zoom: 10, x: 4, y: 7 });
    }

    #[test]
    fn test_payload_roundtrip_and_determinism() {
        let tile = sample_tile();
        let bytes = tile.encode().unwrap();
        assert!(bytes.starts_with(TILE_MAGIC));
        assert_eq!(bytes, sample_tile().encode().unwrap());
        assert_eq!(Tile::decode(&bytes).unwrap(), tile);
    }

    #[test]
    fn test_decode_rejects_bad_payload() {
        assert!(Tile::decode(b"garbage").is_err());
        let mut bytes = TILE_MAGIC.to_vec();
        bytes.extend_from_slice(b"not gzip");
        assert!(matches!(
            Tile::decode(&bytes),
            Err(PackError::Serialization(_))
        ));
    }

    #[test]
    fn test_empty_tile() {
        let mut tile = sample_tile();
        assert!(!tile.is_empty());
        tile.features.clear();
        tile.graph_overlay = Some(Vec::new());
        assert!(tile.is_empty());
    }
}
