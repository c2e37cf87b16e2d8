//! Trail Pack Library - Offline map packages for a single reference trail
//!
//! This library turns one reference trail geometry, plus already-downloaded OSM-style features
//! and a DEM grid, into a self-contained offline package: a multi-zoom tile pyramid covering a
//! buffered corridor around the trail, and a terrain-weighted graph for on-foot routing.
//!
//! # Architecture
//!
//! - **[`Corridor`]**: Buffered area of interest around the reference trail
//! - **[`FeatureNormalizer`]**: Maps OSM-style tagged geometries to canonical [`Feature`]s
//! - **[`TerrainCostGrid`]**: Slope and traversal-cost multipliers derived from a DEM
//! - **[`GraphBuilder`]**: Noded, snapped and weighted road/trail [`Graph`]
//! - **[`TilePyramidGenerator`]**: Clipped and simplified per-tile payloads across zooms
//! - **[`PackageEmitter`]**: Atomic write of the package directory
//! - **[`TrailPackager`]**: Runs all stages in dependency order
//!
//! # Determinism
//!
//! Every stage sorts its inputs and merges parallel work by key, so identical inputs and
//! configuration always produce byte-identical tile payloads and the same graph.

mod config;
mod corridor;
mod feature;
mod geojson;
mod graph;
mod package;
mod pipeline;
pub mod source;
mod terrain;
mod tiles;
pub mod utils;

// Public API exports
pub use config::{
    CategoryCosts, CategoryZooms, Config, CorridorConfig, GraphConfig, TerrainConfig, TileConfig,
    ZoomRange,
};
pub use corridor::Corridor;
pub use feature::{
    AttributeValue, Attributes, Category, Feature, FeatureNormalizer, NormalizeReport,
    NormalizedFeatures, RawFeature,
};
pub use graph::{BuildStats, CumulativeMeasure, Graph, GraphBuilder, GraphEdge, GraphNode};
pub use package::{Manifest, PackageEmitter, PackageSummary};
pub use pipeline::{BuiltPackage, PipelineInputs, TrailPackager};
pub use terrain::{ElevationGrid, SlopeCostModel, TerrainCell, TerrainCostGrid};
pub use tiles::{
    OverlayFragment, Pyramid, PyramidReport, Tile, TileFragment, TileGeometry, TileId,
    TilePyramidGenerator,
};

/// Pipeline stage, used to report where a fatal error happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Input,
    Corridor,
    Features,
    Terrain,
    Graph,
    Tiles,
    Package,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Input => "input",
            Stage::Corridor => "corridor",
            Stage::Features => "feature normalization",
            Stage::Terrain => "terrain",
            Stage::Graph => "graph",
            Stage::Tiles => "tile pyramid",
            Stage::Package => "package",
        };
        f.write_str(name)
    }
}

/// Error types for the packaging pipeline
#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error("Input geometry error: {0}")]
    InputGeometry(String),

    #[error("Degenerate geometry: {0}")]
    DegenerateGeometry(String),

    #[error(
        "Invalid zoom range [{min}, {max}] (zooms must satisfy min <= max <= {max_zoom})",
        max_zoom = utils::MAX_ZOOM
    )]
    InvalidZoomRange { min: u8, max: u8 },

    #[error("Feature {feature_id} skipped: {reason}")]
    FeatureClip { feature_id: u64, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Tile pyramid is empty: no feature produced any tile")]
    EmptyPyramid,

    #[error("Raster error: {0}")]
    Raster(String),

    #[error("GPX parsing error: {0}")]
    Gpx(#[from] gpx::errors::GpxError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<PackError>,
    },
}

impl PackError {
    /// Attach the failing stage, keeping the innermost stage if one is already set
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            PackError::Stage { .. } => self,
            other => PackError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Stage the error was raised in, if known
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PackError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The error without its stage wrapper
    pub fn root(&self) -> &PackError {
        match self {
            PackError::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<bincode::error::EncodeError> for PackError {
    fn from(err: bincode::error::EncodeError) -> Self {
        PackError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for PackError {
    fn from(err: bincode::error::DecodeError) -> Self {
        PackError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that all public types are accessible
        let _: fn() -> Config = Config::default;
        let _: fn(Config) -> Result<TrailPackager> = TrailPackager::new;
    }

    #[test]
    fn test_stage_wrapping_keeps_innermost_stage() {
        let err = PackError::DegenerateGeometry("no segments".to_string())
            .in_stage(Stage::Graph)
            .in_stage(Stage::Package);
        assert_eq!(err.stage(), Some(Stage::Graph));
        assert!(matches!(err.root(), PackError::DegenerateGeometry(_)));
        assert_eq!(
            err.to_string(),
            "graph stage failed: Degenerate geometry: no segments"
        );
    }

    #[test]
    fn test_invalid_zoom_message() {
        let err = PackError::InvalidZoomRange { min: 14, max: 10 };
        assert!(err.to_string().contains("[14, 10]"));
    }
}
