//! Package emission: stage every artifact in a sibling directory, then commit by rename
//!
//! Layout of a package directory:
//!
//! ```text
//! manifest.json
//! corridor.geojson
//! graph.bin
//! graph_debug.geojson
//! tiles/{z}/{x}/{y}.tile
//! ```

use crate::pipeline::BuiltPackage;
use crate::{PackError, Result, TileId};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Version of the directory layout and payload formats
pub const FORMAT_VERSION: u32 = 1;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const GRAPH_FILE: &str = "graph.bin";
pub const GRAPH_DEBUG_FILE: &str = "graph_debug.geojson";
pub const CORRIDOR_FILE: &str = "corridor.geojson";

/// Geographic bounds of the corridor, in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSummary {
    pub nodes: usize,
    pub edges: usize,
    pub connected_components: usize,
    pub total_length_m: f64,
}

/// Non-fatal issues per stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningCounts {
    pub features_skipped: usize,
    pub graph_segments_rejected: usize,
    pub tile_features_skipped: usize,
}

impl WarningCounts {
    pub fn total(&self) -> usize {
        self.features_skipped + self.graph_segments_rejected + self.tile_features_skipped
    }
}

/// Contents of `manifest.json`. Holds no timestamp so that reruns give identical files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub generator: String,
    pub trail_id: Option<u64>,
    pub buffer_radius_m: f64,
    pub bounds: Bounds,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub tile_extent: u32,
    pub tile_count: usize,
    pub tiles_per_zoom: BTreeMap<u8, usize>,
    pub features_per_category: BTreeMap<String, usize>,
    pub graph: GraphSummary,
    pub warnings: WarningCounts,
}

impl Manifest {
    pub fn from_built(built: &BuiltPackage) -> Self {
        let bounds = built.corridor.bounds();
        Self {
            format_version: FORMAT_VERSION,
            generator: format!("trail-pack-lib {}", env!("CARGO_PKG_VERSION")),
            trail_id: built.trail_id,
            buffer_radius_m: built.corridor.buffer_radius_m(),
            bounds: Bounds {
                south: bounds.min().y,
                west: bounds.min().x,
                north: bounds.max().y,
                east: bounds.max().x,
            },
            min_zoom: built.pyramid.zoom.min,
            max_zoom: built.pyramid.zoom.max,
            tile_extent: built.pyramid.extent,
            tile_count: built.pyramid.len(),
            tiles_per_zoom: built.pyramid.tiles_per_zoom(),
            features_per_category: built
                .features
                .count_by_category()
                .into_iter()
                .map(|(category, count)| (category.as_str().to_string(), count))
                .collect(),
            graph: GraphSummary {
                nodes: built.graph.nodes.len(),
                edges: built.graph.edges.len(),
                connected_components: built.graph_stats.connected_components,
                total_length_m: built.graph.total_length_m(),
            },
            warnings: WarningCounts {
                features_skipped: built.features.report.warnings.len(),
                graph_segments_rejected: built.graph_stats.warnings.len(),
                tile_features_skipped: built.pyramid_report.warnings.len(),
            },
        }
    }

    /// Read the manifest of an emitted package
    pub fn load(package_dir: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(package_dir.as_ref().join(MANIFEST_FILE))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// What was written
#[derive(Debug, Clone)]
pub struct PackageSummary {
    pub output_dir: PathBuf,
    pub tile_count: usize,
    pub tile_bytes: u64,
    pub graph_bytes: u64,
    pub manifest: Manifest,
}

/// Failure while writing one tile, kept free of the error type so workers stay `Send`
enum TileWriteError {
    Encode(TileId, String),
    Io(std::io::Error),
}

/// Writes a built package to disk, all or nothing
#[derive(Debug, Clone)]
pub struct PackageEmitter {
    output_dir: PathBuf,
    force: bool,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl PackageEmitter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            force: false,
        }
    }

    /// Replace an existing output directory instead of failing
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write every artifact into a staging directory next to the output, then move it into
    /// place. On any error the staging directory is removed and the output is left untouched.
    pub fn emit(&self, built: &BuiltPackage) -> Result<PackageSummary> {
        #[cfg(feature = "profiling")]
        profiling::scope!("package::emit");

        let start = std::time::Instant::now();
        if self.output_dir.exists() && !self.force {
            return Err(PackError::Io(std::io::Error::new(
                ErrorKind::AlreadyExists,
                format!(
                    "output directory {} already exists (use --force to replace it)",
                    self.output_dir.display()
                ),
            )));
        }

        let parent = match self.output_dir.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;
        let staging = tempfile::Builder::new()
            .prefix(".trail-pack-staging-")
            .tempdir_in(&parent)?;
        tracing::debug!("Staging package in {}", staging.path().display());

        let manifest = Manifest::from_built(built);
        let tile_bytes = write_tiles(staging.path(), built)?;

        let graph_bytes = built.graph.to_bytes()?;
        std::fs::write(staging.path().join(GRAPH_FILE), &graph_bytes)?;
        std::fs::write(
            staging.path().join(GRAPH_DEBUG_FILE),
            serde_json::to_vec_pretty(&built.graph.to_geojson())?,
        )?;
        std::fs::write(
            staging.path().join(CORRIDOR_FILE),
            serde_json::to_vec_pretty(&built.corridor.to_geojson())?,
        )?;
        std::fs::write(
            staging.path().join(MANIFEST_FILE),
            serde_json::to_vec_pretty(&manifest)?,
        )?;

        self.commit(staging)?;

        tracing::info!(
            "Wrote package to {} ({} tiles, {} tile bytes, {} graph bytes) in {:?}",
            self.output_dir.display(),
            manifest.tile_count,
            tile_bytes,
            graph_bytes.len(),
            start.elapsed()
        );

        Ok(PackageSummary {
            output_dir: self.output_dir.clone(),
            tile_count: manifest.tile_count,
            tile_bytes,
            graph_bytes: graph_bytes.len() as u64,
            manifest,
        })
    }

    /// Move the staging directory to the output path, swapping out an old package if forced
    fn commit(&self, staging: tempfile::TempDir) -> Result<()> {
        let backup = if self.output_dir.exists() {
            let name = self
                .output_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "package".to_string());
            let backup = self
                .output_dir
                .with_file_name(format!(".{name}.old-{}", std::process::id()));
            std::fs::rename(&self.output_dir, &backup)?;
            Some(backup)
        } else {
            None
        };

        if let Err(err) = std::fs::rename(staging.path(), &self.output_dir) {
            if let Some(backup) = &backup
                && let Err(restore) = std::fs::rename(backup, &self.output_dir)
            {
                tracing::error!(
                    "Could not restore previous package from {}: {}",
                    backup.display(),
                    restore
                );
            }
            return Err(err.into());
        }
        // The staging path is now the output directory and must not be cleaned up
        let _ = staging.keep();

        if let Some(backup) = backup
            && let Err(err) = std::fs::remove_dir_all(&backup)
        {
            tracing::warn!(
                "Could not remove previous package at {}: {}",
                backup.display(),
                err
            );
        }
        Ok(())
    }
}

/// Encode and write every tile. Directories are created first, payloads in parallel.
fn write_tiles(root: &Path, built: &BuiltPackage) -> Result<u64> {
    let dirs: BTreeSet<PathBuf> = built
        .pyramid
        .tiles
        .keys()
        .filter_map(|id| id.relative_path().parent().map(Path::to_path_buf))
        .collect();
    for dir in &dirs {
        std::fs::create_dir_all(root.join(dir))?;
    }

    let written: Vec<std::result::Result<u64, TileWriteError>> = built
        .pyramid
        .tiles
        .par_iter()
        .map(|(id, tile)| {
            let bytes = tile
                .encode()
                .map_err(|e| TileWriteError::Encode(*id, e.to_string()))?;
            std::fs::write(root.join(id.relative_path()), &bytes).map_err(TileWriteError::Io)?;
            Ok(bytes.len() as u64)
        })
        .collect();

    let mut total = 0;
    for result in written {
        match result {
            Ok(bytes) => total += bytes,
            Err(TileWriteError::Encode(id, reason)) => {
                return Err(PackError::Serialization(format!("tile {id}: {reason}")));
            }
            Err(TileWriteError::Io(err)) => return Err(err.into()),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_total() {
        let counts = WarningCounts {
            features_skipped: 2,
            graph_segments_rejected: 1,
            tile_features_skipped: 0,
        };
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn test_manifest_json_shape() {
        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            generator: "trail-pack-lib test".to_string(),
            trail_id: Some(391736),
            buffer_radius_m: 500.0,
            bounds: Bounds {
                south: 42.7,
                west: -73.3,
                north: 45.0,
                east: -72.4,
            },
            min_zoom: 8,
            max_zoom: 14,
            tile_extent: 4096,
            tile_count: 3,
            tiles_per_zoom: BTreeMap::from([(8, 1), (9, 2)]),
            features_per_category: BTreeMap::from([("trail".to_string(), 4)]),
            graph: GraphSummary {
                nodes: 5,
                edges: 4,
                connected_components: 1,
                total_length_m: 1234.5,
            },
            warnings: WarningCounts::default(),
        };
        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(value["tiles_per_zoom"]["9"], 2);
        assert_eq!(value["bounds"]["west"], -73.3);
        let back: Manifest = serde_json::from_value(value).unwrap();
        assert_eq!(back, manifest);
    }

    #[test]
    fn test_emitter_options() {
        let emitter = PackageEmitter::new("out/vermont");
        assert!(!emitter.force);
        assert_eq!(emitter.output_dir(), Path::new("out/vermont"));
        assert!(emitter.with_force(true).force);
    }
}
