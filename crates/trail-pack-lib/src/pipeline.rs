//! TrailPackager - Runs every stage in dependency order
//!
//! corridor -> features -> terrain -> graph -> tiles -> package. Each stage reads the
//! immutable output of the previous ones. A fatal error is tagged with its [`Stage`] and
//! aborts the run before anything is written.

use crate::{
    BuildStats, Config, Corridor, ElevationGrid, FeatureNormalizer, Graph, GraphBuilder,
    NormalizedFeatures, PackError, PackageEmitter, PackageSummary, Pyramid, PyramidReport,
    RawFeature, Result, Stage, TerrainCostGrid, TilePyramidGenerator,
};

use geo::MultiLineString;
use std::path::Path;

/// Already-materialized inputs of one run
#[derive(Debug, Clone)]
pub struct PipelineInputs {
    /// Reference trail, WGS84
    pub reference: MultiLineString<f64>,
    pub features: Vec<RawFeature>,
    /// `None` means flat terrain
    pub elevation: Option<ElevationGrid>,
}

/// Every artifact of a run, ready to be written
#[derive(Debug)]
pub struct BuiltPackage {
    pub trail_id: Option<u64>,
    pub corridor: Corridor,
    pub features: NormalizedFeatures,
    pub terrain: TerrainCostGrid,
    pub graph: Graph,
    pub graph_stats: BuildStats,
    pub pyramid: Pyramid,
    pub pyramid_report: PyramidReport,
}

impl BuiltPackage {
    /// Non-fatal issues across all stages
    pub fn warnings(&self) -> impl Iterator<Item = &PackError> {
        self.features
            .report
            .warnings
            .iter()
            .chain(self.graph_stats.warnings.iter())
            .chain(self.pyramid_report.warnings.iter())
    }
}

/// Entry point of the library: one reference trail in, one package out
#[derive(Debug, Clone)]
pub struct TrailPackager {
    config: Config,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl TrailPackager {
    /// Create a packager; the configuration is validated up front
    pub fn new(config: Config) -> Result<Self> {
        config.validate().map_err(|e| e.in_stage(Stage::Input))?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run every stage in memory
    pub fn build(&self, inputs: &PipelineInputs) -> Result<BuiltPackage> {
        #[cfg(feature = "profiling")]
        profiling::scope!("pipeline::build");

        let start = std::time::Instant::now();
        let config = &self.config;

        let corridor = Corridor::build(&inputs.reference, &config.corridor)
            .map_err(|e| e.in_stage(Stage::Corridor))?;

        let features = FeatureNormalizer::new(config).normalize(&inputs.features, &corridor);
        if features.features.is_empty() {
            return Err(PackError::DegenerateGeometry(format!(
                "none of the {} input features lies inside the corridor",
                inputs.features.len()
            ))
            .in_stage(Stage::Features));
        }

        let terrain = match &inputs.elevation {
            Some(dem) => TerrainCostGrid::build(dem, corridor.bounds(), &config.terrain)
                .map_err(|e| e.in_stage(Stage::Terrain))?,
            None => {
                tracing::info!("No DEM given, using flat terrain");
                TerrainCostGrid::flat()
            }
        };

        let (graph, graph_stats) = GraphBuilder::new(config)
            .build(features.routable(), &terrain)
            .map_err(|e| e.in_stage(Stage::Graph))?;

        let (pyramid, pyramid_report) = TilePyramidGenerator::new(config)
            .generate(&features.features, Some(&graph))
            .map_err(|e| e.in_stage(Stage::Tiles))?;

        let built = BuiltPackage {
            trail_id: config.trail_id,
            corridor,
            features,
            terrain,
            graph,
            graph_stats,
            pyramid,
            pyramid_report,
        };

        tracing::info!(
            "Built package in {:?}: {} features, {} nodes, {} edges, {} tiles, {} warnings",
            start.elapsed(),
            built.features.features.len(),
            built.graph.nodes.len(),
            built.graph.edges.len(),
            built.pyramid.len(),
            built.warnings().count()
        );
        Ok(built)
    }

    /// Build then write the package to `output_dir`
    pub fn run(
        &self,
        inputs: &PipelineInputs,
        output_dir: impl AsRef<Path>,
        force: bool,
    ) -> Result<PackageSummary> {
        let built = self.build(inputs)?;
        PackageEmitter::new(output_dir.as_ref())
            .with_force(force)
            .emit(&built)
            .map_err(|e| e.in_stage(Stage::Package))
    }
}
