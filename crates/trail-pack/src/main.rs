mod logging;
mod settings;

use settings::Settings;
use std::process::ExitCode;
use trail_pack_lib::source::{read_ascii_grid, read_features, read_reference_geometry};
use trail_pack_lib::{PackageSummary, PipelineInputs, Stage, TrailPackager};

fn run(settings: &Settings) -> trail_pack_lib::Result<PackageSummary> {
    #[cfg(feature = "profiling")]
    profiling::scope!("trail-pack::run");

    let input = |e: trail_pack_lib::PackError| e.in_stage(Stage::Input);

    let config = settings.to_config().map_err(input)?;
    let packager = TrailPackager::new(config)?;

    let reference = read_reference_geometry(&settings.reference_geometry).map_err(input)?;
    if settings.features.is_empty() {
        tracing::warn!("No --features file given; the corridor will contain no features");
    }
    let features = read_features(settings.features.as_slice()).map_err(input)?;
    let elevation = settings
        .dem
        .as_ref()
        .map(|path| read_ascii_grid(path))
        .transpose()
        .map_err(input)?;

    packager.run(
        &PipelineInputs {
            reference,
            features,
            elevation,
        },
        &settings.output_dir,
        settings.force,
    )
}

fn main() -> ExitCode {
    let settings = Settings::from_cli();
    let _guard = logging::setup_logging(settings.verbose);

    match run(&settings) {
        Ok(summary) => {
            let warnings = &summary.manifest.warnings;
            tracing::info!(
                "Package ready at {}: {} tiles, {} graph edges, {} warnings ({} features skipped, {} graph segments rejected, {} tile features skipped)",
                summary.output_dir.display(),
                summary.tile_count,
                summary.manifest.graph.edges,
                warnings.total(),
                warnings.features_skipped,
                warnings.graph_segments_rejected,
                warnings.tile_features_skipped
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            let stage = err
                .stage()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "setup".to_string());
            tracing::error!("Packaging failed in {} stage: {}", stage, err.root());
            eprintln!("error: {err}");
            ExitCode::from(1)
        }
    }
}
