use clap::Parser;
use std::path::PathBuf;
use trail_pack_lib::Config;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
/// Trail Pack - Build an offline tile pyramid and routing graph around a single trail
pub struct Settings {
    /// Reference trail geometry (GPX or GeoJSON)
    #[clap(value_name = "REFERENCE_GEOMETRY")]
    pub reference_geometry: PathBuf,

    /// Directory the package is written to
    #[clap(value_name = "OUTPUT_DIR")]
    pub output_dir: PathBuf,

    /// OSM relation id of the main trail, used to flag its member ways
    #[clap(long = "trail_id", alias = "trail-id", value_name = "ID")]
    pub trail_id: Option<u64>,

    /// Corridor buffer radius around the trail (default: 500)
    #[clap(long = "buffer_radius", alias = "buffer-radius", value_name = "METERS")]
    pub buffer_radius: Option<f64>,

    /// GeoJSON files with OSM-style tagged features (repeatable)
    #[clap(short, long = "features", value_name = "FILE")]
    pub features: Vec<PathBuf>,

    /// DEM as an ESRI ASCII grid in WGS84 degrees (flat terrain when omitted)
    #[clap(long, value_name = "FILE")]
    pub dem: Option<PathBuf>,

    /// JSON configuration file; command-line flags override its values
    #[clap(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Lowest zoom level of the tile pyramid (default: 8)
    #[clap(long)]
    pub min_zoom: Option<u8>,

    /// Highest zoom level of the tile pyramid (default: 14)
    #[clap(long)]
    pub max_zoom: Option<u8>,

    /// Do not add graph edges to the tiles
    #[clap(long, default_value = "false")]
    pub no_overlay: bool,

    /// Replace the output directory if it already exists
    #[clap(long, default_value = "false")]
    pub force: bool,

    /// Debug logging (overrides RUST_LOG)
    #[clap(short, long, default_value = "false")]
    pub verbose: bool,
}

impl Settings {
    /// Parse the command line, exiting with usage information on error
    pub fn from_cli() -> Self {
        match Settings::try_parse() {
            Ok(args) => args,
            Err(e) => e.exit(),
        }
    }

    /// Configuration file (or defaults) with the command-line overrides applied
    pub fn to_config(&self) -> trail_pack_lib::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_json_file(path)?,
            None => Config::default(),
        };
        if let Some(trail_id) = self.trail_id {
            config.trail_id = Some(trail_id);
        }
        if let Some(radius) = self.buffer_radius {
            config.corridor.buffer_radius_m = radius;
        }
        if let Some(min) = self.min_zoom {
            config.zoom.min = min;
        }
        if let Some(max) = self.max_zoom {
            config.zoom.max = max;
        }
        if self.no_overlay {
            config.tiles.graph_overlay = false;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_and_snake_case_flags() {
        let settings = Settings::try_parse_from([
            "trail-pack",
            "long-trail.gpx",
            "out/long-trail",
            "--trail_id",
            "391736",
            "--buffer_radius",
            "750",
            "-f",
            "roads.geojson",
            "--features",
            "landcover.geojson",
        ])
        .unwrap();
        assert_eq!(settings.reference_geometry, PathBuf::from("long-trail.gpx"));
        assert_eq!(settings.output_dir, PathBuf::from("out/long-trail"));
        assert_eq!(settings.features.len(), 2);

        let config = settings.to_config().unwrap();
        assert_eq!(config.trail_id, Some(391736));
        assert_eq!(config.corridor.buffer_radius_m, 750.0);
        assert!(config.tiles.graph_overlay);
    }

    #[test]
    fn test_kebab_case_aliases() {
        let settings = Settings::try_parse_from([
            "trail-pack",
            "a.gpx",
            "out",
            "--trail-id",
            "7",
            "--buffer-radius",
            "100",
            "--min-zoom",
            "10",
            "--max-zoom",
            "12",
            "--no-overlay",
        ])
        .unwrap();
        let config = settings.to_config().unwrap();
        assert_eq!(config.trail_id, Some(7));
        assert_eq!((config.zoom.min, config.zoom.max), (10, 12));
        assert!(!config.tiles.graph_overlay);
    }

    #[test]
    fn test_missing_positionals_is_usage_error() {
        assert!(Settings::try_parse_from(["trail-pack", "a.gpx"]).is_err());
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"zoom": {"min": 9, "max": 13}, "corridor": {"buffer_radius_m": 300}}"#,
        )
        .unwrap();
        let settings = Settings::try_parse_from([
            "trail-pack",
            "a.gpx",
            "out",
            "--config",
            path.to_str().unwrap(),
            "--max-zoom",
            "15",
        ])
        .unwrap();
        let config = settings.to_config().unwrap();
        assert_eq!((config.zoom.min, config.zoom.max), (9, 15));
        assert_eq!(config.corridor.buffer_radius_m, 300.0);
    }
}
