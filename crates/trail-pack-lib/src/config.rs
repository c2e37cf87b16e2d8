//! Packaging configuration
//!
//! Every tunable of the pipeline lives here with a documented default. The whole tree is
//! `serde`-friendly so a run can be described by a JSON file and then overridden from the
//! command line.

use crate::terrain::SlopeCostModel;
use crate::{Category, PackError, Result, utils};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Inclusive zoom range `[min, max]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ZoomRange {
    pub min: u8,
    pub max: u8,
}

impl ZoomRange {
    /// Create a validated zoom range
    pub fn new(min: u8, max: u8) -> Result<Self> {
        let range = Self { min, max };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min > self.max || self.max > utils::MAX_ZOOM {
            return Err(PackError::InvalidZoomRange {
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }

    #[inline]
    pub fn contains(&self, zoom: u8) -> bool {
        zoom >= self.min && zoom <= self.max
    }

    pub fn iter(&self) -> std::ops::RangeInclusive<u8> {
        self.min..=self.max
    }

    /// Intersection with `bounds`, or `None` when the ranges do not overlap
    pub fn clamp_to(&self, bounds: ZoomRange) -> Option<ZoomRange> {
        let min = self.min.max(bounds.min);
        let max = self.max.min(bounds.max);
        (min <= max).then_some(ZoomRange { min, max })
    }
}

impl Default for ZoomRange {
    fn default() -> Self {
        Self { min: 8, max: 14 }
    }
}

impl std::fmt::Display for ZoomRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Corridor (area of interest) parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorridorConfig {
    /// Buffer radius around the reference trail, in meters. Default: 500
    pub buffer_radius_m: f64,
    /// Simplification tolerance applied to the buffered outline, in meters.
    /// Capped at a tenth of the radius so small corridors keep their shape. Default: 200
    pub simplify_tolerance_m: f64,
}

impl Default for CorridorConfig {
    fn default() -> Self {
        Self {
            buffer_radius_m: 500.0,
            simplify_tolerance_m: 200.0,
        }
    }
}

impl CorridorConfig {
    /// Tolerance actually used for the corridor outline
    pub fn effective_simplify_tolerance(&self) -> f64 {
        self.simplify_tolerance_m.min(self.buffer_radius_m / 10.0)
    }
}

/// Minimum zoom at which each category becomes visible.
/// The maximum is always the global maximum zoom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryZooms {
    pub road: u8,
    pub trail: u8,
    pub landcover: u8,
    pub boundary: u8,
    pub hydrography: u8,
    pub rail: u8,
    pub building: u8,
    pub poi: u8,
    pub peak: u8,
}

impl Default for CategoryZooms {
    fn default() -> Self {
        Self {
            road: 8,
            trail: 10,
            landcover: 8,
            boundary: 8,
            hydrography: 10,
            rail: 10,
            building: 13,
            poi: 12,
            peak: 11,
        }
    }
}

impl CategoryZooms {
    pub fn min_zoom(&self, category: Category) -> u8 {
        match category {
            Category::Road => self.road,
            Category::Trail => self.trail,
            Category::Landcover => self.landcover,
            Category::Boundary => self.boundary,
            Category::Hydrography => self.hydrography,
            Category::Rail => self.rail,
            Category::Building => self.building,
            Category::Poi => self.poi,
            Category::Peak => self.peak,
        }
    }

    /// Visible range of `category` inside `global`, `None` if it never shows
    pub fn range_for(&self, category: Category, global: ZoomRange) -> Option<ZoomRange> {
        ZoomRange {
            min: self.min_zoom(category),
            max: global.max,
        }
        .clamp_to(global)
    }
}

/// Tile pyramid parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileConfig {
    /// Tile-local coordinate extent. Default: 4096
    pub extent: u32,
    /// Clip buffer around each tile, in tile units. Default: 64
    pub buffer: u32,
    /// Simplification tolerance, in tile units at the rendered zoom. Default: 4
    pub simplification: f64,
    /// Add graph edges to the tiles as an overlay. Default: true
    pub graph_overlay: bool,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            extent: 4096,
            buffer: 64,
            simplification: 4.0,
            graph_overlay: true,
        }
    }
}

/// Base traversal cost per routable category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryCosts {
    pub road: f64,
    pub trail: f64,
}

impl CategoryCosts {
    /// Base cost of a routable category, `None` for the others
    pub fn get(&self, category: Category) -> Option<f64> {
        match category {
            Category::Road => Some(self.road),
            Category::Trail => Some(self.trail),
            _ => None,
        }
    }
}

impl Default for CategoryCosts {
    fn default() -> Self {
        Self {
            road: 1.0,
            trail: 1.2,
        }
    }
}

/// Graph construction parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Node snapping tolerance ε, in meters. Default: 0.5
    pub snap_tolerance_m: f64,
    /// Terrain sampling step along edges, in meters. Default: 10
    pub sample_step_m: f64,
    pub costs: CategoryCosts,
    /// Extra factor per `highway` value (e.g. `steps`), 1.0 when absent
    pub highway_factors: BTreeMap<String, f64>,
    /// Extra factor per `surface` value, 1.0 when absent
    pub surface_factors: BTreeMap<String, f64>,
    /// Factor applied to edges flagged as part of the main trail. Default: 1.0
    pub main_trail_factor: f64,
    /// Keep the `oneway` tag on edges. Walkers usually ignore it. Default: false
    pub respect_oneway: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        let surface_factors = [
            ("asphalt", 1.0),
            ("paved", 1.0),
            ("concrete", 1.0),
            ("compacted", 1.05),
            ("fine_gravel", 1.05),
            ("gravel", 1.1),
            ("dirt", 1.15),
            ("ground", 1.15),
            ("grass", 1.2),
            ("rock", 1.3),
            ("sand", 1.4),
            ("scree", 1.6),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            snap_tolerance_m: 0.5,
            sample_step_m: 10.0,
            costs: CategoryCosts::default(),
            highway_factors: BTreeMap::new(),
            surface_factors,
            main_trail_factor: 1.0,
            respect_oneway: false,
        }
    }
}

/// Terrain cost parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainConfig {
    pub slope_model: SlopeCostModel,
    /// Upper bound for any cell's cost multiplier. Default: 10
    pub max_cost_multiplier: f64,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            slope_model: SlopeCostModel::default(),
            max_cost_multiplier: 10.0,
        }
    }
}

/// Complete configuration of one packaging run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relation id of the main trail, used to flag its member ways
    pub trail_id: Option<u64>,
    pub corridor: CorridorConfig,
    pub zoom: ZoomRange,
    pub category_zooms: CategoryZooms,
    pub tiles: TileConfig,
    pub graph: GraphConfig,
    pub terrain: TerrainConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trail_id: None,
            corridor: CorridorConfig::default(),
            zoom: ZoomRange::default(),
            category_zooms: CategoryZooms::default(),
            tiles: TileConfig::default(),
            graph: GraphConfig::default(),
            terrain: TerrainConfig::default(),
        }
    }
}

fn require_positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(PackError::InvalidConfig(format!(
            "{name} must be finite and > 0 (got {value})"
        )))
    }
}

impl Config {
    /// Load a configuration file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Check every range before any stage runs
    pub fn validate(&self) -> Result<()> {
        self.zoom.validate()?;
        require_positive("corridor.buffer_radius_m", self.corridor.buffer_radius_m)?;
        if !(self.corridor.simplify_tolerance_m.is_finite()
            && self.corridor.simplify_tolerance_m >= 0.0)
        {
            return Err(PackError::InvalidConfig(
                "corridor.simplify_tolerance_m must be finite and >= 0".to_string(),
            ));
        }
        if self.tiles.extent == 0 {
            return Err(PackError::InvalidConfig(
                "tiles.extent must be > 0".to_string(),
            ));
        }
        if !(self.tiles.simplification.is_finite() && self.tiles.simplification >= 0.0) {
            return Err(PackError::InvalidConfig(
                "tiles.simplification must be finite and >= 0".to_string(),
            ));
        }
        require_positive("graph.snap_tolerance_m", self.graph.snap_tolerance_m)?;
        require_positive("graph.sample_step_m", self.graph.sample_step_m)?;
        require_positive("graph.costs.road", self.graph.costs.road)?;
        require_positive("graph.costs.trail", self.graph.costs.trail)?;
        require_positive("graph.main_trail_factor", self.graph.main_trail_factor)?;
        for (name, value) in self
            .graph
            .highway_factors
            .iter()
            .chain(self.graph.surface_factors.iter())
        {
            require_positive(&format!("graph factor '{name}'"), *value)?;
        }
        require_positive("terrain.max_cost_multiplier", self.terrain.max_cost_multiplier)?;
        if self.terrain.max_cost_multiplier < 1.0 {
            return Err(PackError::InvalidConfig(
                "terrain.max_cost_multiplier must be >= 1".to_string(),
            ));
        }
        self.terrain.slope_model.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.zoom, ZoomRange { min: 8, max: 14 });
        assert_eq!(config.tiles.extent, 4096);
        assert_eq!(config.graph.costs.trail, 1.2);
    }

    #[test]
    fn test_zoom_range_rejects_inverted() {
        assert!(matches!(
            ZoomRange::new(14, 10),
            Err(PackError::InvalidZoomRange { min: 14, max: 10 })
        ));
        assert!(ZoomRange::new(10, 23).is_err());
        assert!(ZoomRange::new(12, 12).is_ok());
    }

    #[test]
    fn test_zoom_range_clamp() {
        let global = ZoomRange { min: 10, max: 14 };
        let building = ZoomRange { min: 13, max: 22 };
        assert_eq!(
            building.clamp_to(global),
            Some(ZoomRange { min: 13, max: 14 })
        );
        assert_eq!(ZoomRange { min: 15, max: 16 }.clamp_to(global), None);
        assert_eq!(global.iter().collect::<Vec<_>>(), vec![10, 11, 12, 13, 14]);
        assert_eq!(global.len(), 5);
    }

    #[test]
    fn test_category_range_for() {
        let zooms = CategoryZooms::default();
        let global = ZoomRange { min: 10, max: 14 };
        assert_eq!(
            zooms.range_for(Category::Building, global),
            Some(ZoomRange { min: 13, max: 14 })
        );
        // Roads start below the global minimum and get clamped up
        assert_eq!(
            zooms.range_for(Category::Road, global),
            Some(ZoomRange { min: 10, max: 14 })
        );
        assert_eq!(
            zooms.range_for(Category::Building, ZoomRange { min: 8, max: 12 }),
            None
        );
    }

    #[test]
    fn test_category_costs() {
        let costs = CategoryCosts::default();
        assert_eq!(costs.get(Category::Road), Some(1.0));
        assert_eq!(costs.get(Category::Trail), Some(1.2));
        assert_eq!(costs.get(Category::Landcover), None);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"corridor": {"buffer_radius_m": 250.0}, "trail_id": 42}"#)
                .unwrap();
        assert_eq!(config.corridor.buffer_radius_m, 250.0);
        assert_eq!(config.corridor.simplify_tolerance_m, 200.0);
        assert_eq!(config.corridor.effective_simplify_tolerance(), 25.0);
        assert_eq!(config.trail_id, Some(42));
        assert_eq!(config.zoom, ZoomRange::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.graph.costs.trail = 0.0;
        assert!(matches!(config.validate(), Err(PackError::InvalidConfig(_))));

        let mut config = Config::default();
        config.corridor.buffer_radius_m = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.zoom = ZoomRange { min: 12, max: 9 };
        assert!(matches!(
            config.validate(),
            Err(PackError::InvalidZoomRange { .. })
        ));
    }
}
