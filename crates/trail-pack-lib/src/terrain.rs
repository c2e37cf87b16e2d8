//! Terrain cost grid derived from a DEM
//!
//! The DEM is cropped to the corridor, per-cell slope is computed with Horn's method in
//! meters, and each slope is mapped to a traversal-cost multiplier by a [`SlopeCostModel`].

use crate::config::TerrainConfig;
use crate::utils::LocalProjection;
use crate::{PackError, Result};

use geo::{Coord, Rect};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Mapping from slope to cost multiplier (always >= 1, capped by the terrain config)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum SlopeCostModel {
    /// `exp(rate * tan(slope))`, the shape of Tobler's hiking function
    Exponential { rate: f64 },
    /// `1 + per_degree * slope_degrees`
    Linear { per_degree: f64 },
    /// Terrain is ignored
    Flat,
}

impl Default for SlopeCostModel {
    fn default() -> Self {
        SlopeCostModel::Exponential { rate: 3.5 }
    }
}

impl SlopeCostModel {
    pub fn validate(&self) -> Result<()> {
        let coefficient = match self {
            SlopeCostModel::Exponential { rate } => *rate,
            SlopeCostModel::Linear { per_degree } => *per_degree,
            SlopeCostModel::Flat => 0.0,
        };
        if coefficient.is_finite() && coefficient >= 0.0 {
            Ok(())
        } else {
            Err(PackError::InvalidConfig(format!(
                "slope model coefficient must be finite and >= 0 (got {coefficient})"
            )))
        }
    }

    /// Cost multiplier for a slope in degrees, before capping
    pub fn multiplier(&self, slope_degrees: f64) -> f64 {
        let slope = slope_degrees.abs().min(89.9);
        match self {
            SlopeCostModel::Exponential { rate } => (rate * slope.to_radians().tan()).exp(),
            SlopeCostModel::Linear { per_degree } => 1.0 + per_degree * slope,
            SlopeCostModel::Flat => 1.0,
        }
    }
}

/// Walking speed in km/h on a signed gradient (rise over run), after Tobler
#[inline]
pub fn tobler_speed_kmh(gradient: f64) -> f64 {
    6.0 * (-3.5 * (gradient + 0.05).abs()).exp()
}

/// DEM raster in geographic coordinates, rows ordered north to south
#[derive(Debug, Clone, PartialEq)]
pub struct ElevationGrid {
    west: f64,
    north: f64,
    cell_width: f64,
    cell_height: f64,
    cols: usize,
    rows: usize,
    nodata: Option<f64>,
    values: Vec<f64>,
}

impl ElevationGrid {
    /// Create a grid from row-major values (first row is the northernmost)
    pub fn new(
        west: f64,
        north: f64,
        cell_width: f64,
        cell_height: f64,
        cols: usize,
        rows: usize,
        values: Vec<f64>,
        nodata: Option<f64>,
    ) -> Result<Self> {
        if cols == 0 || rows == 0 {
            return Err(PackError::Raster("DEM has no cells".to_string()));
        }
        if values.len() != cols * rows {
            return Err(PackError::Raster(format!(
                "DEM has {} values but {}x{} cells",
                values.len(),
                cols,
                rows
            )));
        }
        if !(cell_width.is_finite()
            && cell_width > 0.0
            && cell_height.is_finite()
            && cell_height > 0.0)
        {
            return Err(PackError::Raster(format!(
                "invalid DEM cell size {cell_width} x {cell_height}"
            )));
        }
        Ok(Self {
            west,
            north,
            cell_width,
            cell_height,
            cols,
            rows,
            nodata,
            values,
        })
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn bounds(&self) -> Rect<f64> {
        Rect::new(
            Coord {
                x: self.west,
                y: self.north - self.rows as f64 * self.cell_height,
            },
            Coord {
                x: self.west + self.cols as f64 * self.cell_width,
                y: self.north,
            },
        )
    }

    /// Elevation of a cell, `None` for nodata
    pub fn value(&self, row: usize, col: usize) -> Option<f64> {
        let v = *self.values.get(row * self.cols + col)?;
        let is_nodata =
            self.nodata.is_some_and(|nd| (v - nd).abs() < f64::EPSILON) || !v.is_finite();
        (!is_nodata).then_some(v)
    }
}

/// A single terrain cell
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TerrainCell {
    pub cell_id: u64,
    pub bounding_box: Rect<f64>,
    pub slope_degrees: f64,
    pub cost_multiplier: f64,
    pub elevation_m: Option<f64>,
}

/// Per-cell slope and cost multiplier over the corridor extent
#[derive(Debug, Clone)]
pub struct TerrainCostGrid {
    west: f64,
    north: f64,
    cell_width: f64,
    cell_height: f64,
    cols: usize,
    rows: usize,
    /// NaN where the DEM has no data
    elevation: Vec<f64>,
    slope_degrees: Vec<f64>,
    multiplier: Vec<f64>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl TerrainCostGrid {
    /// Grid without terrain: every multiplier is 1 and every elevation 0
    pub fn flat() -> Self {
        Self {
            west: 0.0,
            north: 0.0,
            cell_width: 1.0,
            cell_height: 1.0,
            cols: 0,
            rows: 0,
            elevation: Vec::new(),
            slope_degrees: Vec::new(),
            multiplier: Vec::new(),
        }
    }

    /// Derive slopes and multipliers for the part of `dem` covering `extent`.
    ///
    /// One extra cell is kept on every side so slopes at the extent border see their
    /// neighbours.
    pub fn build(dem: &ElevationGrid, extent: Rect<f64>, config: &TerrainConfig) -> Result<Self> {
        #[cfg(feature = "profiling")]
        profiling::scope!("terrain::build");

        config.slope_model.validate()?;

        let col_of = |x: f64| (x - dem.west) / dem.cell_width;
        let row_of = |y: f64| (dem.north - y) / dem.cell_height;
        let c0 = (col_of(extent.min().x).floor() - 1.0).max(0.0);
        let c1 = (col_of(extent.max().x).ceil() + 1.0).min(dem.cols as f64);
        let r0 = (row_of(extent.max().y).floor() - 1.0).max(0.0);
        let r1 = (row_of(extent.min().y).ceil() + 1.0).min(dem.rows as f64);
        if c0 >= c1 || r0 >= r1 {
            return Err(PackError::Raster(format!(
                "DEM bounds {:?} do not overlap the corridor {:?}",
                dem.bounds(),
                extent
            )));
        }
        let (c0, c1, r0, r1) = (c0 as usize, c1 as usize, r0 as usize, r1 as usize);
        let cols = c1 - c0;
        let rows = r1 - r0;

        let mut elevation = Vec::with_capacity(cols * rows);
        for row in r0..r1 {
            for col in c0..c1 {
                elevation.push(dem.value(row, col).unwrap_or(f64::NAN));
            }
        }

        let west = dem.west + c0 as f64 * dem.cell_width;
        let north = dem.north - r0 as f64 * dem.cell_height;
        let centre = Coord {
            x: west + cols as f64 * dem.cell_width / 2.0,
            y: north - rows as f64 * dem.cell_height / 2.0,
        };
        let (m_per_deg_x, m_per_deg_y) = LocalProjection::new(centre).meters_per_degree();
        let dx = dem.cell_width * m_per_deg_x;
        let dy = dem.cell_height * m_per_deg_y;

        let mut slope_degrees = vec![0.0; cols * rows];
        slope_degrees
            .par_chunks_mut(cols)
            .enumerate()
            .for_each(|(row, out)| {
                for (col, slope) in out.iter_mut().enumerate() {
                    *slope = horn_slope_degrees(&elevation, cols, rows, row, col, dx, dy);
                }
            });

        let model = config.slope_model;
        let cap = config.max_cost_multiplier;
        let multiplier: Vec<f64> = slope_degrees
            .par_iter()
            .map(|slope| model.multiplier(*slope).clamp(1.0, cap))
            .collect();

        let grid = Self {
            west,
            north,
            cell_width: dem.cell_width,
            cell_height: dem.cell_height,
            cols,
            rows,
            elevation,
            slope_degrees,
            multiplier,
        };

        let (mean, max) = grid.slope_stats();
        tracing::info!(
            "Terrain grid: {}x{} cells ({:.1} m x {:.1} m), mean slope {:.1} deg, max slope {:.1} deg",
            cols,
            rows,
            dx,
            dy,
            mean,
            max
        );
        Ok(grid)
    }

    pub fn is_flat(&self) -> bool {
        self.cols == 0 || self.rows == 0
    }

    pub fn len(&self) -> usize {
        self.cols * self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bounds(&self) -> Option<Rect<f64>> {
        (!self.is_flat()).then(|| {
            Rect::new(
                Coord {
                    x: self.west,
                    y: self.north - self.rows as f64 * self.cell_height,
                },
                Coord {
                    x: self.west + self.cols as f64 * self.cell_width,
                    y: self.north,
                },
            )
        })
    }

    fn index_of(&self, coord: Coord<f64>) -> Option<usize> {
        if self.is_flat() {
            return None;
        }
        let col = ((coord.x - self.west) / self.cell_width).floor();
        let row = ((self.north - coord.y) / self.cell_height).floor();
        if col < 0.0 || row < 0.0 || col >= self.cols as f64 || row >= self.rows as f64 {
            return None;
        }
        Some(row as usize * self.cols + col as usize)
    }

    fn cell(&self, index: usize) -> TerrainCell {
        let row = index / self.cols;
        let col = index % self.cols;
        let min = Coord {
            x: self.west + col as f64 * self.cell_width,
            y: self.north - (row + 1) as f64 * self.cell_height,
        };
        let max = Coord {
            x: min.x + self.cell_width,
            y: min.y + self.cell_height,
        };
        let elevation = self.elevation[index];
        TerrainCell {
            cell_id: index as u64,
            bounding_box: Rect::new(min, max),
            slope_degrees: self.slope_degrees[index],
            cost_multiplier: self.multiplier[index],
            elevation_m: elevation.is_finite().then_some(elevation),
        }
    }

    /// Cell containing the coordinate
    pub fn cell_at(&self, coord: Coord<f64>) -> Option<TerrainCell> {
        self.index_of(coord).map(|index| self.cell(index))
    }

    /// All cells in row-major order
    pub fn cells(&self) -> impl Iterator<Item = TerrainCell> + '_ {
        (0..self.len()).map(|index| self.cell(index))
    }

    /// Cost multiplier at a coordinate, 1.0 outside the grid
    #[inline]
    pub fn cost_multiplier_at(&self, coord: Coord<f64>) -> f64 {
        self.index_of(coord)
            .map(|index| self.multiplier[index])
            .unwrap_or(1.0)
    }

    /// Bilinear elevation between cell centres, ignoring nodata neighbours.
    /// Coordinates outside the grid use the nearest border cells.
    pub fn elevation_at(&self, coord: Coord<f64>) -> Option<f64> {
        if self.is_flat() {
            return Some(0.0);
        }
        let last_col = (self.cols - 1) as f64;
        let last_row = (self.rows - 1) as f64;
        let fx = ((coord.x - self.west) / self.cell_width - 0.5).clamp(0.0, last_col);
        let fy = ((self.north - coord.y) / self.cell_height - 0.5).clamp(0.0, last_row);
        let c0 = fx.floor() as usize;
        let r0 = fy.floor() as usize;
        let c1 = (c0 + 1).min(self.cols - 1);
        let r1 = (r0 + 1).min(self.rows - 1);
        let tx = fx - c0 as f64;
        let ty = fy - r0 as f64;

        let corners = [
            (r0, c0, (1.0 - tx) * (1.0 - ty)),
            (r0, c1, tx * (1.0 - ty)),
            (r1, c0, (1.0 - tx) * ty),
            (r1, c1, tx * ty),
        ];
        let mut sum = 0.0;
        let mut weight = 0.0;
        let mut plain_sum = 0.0;
        let mut plain_count = 0usize;
        for (row, col, w) in corners {
            let value = self.elevation[row * self.cols + col];
            if value.is_finite() {
                sum += value * w;
                weight += w;
                plain_sum += value;
                plain_count += 1;
            }
        }
        if weight > 0.0 {
            Some(sum / weight)
        } else if plain_count > 0 {
            // Every weighted corner is nodata, use the remaining ones
            Some(plain_sum / plain_count as f64)
        } else {
            None
        }
    }

    /// Mean and maximum slope in degrees over cells with data
    pub fn slope_stats(&self) -> (f64, f64) {
        let mut sum = 0.0;
        let mut max: f64 = 0.0;
        let mut count = 0usize;
        for (slope, elevation) in self.slope_degrees.iter().zip(&self.elevation) {
            if elevation.is_finite() {
                sum += slope;
                max = max.max(*slope);
                count += 1;
            }
        }
        if count == 0 {
            (0.0, 0.0)
        } else {
            (sum / count as f64, max)
        }
    }
}

/// Horn's 3x3 slope in degrees. Border and nodata neighbours fall back to the centre value.
fn horn_slope_degrees(
    elevation: &[f64],
    cols: usize,
    rows: usize,
    row: usize,
    col: usize,
    dx: f64,
    dy: f64,
) -> f64 {
    let centre = elevation[row * cols + col];
    if !centre.is_finite() {
        return 0.0;
    }
    let at = |dr: isize, dc: isize| -> f64 {
        let r = row as isize + dr;
        let c = col as isize + dc;
        if r < 0 || c < 0 || r >= rows as isize || c >= cols as isize {
            return centre;
        }
        let v = elevation[r as usize * cols + c as usize];
        if v.is_finite() { v } else { centre }
    };

    let (a, b, c) = (at(-1, -1), at(-1, 0), at(-1, 1));
    let (d, f) = (at(0, -1), at(0, 1));
    let (g, h, i) = (at(1, -1), at(1, 0), at(1, 1));

    let dz_dx = ((c + 2.0 * f + i) - (a + 2.0 * d + g)) / (8.0 * dx);
    let dz_dy = ((g + 2.0 * h + i) - (a + 2.0 * b + c)) / (8.0 * dy);
    dz_dx.hypot(dz_dy).atan().to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 10x10 grid of 0.001 deg cells starting at (-72.81, 44.005)
    fn grid_from(f: impl Fn(usize, usize) -> f64) -> ElevationGrid {
        let mut values = Vec::new();
        for row in 0..10 {
            for col in 0..10 {
                values.push(f(row, col));
            }
        }
        ElevationGrid::new(-72.81, 44.005, 0.001, 0.001, 10, 10, values, Some(-9999.0)).unwrap()
    }

    fn whole(grid: &ElevationGrid) -> Rect<f64> {
        grid.bounds()
    }

    #[test]
    fn test_flat_dem_has_unit_multiplier() {
        let dem = grid_from(|_, _| 250.0);
        let terrain = TerrainCostGrid::build(&dem, whole(&dem), &TerrainConfig::default()).unwrap();
        assert_eq!(terrain.len(), 100);
        for cell in terrain.cells() {
            assert_eq!(cell.slope_degrees, 0.0);
            assert_eq!(cell.cost_multiplier, 1.0);
        }
        let elevation = terrain.elevation_at(Coord { x: -72.805, y: 44.0 }).unwrap();
        assert!((elevation - 250.0).abs() < 1e-9);
    }

    #[test]
    fn test_uniform_east_slope() {
        // Elevation grows 10 m per column; a column is ~80 m wide at 44N
        let dem = grid_from(|_, col| col as f64 * 10.0);
        let terrain = TerrainCostGrid::build(&dem, whole(&dem), &TerrainConfig::default()).unwrap();
        let cell = terrain.cell_at(Coord { x: -72.8045, y: 44.0005 }).unwrap();
        let column_width = 0.001
            * LocalProjection::new(Coord { x: -72.805, y: 44.0 })
                .meters_per_degree()
                .0;
        let expected = (10.0 / column_width).atan().to_degrees();
        assert!(
            (cell.slope_degrees - expected).abs() < 0.05,
            "{} vs {expected}",
            cell.slope_degrees
        );
        assert!(cell.cost_multiplier > 1.0);
        let expected_multiplier = (3.5 * (10.0 / column_width)).exp();
        assert!((cell.cost_multiplier - expected_multiplier).abs() < 0.01);
    }

    #[test]
    fn test_multiplier_is_capped() {
        let dem = grid_from(|_, col| col as f64 * 1000.0);
        let config = TerrainConfig {
            max_cost_multiplier: 4.0,
            ..TerrainConfig::default()
        };
        let terrain = TerrainCostGrid::build(&dem, whole(&dem), &config).unwrap();
        assert!(terrain.cells().all(|c| c.cost_multiplier <= 4.0));
        assert!(terrain.cells().any(|c| c.cost_multiplier == 4.0));
    }

    #[test]
    fn test_outside_grid_is_neutral() {
        let dem = grid_from(|_, col| col as f64 * 10.0);
        let terrain = TerrainCostGrid::build(&dem, whole(&dem), &TerrainConfig::default()).unwrap();
        assert_eq!(terrain.cost_multiplier_at(Coord { x: 10.0, y: 10.0 }), 1.0);
        assert!(terrain.cell_at(Coord { x: 10.0, y: 10.0 }).is_none());
    }

    #[test]
    fn test_crop_to_extent() {
        let dem = grid_from(|_, _| 100.0);
        let extent = Rect::new(
            Coord { x: -72.8075, y: 43.9985 },
            Coord { x: -72.8055, y: 44.0015 },
        );
        let terrain = TerrainCostGrid::build(&dem, extent, &TerrainConfig::default()).unwrap();
        assert!(terrain.len() < 100);
        let bounds = terrain.bounds().unwrap();
        assert!(bounds.min().x <= extent.min().x && bounds.max().x >= extent.max().x);
        assert!(bounds.min().y <= extent.min().y && bounds.max().y >= extent.max().y);
    }

    #[test]
    fn test_no_overlap_is_raster_error() {
        let dem = grid_from(|_, _| 100.0);
        let extent = Rect::new(Coord { x: 10.0, y: 10.0 }, Coord { x: 11.0, y: 11.0 });
        assert!(matches!(
            TerrainCostGrid::build(&dem, extent, &TerrainConfig::default()),
            Err(PackError::Raster(_))
        ));
    }

    #[test]
    fn test_nodata_is_ignored() {
        let dem = grid_from(|row, col| if row == 5 && col == 5 { -9999.0 } else { 100.0 });
        let terrain = TerrainCostGrid::build(&dem, whole(&dem), &TerrainConfig::default()).unwrap();
        assert!(terrain.cells().all(|c| c.slope_degrees == 0.0));
        let hole = terrain.cell_at(Coord { x: -72.8045, y: 43.9995 }).unwrap();
        assert_eq!(hole.elevation_m, None);
        let near = terrain.elevation_at(Coord { x: -72.8045, y: 43.9995 }).unwrap();
        assert!((near - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_flat_grid() {
        let terrain = TerrainCostGrid::flat();
        assert!(terrain.is_flat());
        assert_eq!(terrain.cost_multiplier_at(Coord { x: 1.0, y: 1.0 }), 1.0);
        assert_eq!(terrain.elevation_at(Coord { x: 1.0, y: 1.0 }), Some(0.0));
    }

    #[test]
    fn test_slope_models() {
        assert_eq!(SlopeCostModel::Flat.multiplier(30.0), 1.0);
        assert!((SlopeCostModel::Linear { per_degree: 0.1 }.multiplier(10.0) - 2.0).abs() < 1e-12);
        let tobler = SlopeCostModel::default().multiplier(45.0);
        assert!((tobler - 3.5f64.exp()).abs() < 1e-9);
        assert!(SlopeCostModel::Exponential { rate: -1.0 }.validate().is_err());
    }

    #[test]
    fn test_tobler_speed() {
        assert!((tobler_speed_kmh(-0.05) - 6.0).abs() < 1e-12);
        assert!((tobler_speed_kmh(0.0) - 5.036).abs() < 1e-3);
        assert!(tobler_speed_kmh(0.3) < tobler_speed_kmh(0.0));
    }

    #[test]
    fn test_grid_size_mismatch() {
        assert!(matches!(
            ElevationGrid::new(0.0, 0.0, 1.0, 1.0, 2, 2, vec![1.0; 3], None),
            Err(PackError::Raster(_))
        ));
    }
}
