//! Multi-zoom tile pyramid generation
//!
//! Every feature is projected to Web Mercator once. Zoom levels are then processed in parallel,
//! each one producing its own `(x, y)`-keyed map of fragments; the maps are merged by
//! [`TileId`] at the end, so the output never depends on thread scheduling.

use super::clip::{
    clip_line_runs, clip_polygon, quantize, quantize_line, quantize_polygon, simplify_line,
    simplify_polygon,
};
use super::{OverlayFragment, Tile, TileFragment, TileGeometry, TileId};
use crate::{
    AttributeValue, Category, Config, Feature, Graph, PackError, Result, TileConfig, ZoomRange,
    utils,
};

use geo::{BoundingRect, Coord, CoordsIter, Geometry, MapCoords, Polygon, Rect};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Feature geometry in Web Mercator meters, split by kind
#[derive(Debug, Clone, Default)]
struct MercatorParts {
    points: Vec<Coord<f64>>,
    lines: Vec<Vec<Coord<f64>>>,
    polygons: Vec<Polygon<f64>>,
}

impl MercatorParts {
    fn collect(geometry: &Geometry<f64>, out: &mut Self) {
        match geometry {
            Geometry::Point(p) => out.points.push(p.0),
            Geometry::MultiPoint(mp) => out.points.extend(mp.0.iter().map(|p| p.0)),
            Geometry::Line(l) => out.lines.push(vec![l.start, l.end]),
            Geometry::LineString(ls) => out.lines.push(ls.0.clone()),
            Geometry::MultiLineString(mls) => out.lines.extend(mls.0.iter().map(|ls| ls.0.clone())),
            Geometry::Polygon(p) => out.polygons.push(p.clone()),
            Geometry::MultiPolygon(mp) => out.polygons.extend(mp.0.iter().cloned()),
            Geometry::Rect(r) => out.polygons.push(r.to_polygon()),
            Geometry::Triangle(t) => out.polygons.push(t.to_polygon()),
            Geometry::GeometryCollection(gc) => {
                for g in &gc.0 {
                    Self::collect(g, out);
                }
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.points.is_empty() && self.lines.is_empty() && self.polygons.is_empty()
    }
}

/// A feature ready for tiling
#[derive(Debug)]
struct PreparedFeature {
    id: u64,
    category: Category,
    attributes: Vec<(String, AttributeValue)>,
    zoom_range: ZoomRange,
    parts: MercatorParts,
    bounds: Rect<f64>,
}

/// A graph edge ready for the overlay
#[derive(Debug)]
struct PreparedEdge {
    edge_id: u32,
    from_node: u32,
    to_node: u32,
    category: Category,
    weight: f64,
    line: Vec<Coord<f64>>,
    bounds: Rect<f64>,
}

/// Fragments of one tile before ordering
#[derive(Debug, Default)]
struct TileAccumulator {
    features: Vec<TileFragment>,
    overlay: Vec<OverlayFragment>,
}

/// Output of one zoom level
#[derive(Debug, Default)]
struct ZoomOutput {
    zoom: u8,
    tiles: BTreeMap<(u32, u32), TileAccumulator>,
    fragments: usize,
    overlay_fragments: usize,
    simplification_fallbacks: usize,
    collapsed: usize,
}

/// Counts of what the generator produced and skipped
#[derive(Debug, Default)]
pub struct PyramidReport {
    pub tiles_per_zoom: BTreeMap<u8, usize>,
    pub fragments: usize,
    pub overlay_fragments: usize,
    /// Simplifications that would have degenerated and kept the full geometry instead
    pub simplification_fallbacks: usize,
    /// Parts that collapsed below one tile unit and were dropped at that zoom
    pub collapsed: usize,
    /// Malformed features, skipped
    pub warnings: Vec<PackError>,
}

/// Non-empty tiles keyed by `(z, x, y)`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pyramid {
    pub zoom: ZoomRange,
    pub extent: u32,
    pub tiles: BTreeMap<TileId, Tile>,
}

impl Pyramid {
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn get(&self, id: &TileId) -> Option<&Tile> {
        self.tiles.get(id)
    }

    /// Tiles in `(z, x, y)` order
    pub fn iter(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.values()
    }

    pub fn tiles_per_zoom(&self) -> BTreeMap<u8, usize> {
        let mut counts = BTreeMap::new();
        for id in self.tiles.keys() {
            *counts.entry(id.zoom).or_insert(0) += 1;
        }
        counts
    }

    /// Every tile holding a fragment of `feature_id`
    pub fn tiles_with_feature(&self, feature_id: u64) -> Vec<TileId> {
        self.tiles
            .iter()
            .filter(|(_, tile)| tile.features.iter().any(|f| f.feature_id == feature_id))
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Cuts normalized features (and optionally graph edges) into a tile pyramid
#[derive(Debug, Clone)]
pub struct TilePyramidGenerator {
    zoom: ZoomRange,
    config: TileConfig,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl TilePyramidGenerator {
    pub fn new(config: &Config) -> Self {
        Self {
            zoom: config.zoom,
            config: config.tiles.clone(),
        }
    }

    /// Generate every non-empty tile between the configured zooms.
    ///
    /// Malformed features are skipped and recorded in the report. Fails with
    /// `InvalidZoomRange` before doing any work, and with `EmptyPyramid` if nothing was emitted.
    pub fn generate(
        &self,
        features: &[Feature],
        graph: Option<&Graph>,
    ) -> Result<(Pyramid, PyramidReport)> {
        #[cfg(feature = "profiling")]
        profiling::scope!("tiles::generate");

        self.zoom.validate()?;
        if self.config.extent == 0 {
            return Err(PackError::InvalidConfig("tiles.extent must be > 0".to_string()));
        }
        let start = std::time::Instant::now();
        let mut report = PyramidReport::default();

        let mut prepared = Vec::with_capacity(features.len());
        for feature in features {
            match self.prepare_feature(feature) {
                Ok(Some(p)) => prepared.push(p),
                Ok(None) => {}
                Err(reason) => {
                    let err = PackError::FeatureClip {
                        feature_id: feature.id,
                        reason,
                    };
                    tracing::warn!("Skipped while tiling: {}", err);
                    report.warnings.push(err);
                }
            }
        }
        prepared.sort_by_key(|p| (p.category.priority(), p.id));

        let edges: Vec<PreparedEdge> = match graph {
            Some(graph) if self.config.graph_overlay => {
                graph.edges.iter().filter_map(prepare_edge).collect()
            }
            _ => Vec::new(),
        };

        let zooms: Vec<u8> = self.zoom.iter().collect();
        let outputs: Vec<ZoomOutput> = zooms
            .par_iter()
            .map(|&zoom| self.process_zoom(zoom, &prepared, &edges))
            .collect();

        let mut tiles: BTreeMap<TileId, Tile> = BTreeMap::new();
        for output in outputs {
            report.fragments += output.fragments;
            report.overlay_fragments += output.overlay_fragments;
            report.simplification_fallbacks += output.simplification_fallbacks;
            report.collapsed += output.collapsed;
            for ((x, y), mut acc) in output.tiles {
                if acc.features.is_empty() && acc.overlay.is_empty() {
                    continue;
                }
                acc.features
                    .sort_by_key(|f| (f.category.priority(), f.feature_id));
                acc.overlay.sort_by_key(|o| o.edge_id);
                let id = TileId {
                    zoom: output.zoom,
                    x,
                    y,
                };
                tiles.insert(
                    id,
                    Tile {
                        zoom: id.zoom,
                        x,
                        y,
                        extent: self.config.extent,
                        features: acc.features,
                        graph_overlay: (!acc.overlay.is_empty()).then_some(acc.overlay),
                    },
                );
            }
        }

        if tiles.is_empty() {
            return Err(PackError::EmptyPyramid);
        }

        let pyramid = Pyramid {
            zoom: self.zoom,
            extent: self.config.extent,
            tiles,
        };
        report.tiles_per_zoom = pyramid.tiles_per_zoom();

        tracing::info!(
            "Generated {} tiles over zooms {} ({} fragments, {} overlay fragments, {} collapsed, {} skipped) in {:?}",
            pyramid.len(),
            self.zoom,
            report.fragments,
            report.overlay_fragments,
            report.collapsed,
            report.warnings.len(),
            start.elapsed()
        );

        Ok((pyramid, report))
    }

    /// Project a feature to Web Mercator. `Ok(None)` if it is never visible in the pyramid.
    fn prepare_feature(
        &self,
        feature: &Feature,
    ) -> std::result::Result<Option<PreparedFeature>, String> {
        let Some(zoom_range) = feature.zoom_range.clamp_to(self.zoom) else {
            return Ok(None);
        };
        if let Some(bad) = feature
            .geometry
            .coords_iter()
            .find(|c| !utils::is_valid_lon_lat(*c))
        {
            return Err(format!("invalid coordinate ({}, {})", bad.x, bad.y));
        }

        let projected = feature.geometry.map_coords(utils::coord_to_mercator);
        let mut parts = MercatorParts::default();
        MercatorParts::collect(&projected, &mut parts);
        parts.lines.retain(|l| l.len() >= 2);
        parts.polygons.retain(|p| p.exterior().0.len() >= 4);
        if parts.is_empty() {
            return Err("geometry has no drawable part".to_string());
        }
        let Some(bounds) = projected.bounding_rect() else {
            return Err("geometry has no extent".to_string());
        };

        Ok(Some(PreparedFeature {
            id: feature.id,
            category: feature.category,
            attributes: feature
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            zoom_range,
            parts,
            bounds,
        }))
    }

    fn process_zoom(
        &self,
        zoom: u8,
        features: &[PreparedFeature],
        edges: &[PreparedEdge],
    ) -> ZoomOutput {
        #[cfg(feature = "profiling")]
        profiling::scope!("tiles::process_zoom");

        let extent = self.config.extent;
        let unit_m = utils::tile_size_meters(zoom) / extent as f64;
        let tolerance = self.config.simplification * unit_m;
        let buffer_m = self.config.buffer as f64 * unit_m;
        let mut output = ZoomOutput {
            zoom,
            ..Default::default()
        };

        for feature in features.iter().filter(|f| f.zoom_range.contains(zoom)) {
            let parts = simplify_parts(
                &feature.parts,
                tolerance,
                &mut output.simplification_fallbacks,
            );
            for_each_tile(zoom, feature.bounds, buffer_m, |x, y, tile, clip_rect| {
                let geometry = cut_parts(&parts, tile, clip_rect, extent, &mut output.collapsed);
                if !geometry.is_empty() {
                    output.fragments += 1;
                    output
                        .tiles
                        .entry((x, y))
                        .or_default()
                        .features
                        .push(TileFragment {
                            feature_id: feature.id,
                            category: feature.category,
                            attributes: feature.attributes.clone(),
                            geometry,
                        });
                }
            });
        }

        for edge in edges {
            let line = match simplify_line(&edge.line, tolerance) {
                Some(line) => line,
                None => {
                    output.simplification_fallbacks += 1;
                    edge.line.clone()
                }
            };
            for_each_tile(zoom, edge.bounds, buffer_m, |x, y, tile, clip_rect| {
                let lines: Vec<_> = clip_line_runs(&line, clip_rect)
                    .iter()
                    .filter_map(|run| quantize_line(run, tile, extent))
                    .collect();
                if !lines.is_empty() {
                    output.overlay_fragments += 1;
                    output
                        .tiles
                        .entry((x, y))
                        .or_default()
                        .overlay
                        .push(OverlayFragment {
                            edge_id: edge.edge_id,
                            from_node: edge.from_node,
                            to_node: edge.to_node,
                            category: edge.category,
                            weight: edge.weight,
                            lines,
                        });
                }
            });
        }

        tracing::debug!(
            "Zoom {}: {} tiles, {} fragments, {} overlay fragments",
            zoom,
            output.tiles.len(),
            output.fragments,
            output.overlay_fragments
        );
        output
    }
}

fn prepare_edge(edge: &crate::GraphEdge) -> Option<PreparedEdge> {
    let line: Vec<Coord<f64>> = edge
        .geometry
        .0
        .iter()
        .map(|c| utils::coord_to_mercator(*c))
        .collect();
    let bounds = edge.geometry.map_coords(utils::coord_to_mercator).bounding_rect()?;
    Some(PreparedEdge {
        edge_id: edge.edge_id,
        from_node: edge.from_node,
        to_node: edge.to_node,
        category: edge.base_category,
        weight: edge.weight,
        line,
        bounds,
    })
}

/// Call `f(x, y, tile_bounds, clip_rect)` for every tile whose buffered bounds meet `bounds`
fn for_each_tile(
    zoom: u8,
    bounds: Rect<f64>,
    buffer_m: f64,
    mut f: impl FnMut(u32, u32, Rect<f64>, Rect<f64>),
) {
    let pad = Coord {
        x: buffer_m,
        y: buffer_m,
    };
    let search = Rect::new(bounds.min() - pad, bounds.max() + pad);
    let (x0, x1, y0, y1) = utils::tile_range_for_rect(zoom, search);
    for x in x0..=x1 {
        for y in y0..=y1 {
            let tile = utils::tile_bounds_mercator(zoom, x, y);
            let clip_rect = Rect::new(tile.min() - pad, tile.max() + pad);
            f(x, y, tile, clip_rect);
        }
    }
}

/// Simplify every part for one zoom, keeping the input where simplification degenerates
fn simplify_parts(parts: &MercatorParts, tolerance: f64, fallbacks: &mut usize) -> MercatorParts {
    let lines = parts
        .lines
        .iter()
        .map(|line| {
            simplify_line(line, tolerance).unwrap_or_else(|| {
                *fallbacks += 1;
                line.clone()
            })
        })
        .collect();
    let polygons = parts
        .polygons
        .iter()
        .map(|polygon| {
            simplify_polygon(polygon, tolerance).unwrap_or_else(|| {
                *fallbacks += 1;
                polygon.clone()
            })
        })
        .collect();
    MercatorParts {
        points: parts.points.clone(),
        lines,
        polygons,
    }
}

/// Clip and quantize the parts that fall into one buffered tile
fn cut_parts(
    parts: &MercatorParts,
    tile: Rect<f64>,
    clip_rect: Rect<f64>,
    extent: u32,
    collapsed: &mut usize,
) -> TileGeometry {
    let mut geometry = TileGeometry::default();
    let min = clip_rect.min();
    let max = clip_rect.max();

    for point in &parts.points {
        if point.x >= min.x && point.x <= max.x && point.y >= min.y && point.y <= max.y {
            geometry.points.push(quantize(*point, tile, extent));
        }
    }
    for line in &parts.lines {
        for run in clip_line_runs(line, clip_rect) {
            match quantize_line(&run, tile, extent) {
                Some(q) => geometry.lines.push(q),
                None => *collapsed += 1,
            }
        }
    }
    for polygon in &parts.polygons {
        for piece in clip_polygon(polygon, clip_rect) {
            match quantize_polygon(&piece, tile, extent) {
                Some(q) => geometry.polygons.push(q),
                None => *collapsed += 1,
            }
        }
    }
    geometry
}
