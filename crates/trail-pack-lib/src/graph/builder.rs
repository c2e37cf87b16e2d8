//! Weighted graph construction from road and trail features

use super::noding::{Piece, node_polylines};
use super::union_find::DisjointSet;
use super::{CumulativeMeasure, Graph, GraphEdge, GraphNode};
use crate::config::{Config, GraphConfig};
use crate::terrain::tobler_speed_kmh;
use crate::utils::{self, LocalProjection};
use crate::{Feature, PackError, Result, TerrainCostGrid};

use geo::{BoundingRect, Coord, Geometry, LineString, MultiPoint, Point};
use rayon::prelude::*;
use std::collections::HashMap;

/// Counters and non-fatal issues of one graph build
#[derive(Debug, Default)]
pub struct BuildStats {
    pub input_features: usize,
    pub input_lines: usize,
    pub split_events: usize,
    pub pieces: usize,
    /// Pieces shorter than the snap tolerance whose ends merged into one node
    pub collapsed: usize,
    /// Pieces rejected for a non-finite or non-positive weight
    pub rejected: usize,
    pub pruned_nodes: usize,
    pub nodes: usize,
    pub edges: usize,
    pub connected_components: usize,
    pub total_length_m: f64,
    pub warnings: Vec<PackError>,
}

/// One input polyline and the feature it came from
struct Polyline<'a> {
    feature: &'a Feature,
    coords: Vec<Coord<f64>>,
}

fn collect_lines(geometry: &Geometry<f64>, out: &mut Vec<Vec<Coord<f64>>>) {
    match geometry {
        Geometry::Line(line) => out.push(vec![line.start, line.end]),
        Geometry::LineString(ls) => out.push(ls.0.clone()),
        Geometry::MultiLineString(mls) => out.extend(mls.0.iter().map(|ls| ls.0.clone())),
        Geometry::GeometryCollection(gc) => {
            for g in &gc.0 {
                collect_lines(g, out);
            }
        }
        _ => {}
    }
}

/// Terrain-derived measures of one edge
struct EdgeProfile {
    average_multiplier: f64,
    gain_m: f64,
    loss_m: f64,
    walk_forward_s: f64,
    walk_reverse_s: f64,
    measures: Vec<CumulativeMeasure>,
}

/// Builds a routable [`Graph`] from road and trail features
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    config: GraphConfig,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl GraphBuilder {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.graph.clone(),
        }
    }

    /// Base cost of a feature: category cost times highway, surface and main-trail factors
    pub fn base_cost(&self, feature: &Feature) -> f64 {
        let costs = &self.config.costs;
        let category = costs.get(feature.category).unwrap_or(costs.trail);
        let highway = feature
            .text("highway")
            .and_then(|h| self.config.highway_factors.get(h))
            .copied()
            .unwrap_or(1.0);
        let surface = feature
            .text("surface")
            .and_then(|s| self.config.surface_factors.get(s))
            .copied()
            .unwrap_or(1.0);
        let main_trail = if feature.is_main_trail() {
            self.config.main_trail_factor
        } else {
            1.0
        };
        category * highway * surface * main_trail
    }

    /// Build the graph from every routable line feature.
    ///
    /// Fails with `DegenerateGeometry` only when no valid edge survives.
    pub fn build<'a>(
        &self,
        features: impl IntoIterator<Item = &'a Feature>,
        terrain: &TerrainCostGrid,
    ) -> Result<(Graph, BuildStats)> {
        #[cfg(feature = "profiling")]
        profiling::scope!("graph::build");

        let start = std::time::Instant::now();
        let mut stats = BuildStats::default();

        // Deterministic input order: by feature id, then category
        let mut routable: Vec<&Feature> = features
            .into_iter()
            .filter(|f| f.category.is_routable())
            .collect();
        routable.sort_by_key(|f| (f.id, f.category));
        stats.input_features = routable.len();

        let mut polylines: Vec<Polyline> = Vec::new();
        for feature in routable {
            let mut lines = Vec::new();
            collect_lines(&feature.geometry, &mut lines);
            for coords in lines {
                if coords.len() >= 2 {
                    polylines.push(Polyline { feature, coords });
                }
            }
        }
        stats.input_lines = polylines.len();

        let all_points = MultiPoint(
            polylines
                .iter()
                .flat_map(|p| p.coords.iter().map(|c| Point(*c)))
                .collect(),
        );
        let Some(extent) = all_points.bounding_rect() else {
            return Err(PackError::DegenerateGeometry(
                "no road or trail lines inside the corridor".to_string(),
            ));
        };
        let projection = LocalProjection::centered_on(extent);
        let tolerance = self.config.snap_tolerance_m;

        // 1. Split at intersections, in meters
        let projected: Vec<Vec<Coord<f64>>> = polylines
            .iter()
            .map(|p| p.coords.iter().map(|c| projection.project(*c)).collect())
            .collect();
        let (pieces, split_events) = node_polylines(&projected, tolerance);
        stats.split_events = split_events;
        stats.pieces = pieces.len();

        // 2. Snap piece endpoints within tolerance
        let (endpoint_node, node_coords) = snap_endpoints(&pieces, tolerance);

        // Drop pieces whose ends merged and that are too short to be a real loop
        let mut kept: Vec<(usize, &Piece, usize, usize)> = Vec::with_capacity(pieces.len());
        for (index, piece) in pieces.iter().enumerate() {
            let from = endpoint_node[2 * index];
            let to = endpoint_node[2 * index + 1];
            if from == to && planar_length(&piece.coords) < tolerance.max(f64::EPSILON) * 2.0 {
                stats.collapsed += 1;
                continue;
            }
            kept.push((index, piece, from, to));
        }

        // 3-6. Measure and weight every piece in parallel; results keep piece order
        let weighted: Vec<std::result::Result<GraphEdge, (u64, String)>> = kept
            .par_iter()
            .map(|&(_, piece, from, to)| {
                let feature = polylines[piece.polyline].feature;
                let mut coords: Vec<Coord<f64>> =
                    piece.coords.iter().map(|c| projection.unproject(*c)).collect();
                // Endpoints take the shared node position so edges meet exactly
                if let Some(first) = coords.first_mut() {
                    *first = projection.unproject(node_coords[from]);
                }
                if let Some(last) = coords.last_mut() {
                    *last = projection.unproject(node_coords[to]);
                }
                self.weigh(feature, coords, from, to, terrain)
            })
            .collect();

        let mut edges = Vec::with_capacity(weighted.len());
        for result in weighted {
            match result {
                Ok(edge) => edges.push(edge),
                Err((feature_id, reason)) => {
                    let err = PackError::FeatureClip { feature_id, reason };
                    tracing::warn!("Rejected graph segment: {}", err);
                    stats.rejected += 1;
                    stats.warnings.push(err);
                }
            }
        }

        if edges.is_empty() {
            return Err(PackError::DegenerateGeometry(format!(
                "no valid graph segment survived ({} pieces, {} collapsed, {} rejected)",
                stats.pieces, stats.collapsed, stats.rejected
            )));
        }

        // 7. Keep only nodes used by an edge, renumbered in order of first use
        let mut remap: HashMap<usize, u32> = HashMap::new();
        let mut nodes: Vec<GraphNode> = Vec::new();
        for edge in &mut edges {
            for endpoint in [&mut edge.from_node, &mut edge.to_node] {
                let cluster = *endpoint as usize;
                let id = *remap.entry(cluster).or_insert_with(|| {
                    let coordinate = projection.unproject(node_coords[cluster]);
                    nodes.push(GraphNode {
                        node_id: nodes.len() as u32,
                        coordinate,
                        elevation_m: terrain.elevation_at(coordinate).unwrap_or(0.0),
                        degree: 0,
                    });
                    (nodes.len() - 1) as u32
                });
                *endpoint = id;
            }
        }
        for (edge_id, edge) in edges.iter_mut().enumerate() {
            edge.edge_id = edge_id as u32;
            nodes[edge.from_node as usize].degree += 1;
            nodes[edge.to_node as usize].degree += 1;
        }
        let distinct_clusters = endpoint_node
            .iter()
            .copied()
            .collect::<std::collections::HashSet<_>>()
            .len();
        stats.pruned_nodes = distinct_clusters.saturating_sub(nodes.len());

        let graph = Graph::new(nodes, edges);
        graph.validate()?;

        stats.nodes = graph.nodes.len();
        stats.edges = graph.edges.len();
        stats.connected_components = graph.connected_components();
        stats.total_length_m = graph.total_length_m();

        tracing::info!(
            "Graph built in {:.2?}: {} nodes, {} edges, {:.1} km, {} component(s) ({} split events, {} collapsed, {} rejected, {} pruned nodes)",
            start.elapsed(),
            stats.nodes,
            stats.edges,
            stats.total_length_m / 1000.0,
            stats.connected_components,
            stats.split_events,
            stats.collapsed,
            stats.rejected,
            stats.pruned_nodes
        );

        Ok((graph, stats))
    }

    fn weigh(
        &self,
        feature: &Feature,
        coords: Vec<Coord<f64>>,
        from: usize,
        to: usize,
        terrain: &TerrainCostGrid,
    ) -> std::result::Result<GraphEdge, (u64, String)> {
        let length_m = utils::geodesic_length(&coords);
        let profile = self.profile(&coords, terrain);
        let base_cost = self.base_cost(feature);
        let weight = length_m * base_cost * profile.average_multiplier;

        if !(weight.is_finite() && weight > 0.0) {
            let at = coords.first().copied().unwrap_or(Coord { x: 0.0, y: 0.0 });
            return Err((
                feature.id,
                format!(
                    "segment at ({:.6}, {:.6}) has weight {} (length {:.3} m, base cost {}, multiplier {})",
                    at.x, at.y, weight, length_m, base_cost, profile.average_multiplier
                ),
            ));
        }

        Ok(GraphEdge {
            edge_id: 0,
            from_node: from as u32,
            to_node: to as u32,
            geometry: LineString::new(coords),
            base_category: feature.category,
            length_m,
            weight,
            oneway: self.config.respect_oneway && feature.is_oneway(),
            elevation_gain_m: profile.gain_m,
            elevation_loss_m: profile.loss_m,
            walk_time_forward_s: profile.walk_forward_s,
            walk_time_reverse_s: profile.walk_reverse_s,
            source_feature_id: feature.id,
            name: feature.name().map(str::to_string),
            main_trail: feature.is_main_trail(),
            measures: profile.measures,
        })
    }

    /// Walk the polyline in steps of at most `sample_step_m`, sampling the terrain at each
    /// step's midpoint and the elevation at each step's ends.
    fn profile(&self, coords: &[Coord<f64>], terrain: &TerrainCostGrid) -> EdgeProfile {
        let step = self.config.sample_step_m;
        let elevation = |c: Coord<f64>| terrain.elevation_at(c).unwrap_or(0.0);

        let mut weighted_sum = 0.0;
        let mut total = 0.0;
        let mut gain = 0.0;
        let mut loss = 0.0;
        let mut forward_s = 0.0;
        let mut reverse_s = 0.0;
        let mut forward = Vec::with_capacity(coords.len());
        let mut previous_elevation = coords.first().map(|c| elevation(*c)).unwrap_or(0.0);
        forward.push((0.0, 0.0, 0.0));

        for pair in coords.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let segment_length = utils::haversine_distance(a, b);
            let steps = (segment_length / step).ceil().max(1.0) as usize;
            let sub_length = segment_length / steps as f64;
            for k in 0..steps {
                let mid = a + (b - a) * ((k as f64 + 0.5) / steps as f64);
                weighted_sum += terrain.cost_multiplier_at(mid) * sub_length;
                total += sub_length;

                let end = a + (b - a) * ((k + 1) as f64 / steps as f64);
                let end_elevation = elevation(end);
                let rise = end_elevation - previous_elevation;
                if rise > 0.0 {
                    gain += rise;
                } else {
                    loss -= rise;
                }
                if sub_length > 0.0 {
                    let gradient = rise / sub_length;
                    forward_s += sub_length / (tobler_speed_kmh(gradient) / 3.6);
                    reverse_s += sub_length / (tobler_speed_kmh(-gradient) / 3.6);
                }
                previous_elevation = end_elevation;
            }
            forward.push((total, gain, loss));
        }

        let (length, total_gain, total_loss) = forward.last().copied().unwrap_or_default();
        let measures = forward
            .into_iter()
            .map(|(distance, g, l)| CumulativeMeasure {
                distance_m: distance,
                gain_m: g,
                loss_m: l,
                reverse_distance_m: length - distance,
                // Walking backwards, climbs become descents
                reverse_gain_m: total_loss - l,
                reverse_loss_m: total_gain - g,
            })
            .collect();

        EdgeProfile {
            average_multiplier: if total > 0.0 {
                weighted_sum / total
            } else {
                1.0
            },
            gain_m: gain,
            loss_m: loss,
            walk_forward_s: forward_s,
            walk_reverse_s: reverse_s,
            measures,
        }
    }
}

fn planar_length(coords: &[Coord<f64>]) -> f64 {
    coords
        .windows(2)
        .map(|p| (p[1].x - p[0].x).hypot(p[1].y - p[0].y))
        .sum()
}

/// Merge piece endpoints closer than `tolerance` (meters).
///
/// Returns, for endpoint `2 * piece + end`, the index of its node cluster, and the projected
/// coordinate of every cluster (the position of its first endpoint).
fn snap_endpoints(pieces: &[Piece], tolerance: f64) -> (Vec<usize>, Vec<Coord<f64>>) {
    let points: Vec<Coord<f64>> = pieces
        .iter()
        .flat_map(|p| [p.coords[0], p.coords[p.coords.len() - 1]])
        .collect();

    // Coordinate buckets one tolerance wide; neighbours are in the surrounding 3x3 buckets
    let bucket_of = |c: &Coord<f64>| {
        (
            (c.x / tolerance).floor() as i64,
            (c.y / tolerance).floor() as i64,
        )
    };
    let mut buckets: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
    for (index, point) in points.iter().enumerate() {
        buckets.entry(bucket_of(point)).or_default().push(index);
    }

    let mut sets = DisjointSet::new(points.len());
    for (index, point) in points.iter().enumerate() {
        let (bx, by) = bucket_of(point);
        for dx in -1..=1 {
            for dy in -1..=1 {
                let Some(candidates) = buckets.get(&(bx + dx, by + dy)) else {
                    continue;
                };
                for &other in candidates {
                    if other > index {
                        let q = points[other];
                        if (q.x - point.x).hypot(q.y - point.y) <= tolerance {
                            sets.union(index, other);
                        }
                    }
                }
            }
        }
    }

    let clusters: Vec<usize> = (0..points.len()).map(|i| sets.find(i)).collect();
    // The root of each set is its smallest endpoint index
    (clusters, points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZoomRange;
    use crate::{AttributeValue, Attributes, Category};

    const DEG_PER_M: f64 = 1.0 / 111_195.08;

    fn trail(id: u64, coords: Vec<(f64, f64)>) -> Feature {
        Feature {
            id,
            category: Category::Trail,
            geometry: Geometry::LineString(LineString::from(coords)),
            attributes: Attributes::new(),
            zoom_range: ZoomRange::default(),
        }
    }

    fn builder() -> GraphBuilder {
        GraphBuilder::new(&Config::default())
    }

    #[test]
    fn test_straight_trail_weight() {
        // 1000 m along the equator, flat terrain, trail cost 1.2
        let feature = trail(1, vec![(0.0, 0.0), (1000.0 * DEG_PER_M, 0.0)]);
        let (graph, stats) = builder()
            .build([&feature], &TerrainCostGrid::flat())
            .unwrap();
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.nodes.len(), 2);
        let edge = &graph.edges[0];
        assert!((edge.length_m - 1000.0).abs() < 0.01, "length {}", edge.length_m);
        assert!((edge.weight - 1200.0).abs() < 0.1, "weight {}", edge.weight);
        assert_eq!(stats.connected_components, 1);
        assert_eq!(edge.elevation_gain_m, 0.0);
        // Flat walking at ~5 km/h
        assert!((edge.walk_time_forward_s - 1000.0 / (5.0367 / 3.6)).abs() < 1.0);
        assert_eq!(edge.measures.len(), 2);
        assert!((edge.measures[1].distance_m - edge.length_m).abs() < 1e-6);
    }

    #[test]
    fn test_open_cross_has_degree_four_node() {
        let a = trail(1, vec![(-0.001, 0.0), (0.001, 0.0)]);
        let b = trail(2, vec![(0.0, -0.001), (0.0, 0.001)]);
        let (graph, _) = builder().build([&a, &b], &TerrainCostGrid::flat()).unwrap();
        assert_eq!(graph.edges.len(), 4);
        assert_eq!(graph.nodes.len(), 5);
        assert_eq!(graph.nodes.iter().filter(|n| n.degree == 4).count(), 1);
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_crossing_with_shared_ends() {
        // Both trails leave P, cross at C and meet again at Q
        let s = 0.001;
        let a = trail(
            1,
            vec![(0.0, 0.0), (s, s), (2.0 * s, 0.0), (3.0 * s, -s), (4.0 * s, 0.0)],
        );
        let b = trail(
            2,
            vec![(0.0, 0.0), (s, -s), (2.0 * s, 0.0), (3.0 * s, s), (4.0 * s, 0.0)],
        );
        let (graph, _) = builder().build([&a, &b], &TerrainCostGrid::flat()).unwrap();
        assert_eq!(graph.edges.len(), 4);
        assert_eq!(graph.nodes.len(), 3);
        assert!(graph.nodes.iter().all(|n| n.degree >= 1));
        let crossing = graph
            .nodes
            .iter()
            .find(|n| n.degree == 4)
            .expect("crossing node");
        assert!((crossing.coordinate.x - 2.0 * s).abs() < 1e-9);
        assert!(crossing.coordinate.y.abs() < 1e-9);
    }

    #[test]
    fn test_no_lines_is_degenerate() {
        let peak = Feature {
            id: 1,
            category: Category::Peak,
            geometry: Geometry::Point(Point::new(0.0, 0.0)),
            attributes: Attributes::new(),
            zoom_range: ZoomRange::default(),
        };
        assert!(matches!(
            builder().build([&peak], &TerrainCostGrid::flat()),
            Err(PackError::DegenerateGeometry(_))
        ));
    }

    #[test]
    fn test_near_miss_endpoints_snap() {
        // Second trail starts 0.3 m from the end of the first
        let a = trail(1, vec![(0.0, 0.0), (0.001, 0.0)]);
        let b = trail(2, vec![(0.001, 0.3 * DEG_PER_M), (0.002, 0.0)]);
        let (graph, _) = builder().build([&a, &b], &TerrainCostGrid::flat()).unwrap();
        assert_eq!(graph.edges.len(), 2);
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.edges[0].to_node, graph.edges[1].from_node);
    }

    #[test]
    fn test_base_cost_factors() {
        let mut config = Config::default();
        config.graph.highway_factors.insert("steps".to_string(), 2.0);
        config.graph.main_trail_factor = 0.5;
        let builder = GraphBuilder::new(&config);

        let mut feature = trail(1, vec![(0.0, 0.0), (0.001, 0.0)]);
        feature
            .attributes
            .insert("highway".to_string(), AttributeValue::Text("steps".to_string()));
        feature
            .attributes
            .insert("surface".to_string(), AttributeValue::Text("gravel".to_string()));
        feature
            .attributes
            .insert("main_trail".to_string(), AttributeValue::Bool(true));
        let expected = 1.2 * 2.0 * 1.1 * 0.5;
        assert!((builder.base_cost(&feature) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_bad_segment_is_rejected_and_build_continues() {
        let mut config = Config::default();
        config.graph.highway_factors.insert("steps".to_string(), 0.0);
        let builder = GraphBuilder::new(&config);

        let mut steps = trail(1, vec![(0.0, 0.0), (0.001, 0.0)]);
        steps
            .attributes
            .insert("highway".to_string(), AttributeValue::Text("steps".to_string()));
        let good = trail(2, vec![(0.0, 0.01), (0.001, 0.01)]);
        // Closed loop well under twice the snap tolerance
        let tiny_loop = trail(
            3,
            vec![
                (0.0, 0.02),
                (0.2 * DEG_PER_M, 0.02),
                (0.1 * DEG_PER_M, 0.02 + 0.1 * DEG_PER_M),
                (0.0, 0.02),
            ],
        );

        let (graph, stats) = builder
            .build([&steps, &good, &tiny_loop], &TerrainCostGrid::flat())
            .unwrap();
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].source_feature_id, 2);
        assert_eq!(graph.nodes.len(), 2);
        assert!(graph.validate().is_ok());

        assert_eq!(stats.rejected, 1);
        assert!(stats.collapsed >= 1);
        assert_eq!(stats.warnings.len(), 1);
        assert!(matches!(stats.warnings[0], PackError::FeatureClip { feature_id: 1, .. }));
    }

    #[test]
    fn test_deterministic_build() {
        let a = trail(7, vec![(0.0, 0.0), (0.002, 0.002)]);
        let b = trail(3, vec![(0.0, 0.002), (0.002, 0.0)]);
        let c = trail(5, vec![(0.001, -0.001), (0.001, 0.003)]);
        let (first, _) = builder().build([&a, &b, &c], &TerrainCostGrid::flat()).unwrap();
        let (second, _) = builder().build([&c, &a, &b], &TerrainCostGrid::flat()).unwrap();
        assert_eq!(first, second);
    }
}
