//! Routing graph: nodes, edges, invariants and the serialized artifact

mod builder;
mod noding;
mod union_find;

pub use builder::{BuildStats, GraphBuilder};

use crate::{Category, PackError, Result, geojson};
use union_find::DisjointSet;

use geo::{Coord, Geometry, LineString};
use serde::{Deserialize, Serialize};

/// Magic prefix of the graph artifact, followed by the bincode body
pub const GRAPH_MAGIC: &[u8; 8] = b"TPGRAPH1";

/// Graph vertex at an intersection or a dead end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub node_id: u32,
    /// WGS84 (x = longitude, y = latitude)
    pub coordinate: Coord<f64>,
    pub elevation_m: f64,
    pub degree: u32,
}

/// Running totals at one vertex of an edge, from the start and from the end
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CumulativeMeasure {
    pub distance_m: f64,
    pub gain_m: f64,
    pub loss_m: f64,
    pub reverse_distance_m: f64,
    pub reverse_gain_m: f64,
    pub reverse_loss_m: f64,
}

/// Undirected edge (directed when `oneway`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub edge_id: u32,
    pub from_node: u32,
    pub to_node: u32,
    pub geometry: LineString<f64>,
    pub base_category: Category,
    pub length_m: f64,
    pub weight: f64,
    pub oneway: bool,
    pub elevation_gain_m: f64,
    pub elevation_loss_m: f64,
    pub walk_time_forward_s: f64,
    pub walk_time_reverse_s: f64,
    pub source_feature_id: u64,
    pub name: Option<String>,
    pub main_trail: bool,
    /// One entry per geometry vertex
    pub measures: Vec<CumulativeMeasure>,
}

/// Terrain-weighted routing graph
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl Graph {
    pub fn new(nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Self {
        Self { nodes, edges }
    }

    pub fn total_length_m(&self) -> f64 {
        self.edges.iter().map(|e| e.length_m).sum()
    }

    /// Check every structural invariant: dense ids, endpoints that exist, stored degrees that
    /// match the edges, no isolated node, and strictly positive finite weights.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(PackError::DegenerateGeometry(msg));

        if self.edges.is_empty() {
            return invalid("graph has no edges".to_string());
        }

        let mut degrees = vec![0u32; self.nodes.len()];
        for (index, edge) in self.edges.iter().enumerate() {
            if edge.edge_id as usize != index {
                return invalid(format!("edge at index {index} has id {}", edge.edge_id));
            }
            for endpoint in [edge.from_node, edge.to_node] {
                match degrees.get_mut(endpoint as usize) {
                    Some(degree) => *degree += 1,
                    None => {
                        return invalid(format!(
                            "edge {} references missing node {endpoint}",
                            edge.edge_id
                        ));
                    }
                }
            }
            if !(edge.weight.is_finite() && edge.weight > 0.0) {
                return invalid(format!("edge {} has weight {}", edge.edge_id, edge.weight));
            }
            if !(edge.length_m.is_finite() && edge.length_m >= 0.0) {
                return invalid(format!("edge {} has length {}", edge.edge_id, edge.length_m));
            }
            if edge.geometry.0.len() < 2 {
                return invalid(format!("edge {} has fewer than 2 points", edge.edge_id));
            }
        }

        for (index, node) in self.nodes.iter().enumerate() {
            if node.node_id as usize != index {
                return invalid(format!("node at index {index} has id {}", node.node_id));
            }
            if degrees[index] == 0 {
                return invalid(format!("node {index} has no edge"));
            }
            if degrees[index] != node.degree {
                return invalid(format!(
                    "node {index} stores degree {} but has {} edge ends",
                    node.degree, degrees[index]
                ));
            }
        }
        Ok(())
    }

    /// Number of connected components, ignoring edge direction
    pub fn connected_components(&self) -> usize {
        let mut sets = DisjointSet::new(self.nodes.len());
        for edge in &self.edges {
            sets.union(edge.from_node as usize, edge.to_node as usize);
        }
        sets.count()
    }

    /// Outgoing `(edge_id, neighbour)` pairs per node, honouring one-way edges
    pub fn adjacency(&self) -> Vec<Vec<(u32, u32)>> {
        let mut adjacency = vec![Vec::new(); self.nodes.len()];
        for edge in &self.edges {
            adjacency[edge.from_node as usize].push((edge.edge_id, edge.to_node));
            if !edge.oneway {
                adjacency[edge.to_node as usize].push((edge.edge_id, edge.from_node));
            }
        }
        adjacency
    }

    /// Serialize as `TPGRAPH1` followed by the bincode body
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = bincode::serde::encode_to_vec(self, bincode::config::standard())?;
        let mut bytes = Vec::with_capacity(GRAPH_MAGIC.len() + body.len());
        bytes.extend_from_slice(GRAPH_MAGIC);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let body = bytes.strip_prefix(GRAPH_MAGIC.as_slice()).ok_or_else(|| {
            PackError::Serialization("graph artifact has no TPGRAPH1 header".to_string())
        })?;
        let (graph, read): (Graph, usize) =
            bincode::serde::decode_from_slice(body, bincode::config::standard())?;
        if read != body.len() {
            return Err(PackError::Serialization(format!(
                "graph artifact has {} trailing bytes",
                body.len() - read
            )));
        }
        Ok(graph)
    }

    /// Edges and nodes as a GeoJSON FeatureCollection, for inspection in GIS tools
    pub fn to_geojson(&self) -> serde_json::Value {
        let edges = self.edges.iter().map(|edge| {
            geojson::feature(
                Some(edge.edge_id as u64),
                &Geometry::LineString(edge.geometry.clone()),
                serde_json::json!({
                    "kind": "edge",
                    "from_node": edge.from_node,
                    "to_node": edge.to_node,
                    "category": edge.base_category.as_str(),
                    "length_m": edge.length_m,
                    "weight": edge.weight,
                    "oneway": edge.oneway,
                    "elevation_gain_m": edge.elevation_gain_m,
                    "elevation_loss_m": edge.elevation_loss_m,
                    "walk_time_forward_s": edge.walk_time_forward_s,
                    "walk_time_reverse_s": edge.walk_time_reverse_s,
                    "source_feature_id": edge.source_feature_id,
                    "name": edge.name,
                    "main_trail": edge.main_trail,
                }),
            )
        });
        let nodes = self.nodes.iter().map(|node| {
            geojson::feature(
                Some(node.node_id as u64),
                &Geometry::Point(node.coordinate.into()),
                serde_json::json!({
                    "kind": "node",
                    "degree": node.degree,
                    "elevation_m": node.elevation_m,
                }),
            )
        });
        geojson::feature_collection(edges.chain(nodes).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(edge_id: u32, from_node: u32, to_node: u32, weight: f64) -> GraphEdge {
        GraphEdge {
            edge_id,
            from_node,
            to_node,
            geometry: LineString::from(vec![(0.0, 0.0), (0.001, 0.0)]),
            base_category: Category::Trail,
            length_m: 111.2,
            weight,
            oneway: false,
            elevation_gain_m: 1.5,
            elevation_loss_m: 0.25,
            walk_time_forward_s: 80.0,
            walk_time_reverse_s: 79.0,
            source_feature_id: 42,
            name: Some("Long Trail".to_string()),
            main_trail: true,
            measures: vec![CumulativeMeasure::default(); 2],
        }
    }

    fn node(node_id: u32, degree: u32) -> GraphNode {
        GraphNode {
            node_id,
            coordinate: Coord {
                x: node_id as f64 * 0.001,
                y: 0.0,
            },
            elevation_m: 120.0,
            degree,
        }
    }

    fn path_graph() -> Graph {
        Graph::new(
            vec![node(0, 1), node(1, 2), node(2, 1)],
            vec![edge(0, 0, 1, 133.44), edge(1, 1, 2, 140.0)],
        )
    }

    #[test]
    fn test_validate_accepts_consistent_graph() {
        assert!(path_graph().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_broken_invariants() {
        let mut graph = path_graph();
        graph.edges[1].weight = 0.0;
        assert!(graph.validate().is_err());

        let mut graph = path_graph();
        graph.edges[1].to_node = 9;
        assert!(graph.validate().is_err());

        let mut graph = path_graph();
        graph.nodes.push(node(3, 0));
        assert!(graph.validate().is_err());

        let mut graph = path_graph();
        graph.nodes[1].degree = 3;
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_connected_components() {
        let mut graph = path_graph();
        assert_eq!(graph.connected_components(), 1);
        graph.nodes.push(node(3, 1));
        graph.nodes.push(node(4, 1));
        graph.edges.push(edge(2, 3, 4, 10.0));
        assert_eq!(graph.connected_components(), 2);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let graph = path_graph();
        let bytes = graph.to_bytes().unwrap();
        assert!(bytes.starts_with(GRAPH_MAGIC));
        let decoded = Graph::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, graph);
        assert!((decoded.edges[0].weight - 133.44).abs() < 1e-6);
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(matches!(
            Graph::from_bytes(b"NOTAGRAPH"),
            Err(PackError::Serialization(_))
        ));
        let mut bytes = path_graph().to_bytes().unwrap();
        bytes.truncate(bytes.len() / 2);
        assert!(Graph::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_adjacency_honours_oneway() {
        let mut graph = path_graph();
        graph.edges[0].oneway = true;
        let adjacency = graph.adjacency();
        assert_eq!(adjacency[0], vec![(0, 1)]);
        assert_eq!(adjacency[1], vec![(1, 2)]);
        assert_eq!(adjacency[2], vec![(1, 1)]);
    }

    #[test]
    fn test_geojson_has_edges_and_nodes() {
        let value = path_graph().to_geojson();
        let features = value["features"].as_array().unwrap();
        assert_eq!(features.len(), 5);
        assert_eq!(features[0]["properties"]["kind"], "edge");
        assert_eq!(features[4]["properties"]["kind"], "node");
    }
}
