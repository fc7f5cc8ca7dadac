//! Builds the weighted footpath graph from a validated network response.

use geo::Point;
use hashbrown::{HashMap, HashSet};
use itertools::Itertools;
use log::{debug, info};
use petgraph::graph::{NodeIndex, UnGraph};

use crate::geomath::{LocalProjection, haversine_meters};
use crate::loading::overpass::RawNetworkResponse;
use crate::model::streets::{StreetEdge, StreetNode, WalkGraph};

/// Converts raw elements into a weighted undirected graph over footpath
/// nodes. Only nodes referenced by at least one way become graph nodes;
/// consecutive way-node pairs become edges unless degenerate or duplicated.
///
/// Returns `None` when the response holds no usable network (no ways, or
/// fewer than two resolvable nodes). Callers treat this as the absence of
/// path data, not an error.
pub fn build_walk_graph(response: &RawNetworkResponse, center: Point<f64>) -> Option<WalkGraph> {
    if response.ways.is_empty() {
        debug!("network response has no ways");
        return None;
    }

    let point_by_id: HashMap<i64, Point<f64>> = response
        .nodes
        .iter()
        .map(|node| (node.id, Point::new(node.lon, node.lat)))
        .collect();

    let mut graph = UnGraph::new_undirected();
    let mut index_by_id: HashMap<i64, NodeIndex> = HashMap::new();

    // Intern nodes in first-reference order so repeated builds from the
    // same response produce identical node indices.
    for way in &response.ways {
        for &node_id in &way.nodes {
            if index_by_id.contains_key(&node_id) {
                continue;
            }
            if let Some(&point) = point_by_id.get(&node_id) {
                let index = graph.add_node(StreetNode {
                    id: node_id,
                    geometry: point,
                });
                index_by_id.insert(node_id, index);
            }
        }
    }

    if graph.node_count() < 2 {
        debug!("network response has fewer than two usable nodes");
        return None;
    }

    let mut seen_pairs: HashSet<(NodeIndex, NodeIndex)> = HashSet::new();
    for way in &response.ways {
        for (&from_id, &to_id) in way.nodes.iter().tuple_windows() {
            let (Some(&from), Some(&to)) = (index_by_id.get(&from_id), index_by_id.get(&to_id))
            else {
                continue;
            };
            if from == to {
                continue;
            }

            let pair = (from.min(to), from.max(to));
            if !seen_pairs.insert(pair) {
                continue;
            }

            let length = haversine_meters(graph[from].geometry, graph[to].geometry);
            if !length.is_finite() || length <= 0.0 {
                // Coincident points carry no walkable length.
                continue;
            }

            graph.add_edge(from, to, StreetEdge { length });
        }
    }

    info!(
        "built walk graph with {} nodes and {} edges",
        graph.node_count(),
        graph.edge_count()
    );
    Some(WalkGraph::new(graph, LocalProjection::new(center)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loading::overpass::{RawNode, RawWay};

    fn node(id: i64, lat: f64, lon: f64) -> RawNode {
        RawNode { id, lat, lon }
    }

    fn way(id: i64, nodes: &[i64]) -> RawWay {
        RawWay {
            id,
            nodes: nodes.to_vec(),
        }
    }

    fn center() -> Point<f64> {
        Point::new(8.4037, 49.0069)
    }

    #[test]
    fn builds_graph_from_two_connected_ways() {
        let response = RawNetworkResponse {
            nodes: vec![
                node(1, 49.0069, 8.4037),
                node(2, 49.0079, 8.4037),
                node(3, 49.0079, 8.4047),
            ],
            ways: vec![way(10, &[1, 2]), way(11, &[2, 3])],
        };

        let graph = build_walk_graph(&response, center()).expect("usable graph");
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn duplicate_segments_become_one_edge() {
        let response = RawNetworkResponse {
            nodes: vec![node(1, 49.0069, 8.4037), node(2, 49.0079, 8.4037)],
            ways: vec![way(10, &[1, 2]), way(11, &[2, 1])],
        };

        let graph = build_walk_graph(&response, center()).expect("usable graph");
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn self_loops_and_unresolved_nodes_are_skipped() {
        let response = RawNetworkResponse {
            nodes: vec![node(1, 49.0069, 8.4037), node(2, 49.0079, 8.4037)],
            // 99 has no node element; 1->1 is a self-loop.
            ways: vec![way(10, &[1, 1, 99, 2, 1])],
        };

        let graph = build_walk_graph(&response, center()).expect("usable graph");
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn coincident_points_produce_no_edge() {
        let response = RawNetworkResponse {
            nodes: vec![node(1, 49.0069, 8.4037), node(2, 49.0069, 8.4037)],
            ways: vec![way(10, &[1, 2])],
        };

        let graph = build_walk_graph(&response, center()).expect("usable graph");
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn isolated_nodes_are_discarded() {
        let response = RawNetworkResponse {
            nodes: vec![
                node(1, 49.0069, 8.4037),
                node(2, 49.0079, 8.4037),
                node(3, 49.1000, 8.5000),
            ],
            ways: vec![way(10, &[1, 2])],
        };

        let graph = build_walk_graph(&response, center()).expect("usable graph");
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn no_ways_means_no_graph() {
        let response = RawNetworkResponse {
            nodes: vec![node(1, 49.0069, 8.4037)],
            ways: vec![],
        };
        assert!(build_walk_graph(&response, center()).is_none());
    }

    #[test]
    fn single_resolvable_node_means_no_graph() {
        let response = RawNetworkResponse {
            nodes: vec![node(1, 49.0069, 8.4037)],
            ways: vec![way(10, &[1, 99])],
        };
        assert!(build_walk_graph(&response, center()).is_none());
    }
}
