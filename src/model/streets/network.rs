//! Weighted undirected footpath graph with a spatial index for seed snapping.

use geo::Point;
use petgraph::graph::{NodeIndex, UnGraph};
use rstar::{RTree, primitives::GeomWithData};

use super::components::{StreetEdge, StreetNode};
use crate::geomath::{LocalProjection, haversine_meters};
use crate::{SEED_DISTANCE_WINDOW_METERS, SNAP_DISTANCE_METERS};

type IndexedPoint = GeomWithData<[f64; 2], NodeIndex>;

/// A candidate graph entry point near a stop.
///
/// `distance_meters` is the geodesic distance from the stop to the node; it
/// becomes the initial cost of that node when seeding the shortest-path
/// search. Valid only within the snap distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeedMatch {
    pub node: NodeIndex,
    pub distance_meters: f64,
}

/// Weighted undirected graph over footpath nodes, valid for the lifetime of
/// one fetched network response. Node indices are not stable across rebuilds.
pub struct WalkGraph {
    pub(crate) graph: UnGraph<StreetNode, StreetEdge>,
    rtree: RTree<IndexedPoint>,
    projection: LocalProjection,
}

impl WalkGraph {
    pub(crate) fn new(graph: UnGraph<StreetNode, StreetEdge>, projection: LocalProjection) -> Self {
        let indexed = graph
            .node_indices()
            .map(|node| {
                let local = projection.to_local(graph[node].geometry);
                IndexedPoint::new(local, node)
            })
            .collect();

        Self {
            graph,
            rtree: RTree::bulk_load(indexed),
            projection,
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn node_point(&self, node: NodeIndex) -> Point<f64> {
        self.graph[node].geometry
    }

    /// All graph nodes within snap distance of `point`, sorted nearest first
    /// and capped to `limit`.
    pub fn nearest_candidates(&self, point: Point<f64>, limit: usize) -> Vec<SeedMatch> {
        let local = self.projection.to_local(point);
        // The planar lookup over-approximates by a meter, the geodesic
        // filter below is authoritative.
        let lookup_radius = SNAP_DISTANCE_METERS + 1.0;

        let mut matches: Vec<SeedMatch> = self
            .rtree
            .locate_within_distance(local, lookup_radius * lookup_radius)
            .filter_map(|indexed| {
                let node = indexed.data;
                let distance = haversine_meters(point, self.graph[node].geometry);
                (distance <= SNAP_DISTANCE_METERS).then_some(SeedMatch {
                    node,
                    distance_meters: distance,
                })
            })
            .collect();

        matches.sort_by(|a, b| a.distance_meters.total_cmp(&b.distance_meters));
        matches.truncate(limit);
        matches
    }
}

/// Tight seed subset: all candidates within a fixed distance window of the
/// single nearest one. Protects against snapping across a disconnected
/// component that is geometrically close but topologically far.
pub fn preferred_seed_subset(candidates: &[SeedMatch]) -> Vec<SeedMatch> {
    let Some(nearest) = candidates.first() else {
        return Vec::new();
    };

    let cutoff = nearest.distance_meters + SEED_DISTANCE_WINDOW_METERS;
    candidates
        .iter()
        .copied()
        .filter(|candidate| candidate.distance_meters <= cutoff)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geomath::LAT_METERS_PER_DEGREE;

    fn graph_with_nodes(points: &[(f64, f64)]) -> WalkGraph {
        let mut graph = UnGraph::new_undirected();
        for (i, &(lat, lon)) in points.iter().enumerate() {
            graph.add_node(StreetNode {
                id: i as i64,
                geometry: Point::new(lon, lat),
            });
        }
        WalkGraph::new(graph, LocalProjection::new(Point::new(8.4037, 49.0069)))
    }

    #[test]
    fn candidates_are_sorted_and_within_snap_distance() {
        let near = 49.0069 + 30.0 / LAT_METERS_PER_DEGREE;
        let nearer = 49.0069 + 10.0 / LAT_METERS_PER_DEGREE;
        let far = 49.0069 + 5_000.0 / LAT_METERS_PER_DEGREE;
        let graph = graph_with_nodes(&[(near, 8.4037), (nearer, 8.4037), (far, 8.4037)]);

        let matches = graph.nearest_candidates(Point::new(8.4037, 49.0069), 24);
        assert_eq!(matches.len(), 2);
        assert!(matches[0].distance_meters < matches[1].distance_meters);
        assert!(matches[1].distance_meters <= SNAP_DISTANCE_METERS);
    }

    #[test]
    fn candidate_limit_is_applied() {
        let nodes: Vec<(f64, f64)> = (0..10)
            .map(|i| (49.0069 + f64::from(i) / LAT_METERS_PER_DEGREE, 8.4037))
            .collect();
        let graph = graph_with_nodes(&nodes);

        let matches = graph.nearest_candidates(Point::new(8.4037, 49.0069), 3);
        assert_eq!(matches.len(), 3);
    }

    #[test]
    fn no_candidates_outside_snap_distance() {
        let far = 49.0069 + 1_000.0 / LAT_METERS_PER_DEGREE;
        let graph = graph_with_nodes(&[(far, 8.4037)]);

        assert!(
            graph
                .nearest_candidates(Point::new(8.4037, 49.0069), 24)
                .is_empty()
        );
    }

    #[test]
    fn preferred_subset_keeps_candidates_near_the_nearest() {
        let seed = |i: u32, d: f64| SeedMatch {
            node: NodeIndex::new(i as usize),
            distance_meters: d,
        };
        let candidates = vec![seed(0, 12.0), seed(1, 40.0), seed(2, 60.0)];

        let preferred = preferred_seed_subset(&candidates);
        assert_eq!(preferred.len(), 2);
        assert_eq!(preferred[1].node, NodeIndex::new(1));
    }

    #[test]
    fn preferred_subset_of_empty_is_empty() {
        assert!(preferred_seed_subset(&[]).is_empty());
    }
}
