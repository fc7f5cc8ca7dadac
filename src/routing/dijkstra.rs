//! Multi-source, distance-bounded Dijkstra over the walk graph.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::model::streets::{SeedMatch, WalkGraph};

#[derive(Copy, Clone, PartialEq)]
struct State {
    cost: f64,
    node: NodeIndex,
}

impl Eq for State {}

impl Ord for State {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap by cost (reversed from standard Rust BinaryHeap)
        other.cost.total_cmp(&self.cost)
    }
}

impl PartialOrd for State {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Shortest walking distance from the nearest seed to every graph node,
/// bounded by `max_distance` meters.
///
/// Each seed carries the stop-to-node distance already consumed before graph
/// traversal begins; seeds whose initial distance exceeds the budget are
/// discarded. Returns one entry per graph node, `f64::INFINITY` for nodes
/// unreachable within the budget. The search stops as soon as the minimum
/// popped distance exceeds the budget.
pub fn bounded_shortest_distances(
    graph: &WalkGraph,
    seeds: &[SeedMatch],
    max_distance: f64,
) -> Vec<f64> {
    let mut distances = vec![f64::INFINITY; graph.node_count()];
    let mut heap = BinaryHeap::with_capacity(seeds.len().max(16));

    for seed in seeds {
        if seed.distance_meters > max_distance {
            continue;
        }
        if seed.distance_meters < distances[seed.node.index()] {
            distances[seed.node.index()] = seed.distance_meters;
            heap.push(State {
                cost: seed.distance_meters,
                node: seed.node,
            });
        }
    }

    while let Some(State { cost, node }) = heap.pop() {
        if cost > max_distance {
            break;
        }
        // Skip if we've found a better path
        if cost > distances[node.index()] {
            continue;
        }

        for edge in graph.graph.edges(node) {
            let next = edge.target();
            let next_cost = cost + edge.weight().length;
            if next_cost > max_distance || next_cost >= distances[next.index()] {
                continue;
            }

            distances[next.index()] = next_cost;
            heap.push(State {
                cost: next_cost,
                node: next,
            });
        }
    }

    distances
}
