pub mod dijkstra;

pub use dijkstra::bounded_shortest_distances;
