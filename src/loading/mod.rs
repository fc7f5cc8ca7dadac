//! Street network acquisition: Overpass fetch and graph construction.

pub mod builder;
pub mod overpass;

pub use builder::build_walk_graph;
pub use overpass::{FetchOutcome, FootwayFetcher, RawNetworkResponse};
