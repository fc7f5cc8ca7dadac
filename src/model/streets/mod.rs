//! Pedestrian street network model.

pub mod components;
pub mod network;

pub use components::{StreetEdge, StreetNode};
pub use network::{SeedMatch, WalkGraph, preferred_seed_subset};
