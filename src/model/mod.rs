//! Data model for walkshed computation.

pub mod stop;
pub mod streets;

pub use stop::Stop;
pub use streets::{SeedMatch, StreetEdge, StreetNode, WalkGraph};
