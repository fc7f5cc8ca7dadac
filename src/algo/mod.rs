pub mod polygon;

pub use polygon::{PolygonAttempt, build_polygon_from_seeds};
