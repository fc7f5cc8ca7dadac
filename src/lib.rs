//! Walkshed computation over real pedestrian path networks.
//!
//! A walkshed is the polygon describing everywhere a pedestrian can reach
//! within a given walking distance from a transit stop. This crate fetches
//! footpath data from interchangeable Overpass endpoints, builds a weighted
//! street graph, runs a distance-bounded shortest-path search, and fits a
//! concave hull around the reachability frontier. Results are cached across
//! sessions and scheduled per map viewport with bounded concurrency.
//!
//! The entry points are [`service::WalkshedService`] for one-shot
//! `(stop, distance)` requests and [`overlay::OverlayScheduler`] for
//! viewport-driven batch computation.

pub mod algo;
pub mod cache;
pub mod error;
pub mod geomath;
pub mod loading;
pub mod model;
pub mod overlay;
pub mod prelude;
pub mod routing;
pub mod service;

pub use error::Error;

/// Stop identifier as issued by the host application.
pub type StopId = String;

// Tuning constants for seed snapping and polygon quality. These are
// empirically chosen and carry no meaning beyond "good enough boundary
// quality"; adjust freely.

/// Maximum distance between a stop and the graph node used as its entry point.
pub const SNAP_DISTANCE_METERS: f64 = 250.0;
/// Extra margin added to the network query bounding box so polygons are not
/// clipped at the fetch boundary.
pub const QUERY_PADDING_METERS: f64 = 80.0;
/// Cap on the number of snap candidates considered per stop.
pub const SEED_CANDIDATE_LIMIT: usize = 24;
/// Candidates within this distance of the nearest candidate form the
/// preferred seed subset.
pub const SEED_DISTANCE_WINDOW_METERS: f64 = 40.0;
/// Below this many boundary points a polygon attempt is considered
/// unreliable and retried with the full candidate set.
pub const MIN_RELIABLE_BOUNDARY_POINTS: usize = 8;
/// Seeds with less remaining walk budget than this are discarded.
pub const MIN_EFFECTIVE_WALK_METERS: f64 = 1.0;
/// Concavity parameter passed to the concave hull fit.
pub const CONCAVE_HULL_CONCAVITY: f64 = 2.2;
