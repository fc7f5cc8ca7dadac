pub use crate::StopId;
pub use crate::{SNAP_DISTANCE_METERS, SEED_CANDIDATE_LIMIT};

// Re-export key components
pub use crate::algo::{PolygonAttempt, build_polygon_from_seeds};
pub use crate::cache::{CacheEntry, CacheStore, cache_key};
pub use crate::loading::{FetchOutcome, FootwayFetcher, build_walk_graph};
pub use crate::model::{SeedMatch, Stop, WalkGraph};
pub use crate::overlay::{
    CoverageMode, OverlayScheduler, OverlaySettings, OverlaySink, Viewport,
};
pub use crate::routing::bounded_shortest_distances;
pub use crate::service::{WalkshedProvider, WalkshedService};

pub use crate::Error;
