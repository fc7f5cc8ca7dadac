//! Walkshed computation service.
//!
//! Ties the pipeline together: cache lookup, street-graph loading with
//! in-flight deduplication, seed snapping with a reliability-driven retry,
//! and polygon construction. Every outcome is cached, including failures,
//! so a flaky endpoint or a stop in the middle of a lake does not trigger
//! a network round trip on every repaint.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use geo::Point;
use hashbrown::HashMap;
use log::{debug, info};

use crate::algo::build_polygon_from_seeds;
use crate::cache::{CacheEntry, CacheStore, cache_key};
use crate::loading::overpass::EndpointPool;
use crate::loading::{FetchOutcome, FootwayFetcher, build_walk_graph};
use crate::model::streets::preferred_seed_subset;
use crate::model::{Stop, WalkGraph};
use crate::{Error, MIN_RELIABLE_BOUNDARY_POINTS, SEED_CANDIDATE_LIMIT};

/// Retry delay after a transient failure (every endpoint down or timing
/// out).
pub const TRANSIENT_RETRY_MS: i64 = 5 * 60 * 1_000;
/// Retry delay after a structural failure (no usable street data at this
/// location).
pub const STRUCTURAL_RETRY_MS: i64 = 24 * 60 * 60 * 1_000;

/// Why a street graph could not be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphUnavailable {
    /// Network-level failure, worth retrying soon.
    Transient,
    /// The area genuinely has no walkable network.
    NoUsableData,
}

/// Street graphs are shared between stops whose query areas coincide.
/// Four decimals of coordinate (about 11 m) is well inside the query
/// padding, so stops that close see the same network anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GraphKey {
    lat_e4: i64,
    lon_e4: i64,
    distance_m: i64,
}

impl GraphKey {
    fn new(center: Point<f64>, distance_meters: f64) -> Self {
        Self {
            lat_e4: (center.y() * 1e4).round() as i64,
            lon_e4: (center.x() * 1e4).round() as i64,
            distance_m: distance_meters.round() as i64,
        }
    }
}

type SharedLoad = Shared<BoxFuture<'static, Result<Arc<WalkGraph>, GraphUnavailable>>>;

/// Anything that can answer "what is walkable from this stop".
#[async_trait]
pub trait WalkshedProvider: Send + Sync {
    /// The reachable-area polygon for `stop` at the given walking
    /// distance, or `None` when it cannot be computed right now.
    async fn walkshed_polygon(&self, stop: &Stop, distance_meters: f64)
    -> Option<Vec<Point<f64>>>;
}

pub struct WalkshedService {
    fetcher: Arc<FootwayFetcher>,
    cache: Arc<CacheStore>,
    graph_loads: Mutex<HashMap<GraphKey, SharedLoad>>,
}

impl WalkshedService {
    pub fn new(fetcher: Arc<FootwayFetcher>, cache: Arc<CacheStore>) -> Self {
        Self {
            fetcher,
            cache,
            graph_loads: Mutex::new(HashMap::new()),
        }
    }

    /// Service over the default endpoint pool, seeded with the preferred
    /// endpoint persisted in `cache` from an earlier session.
    ///
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be constructed.
    pub async fn with_default_endpoints(cache: Arc<CacheStore>) -> Result<Self, Error> {
        let preferred = cache.preferred_endpoint().await;
        let pool = EndpointPool::with_preferred(
            crate::loading::overpass::DEFAULT_ENDPOINTS
                .iter()
                .map(|url| (*url).to_owned()),
            preferred,
        );
        Ok(Self::new(Arc::new(FootwayFetcher::new(pool)?), cache))
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub async fn invalidate_stop(&self, stop_id: &str) {
        self.cache.invalidate_stop(stop_id).await;
    }

    /// Compute (or recall) the walkshed polygon for one stop.
    pub async fn get_or_compute(
        &self,
        stop: &Stop,
        distance_meters: f64,
    ) -> Option<Vec<Point<f64>>> {
        self.cache.refresh_if_reset().await;

        let key = cache_key(&stop.id, distance_meters);
        match self.cache.get(&key).await {
            Some(CacheEntry::Polygon { points, .. }) => return Some(points),
            Some(CacheEntry::Unavailable { .. }) => return None,
            None => {}
        }

        let center = stop.location();
        let graph = match self.load_graph(center, distance_meters).await {
            Ok(graph) => graph,
            Err(reason) => {
                let retry_ms = match reason {
                    GraphUnavailable::Transient => TRANSIENT_RETRY_MS,
                    GraphUnavailable::NoUsableData => STRUCTURAL_RETRY_MS,
                };
                self.cache
                    .insert_unavailable(key, crate::cache::now_ms() + retry_ms)
                    .await;
                return None;
            }
        };

        // The graph came from somewhere; remember the endpoint that
        // served it for the next session.
        self.cache
            .set_preferred_endpoint(self.fetcher.preferred_endpoint())
            .await;

        match attempt_polygon(&graph, center, distance_meters) {
            Some(points) => {
                self.cache.insert_polygon(key, points.clone()).await;
                Some(points)
            }
            None => {
                debug!("no polygon for stop {} at {distance_meters} m", stop.id);
                self.cache
                    .insert_unavailable(key, crate::cache::now_ms() + STRUCTURAL_RETRY_MS)
                    .await;
                None
            }
        }
    }

    /// Load the street graph for one query area, deduplicating concurrent
    /// requests onto a single fetch.
    async fn load_graph(
        &self,
        center: Point<f64>,
        distance_meters: f64,
    ) -> Result<Arc<WalkGraph>, GraphUnavailable> {
        let key = GraphKey::new(center, distance_meters);

        let load = {
            let mut loads = self.lock_loads();
            if let Some(existing) = loads.get(&key) {
                debug!("joining in-flight graph load for {key:?}");
                existing.clone()
            } else {
                let fetcher = Arc::clone(&self.fetcher);
                let load: SharedLoad = async move {
                    match fetcher.fetch_footways(center, distance_meters).await {
                        FetchOutcome::Fetched(response) => {
                            match build_walk_graph(&response, center) {
                                Some(graph) => {
                                    info!(
                                        "street graph ready: {} nodes, {} edges",
                                        graph.node_count(),
                                        graph.edge_count()
                                    );
                                    Ok(Arc::new(graph))
                                }
                                None => Err(GraphUnavailable::NoUsableData),
                            }
                        }
                        FetchOutcome::AllEndpointsFailed => Err(GraphUnavailable::Transient),
                    }
                }
                .boxed()
                .shared();
                loads.insert(key, load.clone());
                load
            }
        };

        let result = load.clone().await;

        // Shared only for the duration of one fetch; a later request for
        // the same area goes through the cache or refetches. Guard against
        // removing a newer load that replaced this one.
        let mut loads = self.lock_loads();
        if loads.get(&key).is_some_and(|current| current.ptr_eq(&load)) {
            loads.remove(&key);
        }

        result
    }

    fn lock_loads(&self) -> std::sync::MutexGuard<'_, HashMap<GraphKey, SharedLoad>> {
        self.graph_loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl WalkshedProvider for WalkshedService {
    async fn walkshed_polygon(
        &self,
        stop: &Stop,
        distance_meters: f64,
    ) -> Option<Vec<Point<f64>>> {
        self.get_or_compute(stop, distance_meters).await
    }
}

/// Snap the stop to the network and build the polygon, retrying with the
/// full candidate set when the tight seed subset yields an unreliable
/// boundary.
fn attempt_polygon(
    graph: &WalkGraph,
    center: Point<f64>,
    distance_meters: f64,
) -> Option<Vec<Point<f64>>> {
    let candidates = graph.nearest_candidates(center, SEED_CANDIDATE_LIMIT);
    if candidates.is_empty() {
        debug!("no network nodes within snap distance of the stop");
        return None;
    }

    let preferred = preferred_seed_subset(&candidates);
    let first = build_polygon_from_seeds(graph, center, distance_meters, &preferred);
    if first.boundary_point_count >= MIN_RELIABLE_BOUNDARY_POINTS
        || preferred.len() == candidates.len()
    {
        return first.polygon;
    }

    // The tight subset reached too little of the network; the full set
    // only wins if it actually improves the boundary.
    let expanded = build_polygon_from_seeds(graph, center, distance_meters, &candidates);
    if expanded.polygon.is_some() && expanded.boundary_point_count > first.boundary_point_count {
        expanded.polygon
    } else {
        first.polygon
    }
}
