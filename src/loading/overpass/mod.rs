//! Footway data fetcher with endpoint failover.
//!
//! Issues the pedestrian-network query against a rotating list of
//! interchangeable Overpass endpoints, ordered by observed latency and
//! failure history. The fetch never errors toward the caller: the outcome is
//! either a validated response or [`FetchOutcome::AllEndpointsFailed`].

pub mod dto;
pub mod endpoints;

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use geo::Point;
use log::{debug, warn};

pub use dto::{RawNetworkResponse, RawNode, RawWay, parse_network_response};
pub use endpoints::{DEFAULT_ENDPOINTS, EndpointPool};

use crate::Error;
use crate::geomath::bounding_box;

/// Per-endpoint request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(18);

// Server-side query timeout embedded in the Overpass QL text.
const QUERY_TIMEOUT_SECS: u32 = 25;

// Path categories a pedestrian cannot or must not use.
const HIGHWAY_DENYLIST: &str = "motorway|motorway_link|trunk|trunk_link|construction|proposed|\
bus_guideway|raceway|bridleway|corridor|escape";

/// Result of one fetch attempt across the whole endpoint pool.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Fetched(RawNetworkResponse),
    AllEndpointsFailed,
}

/// Fetches pedestrian-traversable ways around a stop.
pub struct FootwayFetcher {
    client: reqwest::Client,
    pool: Mutex<EndpointPool>,
}

impl FootwayFetcher {
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn new(pool: EndpointPool) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| Error::Network(error.to_string()))?;

        Ok(Self {
            client,
            pool: Mutex::new(pool),
        })
    }

    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn with_default_endpoints() -> Result<Self, Error> {
        Self::new(EndpointPool::default_endpoints())
    }

    /// The endpoint that served the last usable response, for persistence
    /// across sessions.
    pub fn preferred_endpoint(&self) -> Option<String> {
        self.lock_pool().preferred_url().map(str::to_owned)
    }

    /// Fetch all walkable ways within `radius_meters` (plus query padding)
    /// of `center`, trying endpoints in score order.
    pub async fn fetch_footways(&self, center: Point<f64>, radius_meters: f64) -> FetchOutcome {
        let query = footway_query(center, radius_meters);
        let ranked = self.lock_pool().ranked_urls();

        for url in &ranked {
            match self.fetch_from(url, &query).await {
                Ok((response, latency_ms)) => {
                    debug!("endpoint {url} answered in {latency_ms:.0} ms");
                    self.lock_pool().record_success(url, latency_ms);
                    return FetchOutcome::Fetched(response);
                }
                Err(error) => {
                    debug!("endpoint {url} failed: {error}");
                    self.lock_pool().record_failure(url);
                }
            }
        }

        warn!(
            "all {} endpoints failed for ({:.4}, {:.4})",
            ranked.len(),
            center.y(),
            center.x()
        );
        FetchOutcome::AllEndpointsFailed
    }

    async fn fetch_from(&self, url: &str, query: &str) -> Result<(RawNetworkResponse, f64), Error> {
        let started = Instant::now();
        let response = self
            .client
            .post(url)
            .form(&[("data", query)])
            .send()
            .await
            .map_err(|error| Error::Network(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Network(format!("status {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|error| Error::Network(error.to_string()))?;
        let parsed = parse_network_response(&body)?;

        Ok((parsed, started.elapsed().as_secs_f64() * 1_000.0))
    }

    fn lock_pool(&self) -> std::sync::MutexGuard<'_, EndpointPool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn footway_query(center: Point<f64>, radius_meters: f64) -> String {
    let bbox = bounding_box(center, radius_meters);

    format!(
        "[out:json][timeout:{QUERY_TIMEOUT_SECS}];\n\
         (\n\
         \x20 way[\"highway\"]\n\
         \x20   [\"highway\"!~\"{HIGHWAY_DENYLIST}\"]\n\
         \x20   [\"area\"!=\"yes\"]\n\
         \x20   [\"indoor\"!=\"yes\"]\n\
         \x20   [\"access\"!~\"private|no\"]\n\
         \x20   [\"foot\"!~\"no\"]\n\
         \x20   ({south},{west},{north},{east});\n\
         );\n\
         (._;>;);\n\
         out body;",
        south = bbox.south,
        west = bbox.west,
        north = bbox.north,
        east = bbox.east,
    )
}
