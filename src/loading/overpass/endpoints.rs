//! Adaptive ordering over interchangeable Overpass endpoints.
//!
//! Ordering is a best-effort bias, not a correctness concern: scores mix a
//! smoothed latency with a consecutive-failure penalty, and the last endpoint
//! that succeeded gets a small head start. Losing this state is harmless.

/// Public Overpass interpreters known to serve the footway query.
pub const DEFAULT_ENDPOINTS: [&str; 5] = [
    "https://overpass-api.de/api/interpreter",
    "https://maps.mail.ru/osm/tools/overpass/api/interpreter",
    "https://overpass.kumi.systems/api/interpreter",
    "https://overpass.private.coffee/api/interpreter",
    "https://lz4.overpass-api.de/api/interpreter",
];

const EMA_ALPHA: f64 = 0.3;
const INITIAL_LATENCY_MS: f64 = 1_000.0;
const FAILURE_PENALTY_MS: f64 = 5_000.0;
const MAX_FAILURE_STREAK: u32 = 5;
const PREFERRED_BONUS_MS: f64 = 1_500.0;

#[derive(Debug, Clone)]
struct EndpointStats {
    url: String,
    ema_latency_ms: f64,
    failure_streak: u32,
}

impl EndpointStats {
    fn new(url: String) -> Self {
        Self {
            url,
            ema_latency_ms: INITIAL_LATENCY_MS,
            failure_streak: 0,
        }
    }

    fn score(&self, is_preferred: bool) -> f64 {
        let mut score = self.ema_latency_ms + f64::from(self.failure_streak) * FAILURE_PENALTY_MS;
        if is_preferred {
            score -= PREFERRED_BONUS_MS;
        }
        score
    }
}

/// Candidate endpoints with observed latency and failure history.
#[derive(Debug)]
pub struct EndpointPool {
    stats: Vec<EndpointStats>,
    preferred: Option<String>,
}

impl EndpointPool {
    pub fn new(urls: impl IntoIterator<Item = String>) -> Self {
        Self::with_preferred(urls, None)
    }

    /// Pool seeded with the preferred endpoint persisted from an earlier
    /// session. An unknown preferred URL is ignored.
    pub fn with_preferred(
        urls: impl IntoIterator<Item = String>,
        preferred: Option<String>,
    ) -> Self {
        let stats: Vec<EndpointStats> = urls.into_iter().map(EndpointStats::new).collect();
        let preferred =
            preferred.filter(|url| stats.iter().any(|endpoint| endpoint.url == *url));
        Self { stats, preferred }
    }

    pub fn default_endpoints() -> Self {
        Self::new(DEFAULT_ENDPOINTS.iter().map(|url| (*url).to_owned()))
    }

    /// Endpoint URLs in ascending score order (best candidate first).
    pub fn ranked_urls(&self) -> Vec<String> {
        let mut ranked: Vec<&EndpointStats> = self.stats.iter().collect();
        ranked.sort_by(|a, b| {
            a.score(self.is_preferred(&a.url))
                .total_cmp(&b.score(self.is_preferred(&b.url)))
        });
        ranked.iter().map(|endpoint| endpoint.url.clone()).collect()
    }

    /// The last endpoint that returned a usable response, if any.
    pub fn preferred_url(&self) -> Option<&str> {
        self.preferred.as_deref()
    }

    pub fn record_success(&mut self, url: &str, latency_ms: f64) {
        if let Some(endpoint) = self.stats.iter_mut().find(|endpoint| endpoint.url == url) {
            endpoint.ema_latency_ms =
                endpoint.ema_latency_ms * (1.0 - EMA_ALPHA) + latency_ms * EMA_ALPHA;
            endpoint.failure_streak = 0;
            self.preferred = Some(url.to_owned());
        }
    }

    pub fn record_failure(&mut self, url: &str) {
        if let Some(endpoint) = self.stats.iter_mut().find(|endpoint| endpoint.url == url) {
            endpoint.failure_streak = (endpoint.failure_streak + 1).min(MAX_FAILURE_STREAK);
        }
    }

    fn is_preferred(&self, url: &str) -> bool {
        self.preferred.as_deref() == Some(url)
    }
}
