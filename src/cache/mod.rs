//! Two-kind, two-tier cache of computed walksheds.
//!
//! Successful polygons and "temporarily unavailable" markers share one key
//! space but live under separate capacity caps; the positive result is
//! strictly more valuable than the negative one. Reads are served from an
//! in-memory copy lazily materialized from durable storage once per process
//! (or once per externally signaled reset). Writes hit memory synchronously
//! and persist best-effort; the cache is an optimization, never a source of
//! truth.

pub mod persistence;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use geo::Point;
use hashbrown::HashMap;
use log::{debug, warn};
use tokio::sync::Mutex;

pub use persistence::{CacheBackend, CacheSnapshot, JsonFileStore, LegacyFlatStore};

/// Capacity cap for polygon entries.
pub const MAX_POLYGON_ENTRIES: usize = 400;
/// Capacity cap for unavailable markers.
pub const MAX_UNAVAILABLE_ENTRIES: usize = 120;
/// Absolute entry age limit.
pub const MAX_ENTRY_AGE_MS: i64 = 14 * 24 * 60 * 60 * 1_000;

/// Composite cache key for one `(stop, distance)` request.
pub fn cache_key(stop_id: &str, distance_meters: f64) -> String {
    format!("{stop_id}:{}", distance_meters.round() as i64)
}

/// A cached computation outcome. Entries are replaced wholesale, never
/// mutated in place. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEntry {
    Polygon {
        points: Vec<Point<f64>>,
        updated_at: i64,
    },
    /// Computation failed; do not retry before `retry_after`.
    Unavailable { retry_after: i64, updated_at: i64 },
}

impl CacheEntry {
    pub fn updated_at(&self) -> i64 {
        match self {
            Self::Polygon { updated_at, .. } | Self::Unavailable { updated_at, .. } => *updated_at,
        }
    }

    fn is_polygon(&self) -> bool {
        matches!(self, Self::Polygon { .. })
    }
}

#[derive(Default)]
struct CacheState {
    loaded: bool,
    entries: HashMap<String, CacheEntry>,
    preferred_endpoint: Option<String>,
    seen_marker: i64,
}

/// The two-tier cache store. One instance per service; independent
/// instances never share in-memory state.
pub struct CacheStore {
    backends: Vec<Arc<dyn CacheBackend>>,
    state: Mutex<CacheState>,
}

impl CacheStore {
    pub fn new(backends: Vec<Arc<dyn CacheBackend>>) -> Self {
        Self {
            backends,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Store persisting into `dir`: versioned JSON primary with a legacy
    /// flat-file fallback.
    pub fn with_dir(dir: &Path) -> Self {
        Self::new(vec![
            Arc::new(JsonFileStore::new(dir)),
            Arc::new(LegacyFlatStore::new(dir)),
        ])
    }

    /// Non-persistent store, as used when no durable storage is available.
    pub fn in_memory() -> Self {
        Self::new(Vec::new())
    }

    /// Look up an entry. Unavailable markers past their retry time expire
    /// here and read as a miss.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;

        match state.entries.get(key) {
            Some(CacheEntry::Unavailable { retry_after, .. }) if now_ms() > *retry_after => {
                state.entries.remove(key);
                None
            }
            entry => entry.cloned(),
        }
    }

    pub async fn insert_polygon(&self, key: String, points: Vec<Point<f64>>) {
        self.insert(
            key,
            CacheEntry::Polygon {
                points,
                updated_at: now_ms(),
            },
        )
        .await;
    }

    pub async fn insert_unavailable(&self, key: String, retry_after: i64) {
        self.insert(
            key,
            CacheEntry::Unavailable {
                retry_after,
                updated_at: now_ms(),
            },
        )
        .await;
    }

    /// Remove every entry belonging to `stop_id`, for stops that were
    /// deleted or moved.
    pub async fn invalidate_stop(&self, stop_id: &str) {
        let prefix = format!("{stop_id}:");
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;

        let before = state.entries.len();
        state.entries.retain(|key, _| !key.starts_with(&prefix));
        if state.entries.len() != before {
            self.persist(&state).await;
        }
    }

    /// The data endpoint that last served a usable response, persisted with
    /// the cache so following sessions can try it first.
    pub async fn preferred_endpoint(&self) -> Option<String> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;
        state.preferred_endpoint.clone()
    }

    pub async fn set_preferred_endpoint(&self, url: Option<String>) {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;
        if state.preferred_endpoint == url {
            return;
        }
        state.preferred_endpoint = url;
        self.persist(&state).await;
    }

    /// Wipe all entries and bump the reset marker so other contexts drop
    /// their in-memory snapshots too.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.loaded = true;
        state.entries.clear();

        let marker = now_ms();
        state.seen_marker = marker;
        self.persist(&state).await;
        if let Some(primary) = self.backends.first()
            && let Err(error) = primary.write_reset_marker(marker).await
        {
            warn!("failed to write cache reset marker: {error}");
        }
    }

    /// Drop the in-memory snapshot when another execution context bumped
    /// the reset marker; the next read reloads from durable storage.
    pub async fn refresh_if_reset(&self) {
        let Some(primary) = self.backends.first() else {
            return;
        };
        let marker = primary.read_reset_marker().await;

        let mut state = self.state.lock().await;
        if marker > state.seen_marker {
            debug!("cache reset marker advanced, dropping in-memory snapshot");
            state.seen_marker = marker;
            state.entries.clear();
            state.loaded = false;
        }
    }

    pub async fn len(&self) -> usize {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;
        state.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn insert(&self, key: String, entry: CacheEntry) {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;

        state.entries.insert(key, entry);
        prune_entries(&mut state.entries, now_ms());
        self.persist(&state).await;
    }

    async fn ensure_loaded(&self, state: &mut CacheState) {
        if state.loaded {
            return;
        }
        state.loaded = true;

        for (index, backend) in self.backends.iter().enumerate() {
            match backend.load().await {
                Ok(mut snapshot) => {
                    // An empty primary may mean a fresh install or an
                    // unmigrated older snapshot; check the fallbacks once,
                    // then retire them so they cannot diverge.
                    if index == 0 {
                        for legacy in &self.backends[1..] {
                            if snapshot.entries.is_empty()
                                && let Ok(migrated) = legacy.load().await
                                && !migrated.entries.is_empty()
                            {
                                debug!(
                                    "migrating {} entries from {} backend",
                                    migrated.entries.len(),
                                    legacy.name()
                                );
                                snapshot.entries = migrated.entries;
                            }
                            if let Err(error) = legacy.discard().await {
                                warn!("failed to discard {} snapshot: {error}", legacy.name());
                            }
                        }
                    }

                    debug!(
                        "loaded {} cache entries from {} backend",
                        snapshot.entries.len(),
                        backend.name()
                    );
                    state.entries = snapshot.entries;
                    state.preferred_endpoint = snapshot.preferred_endpoint;
                    state.seen_marker = self.backends[0].read_reset_marker().await;
                    return;
                }
                Err(error) => {
                    warn!("cache backend {} unavailable: {error}", backend.name());
                }
            }
        }

        if !self.backends.is_empty() {
            warn!("all cache backends unavailable, running memory-only");
        }
    }

    /// Best-effort persistence; failures are logged and swallowed.
    async fn persist(&self, state: &CacheState) {
        if self.backends.is_empty() {
            return;
        }

        let snapshot = CacheSnapshot {
            entries: state.entries.clone(),
            preferred_endpoint: state.preferred_endpoint.clone(),
        };
        for backend in &self.backends {
            match backend.persist(&snapshot).await {
                Ok(()) => return,
                Err(error) => warn!("cache persist via {} failed: {error}", backend.name()),
            }
        }
    }
}

/// Age- and capacity-based pruning, run on every write.
fn prune_entries(entries: &mut HashMap<String, CacheEntry>, now: i64) {
    entries.retain(|_, entry| now - entry.updated_at() <= MAX_ENTRY_AGE_MS);

    let polygon_count = entries.values().filter(|e| e.is_polygon()).count();
    if polygon_count > MAX_POLYGON_ENTRIES {
        // Polygons alone exceed their cap: every unavailable marker goes
        // before any polygon is evicted.
        entries.retain(|_, entry| entry.is_polygon());
        trim_least_recent(entries, CacheEntry::is_polygon, MAX_POLYGON_ENTRIES);
        return;
    }

    let unavailable_count = entries.len() - polygon_count;
    if unavailable_count > MAX_UNAVAILABLE_ENTRIES {
        trim_least_recent(
            entries,
            |entry| !entry.is_polygon(),
            MAX_UNAVAILABLE_ENTRIES,
        );
    }
}

fn trim_least_recent(
    entries: &mut HashMap<String, CacheEntry>,
    kind: impl Fn(&CacheEntry) -> bool,
    cap: usize,
) {
    let mut of_kind: Vec<(String, i64)> = entries
        .iter()
        .filter(|(_, entry)| kind(entry))
        .map(|(key, entry)| (key.clone(), entry.updated_at()))
        .collect();
    if of_kind.len() <= cap {
        return;
    }

    of_kind.sort_by_key(|(_, updated_at)| *updated_at);
    for (key, _) in &of_kind[..of_kind.len() - cap] {
        entries.remove(key);
    }
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> Vec<Point<f64>> {
        vec![
            Point::new(8.4037, 49.0069),
            Point::new(8.4047, 49.0069),
            Point::new(8.4047, 49.0079),
        ]
    }

    fn polygon(updated_at: i64) -> CacheEntry {
        CacheEntry::Polygon {
            points: triangle(),
            updated_at,
        }
    }

    fn unavailable(updated_at: i64) -> CacheEntry {
        CacheEntry::Unavailable {
            retry_after: updated_at + 60_000,
            updated_at,
        }
    }

    #[tokio::test]
    async fn polygon_round_trips_through_the_store() {
        let store = CacheStore::in_memory();
        let key = cache_key("de:08212:1", 300.0);

        store.insert_polygon(key.clone(), triangle()).await;
        let Some(CacheEntry::Polygon { points, .. }) = store.get(&key).await else {
            panic!("expected a polygon entry");
        };
        assert_eq!(points, triangle());
    }

    #[tokio::test]
    async fn expired_unavailable_marker_reads_as_a_miss() {
        let store = CacheStore::in_memory();
        let key = cache_key("s1", 300.0);

        store.insert_unavailable(key.clone(), now_ms() - 1).await;
        assert!(store.get(&key).await.is_none());

        store.insert_unavailable(key.clone(), now_ms() + 60_000).await;
        assert!(matches!(
            store.get(&key).await,
            Some(CacheEntry::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn invalidate_stop_removes_only_that_prefix() {
        let store = CacheStore::in_memory();
        store
            .insert_polygon(cache_key("s1", 300.0), triangle())
            .await;
        store
            .insert_polygon(cache_key("s1", 500.0), triangle())
            .await;
        store
            .insert_polygon(cache_key("s10", 300.0), triangle())
            .await;

        store.invalidate_stop("s1").await;
        assert!(store.get(&cache_key("s1", 300.0)).await.is_none());
        assert!(store.get(&cache_key("s1", 500.0)).await.is_none());
        assert!(store.get(&cache_key("s10", 300.0)).await.is_some());
    }

    #[test]
    fn pruning_drops_entries_past_max_age() {
        let now = MAX_ENTRY_AGE_MS * 2;
        let mut entries = HashMap::new();
        entries.insert("old:300".to_owned(), polygon(now - MAX_ENTRY_AGE_MS - 1));
        entries.insert("new:300".to_owned(), polygon(now - 1_000));

        prune_entries(&mut entries, now);
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("new:300"));
    }

    #[test]
    fn pruning_evicts_least_recently_updated_polygons_first() {
        let mut entries = HashMap::new();
        for i in 0..=MAX_POLYGON_ENTRIES {
            entries.insert(format!("s{i}:300"), polygon(i as i64 + 1));
        }

        prune_entries(&mut entries, MAX_POLYGON_ENTRIES as i64 + 10);
        assert_eq!(entries.len(), MAX_POLYGON_ENTRIES);
        // The oldest entry went; the freshest stayed.
        assert!(!entries.contains_key("s0:300"));
        assert!(entries.contains_key(&format!("s{MAX_POLYGON_ENTRIES}:300")));
    }

    #[test]
    fn pruning_never_evicts_within_capacity() {
        let mut entries = HashMap::new();
        for i in 0..10 {
            entries.insert(format!("s{i}:300"), polygon(i + 1));
        }

        prune_entries(&mut entries, 1_000);
        assert_eq!(entries.len(), 10);
    }

    #[test]
    fn unavailable_markers_go_before_any_polygon() {
        let mut entries = HashMap::new();
        for i in 0..=MAX_POLYGON_ENTRIES {
            entries.insert(format!("p{i}:300"), polygon(i as i64 + 1_000));
        }
        for i in 0..5 {
            entries.insert(format!("u{i}:300"), unavailable(i + 1));
        }

        prune_entries(&mut entries, 10_000);
        assert!(entries.keys().all(|key| key.starts_with('p')));
        assert_eq!(entries.len(), MAX_POLYGON_ENTRIES);
    }

    #[test]
    fn unavailable_cap_is_separate() {
        let mut entries = HashMap::new();
        entries.insert("p0:300".to_owned(), polygon(50_000));
        for i in 0..=MAX_UNAVAILABLE_ENTRIES {
            entries.insert(format!("u{i}:300"), unavailable(i as i64 + 1));
        }

        prune_entries(&mut entries, 100_000);
        assert!(entries.contains_key("p0:300"));
        assert_eq!(entries.len(), 1 + MAX_UNAVAILABLE_ENTRIES);
        assert!(!entries.contains_key("u0:300"));
    }

    #[tokio::test]
    async fn durable_store_round_trips_across_instances() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = cache_key("s1", 300.0);

        let writer = CacheStore::with_dir(dir.path());
        writer.insert_polygon(key.clone(), triangle()).await;

        let reader = CacheStore::with_dir(dir.path());
        let Some(CacheEntry::Polygon { points, .. }) = reader.get(&key).await else {
            panic!("expected the persisted polygon");
        };
        assert_eq!(points, triangle());
    }

    #[tokio::test]
    async fn legacy_snapshot_is_migrated_then_discarded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let raw = serde_json::json!({
            "entries": {
                "s1:300": {
                    "polygon": [[49.0069, 8.4037], [49.0079, 8.4047], [49.0079, 8.4037]],
                    "updatedAt": now_ms()
                }
            }
        });
        let legacy_path = dir.path().join("walkshed-cache.json");
        std::fs::write(&legacy_path, serde_json::to_vec(&raw).expect("encode")).expect("write");

        let store = CacheStore::with_dir(dir.path());
        assert!(store.get(&cache_key("s1", 300.0)).await.is_some());
        assert!(!legacy_path.exists());
    }

    #[tokio::test]
    async fn reset_marker_invalidates_another_instance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = cache_key("s1", 300.0);

        let first = CacheStore::with_dir(dir.path());
        first.insert_polygon(key.clone(), triangle()).await;

        let second = CacheStore::with_dir(dir.path());
        assert!(second.get(&key).await.is_some());

        first.clear().await;
        // Without the marker check the second instance would still serve
        // its stale in-memory copy.
        second.refresh_if_reset().await;
        assert!(second.get(&key).await.is_none());
    }
}
