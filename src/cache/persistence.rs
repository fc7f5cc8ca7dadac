//! Durable cache backends.
//!
//! Backends form an ordered fallback chain: the versioned JSON store is the
//! primary, the legacy flat store is read for migration and written only
//! when the primary is unavailable. Every backend reports success or failure
//! explicitly; callers decide what failure means.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use geo::Point;
use hashbrown::HashMap;
use log::warn;
use serde::{Deserialize, Serialize};

use super::CacheEntry;
use crate::Error;

pub(crate) const SCHEMA_VERSION: u32 = 2;

const PRIMARY_FILE: &str = "walkshed-cache-v2.json";
const LEGACY_FILE: &str = "walkshed-cache.json";
const RESET_MARKER_FILE: &str = "walkshed-cache-reset-marker";

/// Everything a backend persists in one piece.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    pub entries: HashMap<String, CacheEntry>,
    pub preferred_endpoint: Option<String>,
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Load the persisted snapshot. A missing store is an empty snapshot;
    /// an unreachable store is an error, which sends callers to the next
    /// backend in the chain.
    async fn load(&self) -> Result<CacheSnapshot, Error>;

    async fn persist(&self, snapshot: &CacheSnapshot) -> Result<(), Error>;

    /// Delete the persisted store, used to drop superseded snapshots.
    async fn discard(&self) -> Result<(), Error>;

    /// Cross-context reset marker; 0 when absent or unsupported.
    async fn read_reset_marker(&self) -> i64;

    async fn write_reset_marker(&self, marker: i64) -> Result<(), Error>;
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    #[serde(default)]
    preferred_endpoint: Option<String>,
    entries: serde_json::Map<String, serde_json::Value>,
}

/// Persisted entry shape. Points are `[lat, lon]` pairs.
#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum PersistedEntry {
    Polygon {
        polygon: Vec<[f64; 2]>,
        updated_at: i64,
    },
    Unavailable {
        retry_after: i64,
        updated_at: i64,
    },
}

impl PersistedEntry {
    fn from_entry(entry: &CacheEntry) -> Self {
        match entry {
            CacheEntry::Polygon { points, updated_at } => Self::Polygon {
                polygon: points.iter().map(|p| [p.y(), p.x()]).collect(),
                updated_at: *updated_at,
            },
            CacheEntry::Unavailable {
                retry_after,
                updated_at,
            } => Self::Unavailable {
                retry_after: *retry_after,
                updated_at: *updated_at,
            },
        }
    }

    fn into_entry(self) -> Option<CacheEntry> {
        match self {
            Self::Polygon {
                polygon,
                updated_at,
            } => {
                if polygon
                    .iter()
                    .any(|[lat, lon]| !lat.is_finite() || !lon.is_finite())
                {
                    return None;
                }
                Some(CacheEntry::Polygon {
                    points: polygon
                        .into_iter()
                        .map(|[lat, lon]| Point::new(lon, lat))
                        .collect(),
                    updated_at,
                })
            }
            Self::Unavailable {
                retry_after,
                updated_at,
            } => Some(CacheEntry::Unavailable {
                retry_after,
                updated_at,
            }),
        }
    }
}

fn parse_entries(raw: serde_json::Map<String, serde_json::Value>) -> HashMap<String, CacheEntry> {
    let mut entries = HashMap::with_capacity(raw.len());
    for (key, value) in raw {
        if key.is_empty() {
            continue;
        }
        // Entries that fail validation are dropped, not fatal.
        let Ok(persisted) = serde_json::from_value::<PersistedEntry>(value) else {
            continue;
        };
        if let Some(entry) = persisted.into_entry() {
            entries.insert(key, entry);
        }
    }
    entries
}

/// Primary backend: versioned JSON file plus a sibling reset-marker file.
pub struct JsonFileStore {
    path: PathBuf,
    marker_path: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(PRIMARY_FILE),
            marker_path: dir.join(RESET_MARKER_FILE),
        }
    }
}

#[async_trait]
impl CacheBackend for JsonFileStore {
    fn name(&self) -> &'static str {
        "json-file"
    }

    async fn load(&self) -> Result<CacheSnapshot, Error> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CacheSnapshot::default());
            }
            Err(error) => return Err(Error::Storage(error.to_string())),
        };

        let file: StoreFile = match serde_json::from_slice(&bytes) {
            Ok(file) => file,
            Err(error) => {
                // A corrupt store is discarded rather than propagated.
                warn!("discarding unreadable cache store: {error}");
                return Ok(CacheSnapshot::default());
            }
        };

        if file.version != SCHEMA_VERSION {
            warn!("discarding cache store with schema version {}", file.version);
            return Ok(CacheSnapshot::default());
        }

        Ok(CacheSnapshot {
            entries: parse_entries(file.entries),
            preferred_endpoint: file.preferred_endpoint,
        })
    }

    async fn persist(&self, snapshot: &CacheSnapshot) -> Result<(), Error> {
        let file = StoreFile {
            version: SCHEMA_VERSION,
            preferred_endpoint: snapshot.preferred_endpoint.clone(),
            entries: snapshot
                .entries
                .iter()
                .map(|(key, entry)| {
                    let value = serde_json::to_value(PersistedEntry::from_entry(entry))
                        .unwrap_or(serde_json::Value::Null);
                    (key.clone(), value)
                })
                .collect(),
        };

        let bytes =
            serde_json::to_vec(&file).map_err(|error| Error::Storage(error.to_string()))?;
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|error| Error::Storage(error.to_string()))
    }

    async fn discard(&self) -> Result<(), Error> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(Error::Storage(error.to_string())),
        }
    }

    async fn read_reset_marker(&self) -> i64 {
        match tokio::fs::read_to_string(&self.marker_path).await {
            Ok(text) => text.trim().parse().unwrap_or(0),
            Err(_) => 0,
        }
    }

    async fn write_reset_marker(&self, marker: i64) -> Result<(), Error> {
        tokio::fs::write(&self.marker_path, marker.to_string())
            .await
            .map_err(|error| Error::Storage(error.to_string()))
    }
}

#[derive(Serialize, Deserialize)]
struct LegacyFile {
    entries: serde_json::Map<String, serde_json::Value>,
}

/// Legacy flat key-value snapshot from before the store was versioned.
/// Polygon entries only; read for migration, written only in degraded mode.
pub struct LegacyFlatStore {
    path: PathBuf,
}

impl LegacyFlatStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(LEGACY_FILE),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct LegacyEntry {
    polygon: Vec<[f64; 2]>,
    #[serde(rename = "updatedAt")]
    updated_at: i64,
}

#[async_trait]
impl CacheBackend for LegacyFlatStore {
    fn name(&self) -> &'static str {
        "legacy-flat"
    }

    async fn load(&self) -> Result<CacheSnapshot, Error> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CacheSnapshot::default());
            }
            Err(error) => return Err(Error::Storage(error.to_string())),
        };

        let Ok(file) = serde_json::from_slice::<LegacyFile>(&bytes) else {
            return Ok(CacheSnapshot::default());
        };

        let mut entries = HashMap::new();
        for (key, value) in file.entries {
            let Ok(legacy) = serde_json::from_value::<LegacyEntry>(value) else {
                continue;
            };
            if legacy
                .polygon
                .iter()
                .any(|[lat, lon]| !lat.is_finite() || !lon.is_finite())
            {
                continue;
            }
            entries.insert(
                key,
                CacheEntry::Polygon {
                    points: legacy
                        .polygon
                        .into_iter()
                        .map(|[lat, lon]| Point::new(lon, lat))
                        .collect(),
                    updated_at: legacy.updated_at,
                },
            );
        }

        Ok(CacheSnapshot {
            entries,
            preferred_endpoint: None,
        })
    }

    async fn persist(&self, snapshot: &CacheSnapshot) -> Result<(), Error> {
        // The flat format has no unavailable kind; those entries are
        // session-local in degraded mode.
        let entries: serde_json::Map<String, serde_json::Value> = snapshot
            .entries
            .iter()
            .filter_map(|(key, entry)| match entry {
                CacheEntry::Polygon { points, updated_at } => {
                    let legacy = LegacyEntry {
                        polygon: points.iter().map(|p| [p.y(), p.x()]).collect(),
                        updated_at: *updated_at,
                    };
                    serde_json::to_value(legacy).ok().map(|v| (key.clone(), v))
                }
                CacheEntry::Unavailable { .. } => None,
            })
            .collect();

        let bytes = serde_json::to_vec(&LegacyFile { entries })
            .map_err(|error| Error::Storage(error.to_string()))?;
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|error| Error::Storage(error.to_string()))
    }

    async fn discard(&self) -> Result<(), Error> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(Error::Storage(error.to_string())),
        }
    }

    async fn read_reset_marker(&self) -> i64 {
        0
    }

    async fn write_reset_marker(&self, _marker: i64) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn polygon_entry(updated_at: i64) -> CacheEntry {
        CacheEntry::Polygon {
            points: vec![
                Point::new(8.4037, 49.0069),
                Point::new(8.4047, 49.0069),
                Point::new(8.4047, 49.0079),
            ],
            updated_at,
        }
    }

    #[tokio::test]
    async fn primary_round_trips_both_entry_kinds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());

        let mut snapshot = CacheSnapshot {
            preferred_endpoint: Some("https://example.net/api".to_owned()),
            ..CacheSnapshot::default()
        };
        snapshot
            .entries
            .insert("s1:300".to_owned(), polygon_entry(1_000));
        snapshot.entries.insert(
            "s2:300".to_owned(),
            CacheEntry::Unavailable {
                retry_after: 9_000,
                updated_at: 2_000,
            },
        );

        store.persist(&snapshot).await.expect("persist");
        let loaded = store.load().await.expect("load");

        assert_eq!(loaded.entries.len(), 2);
        assert_eq!(loaded.entries["s1:300"], snapshot.entries["s1:300"]);
        assert_eq!(loaded.entries["s2:300"], snapshot.entries["s2:300"]);
        assert_eq!(
            loaded.preferred_endpoint.as_deref(),
            Some("https://example.net/api")
        );
    }

    #[tokio::test]
    async fn missing_primary_is_an_empty_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());

        let loaded = store.load().await.expect("load");
        assert!(loaded.entries.is_empty());
    }

    #[tokio::test]
    async fn corrupt_primary_is_discarded_not_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(PRIMARY_FILE), b"not json").expect("write");

        let store = JsonFileStore::new(dir.path());
        let loaded = store.load().await.expect("load");
        assert!(loaded.entries.is_empty());
    }

    #[tokio::test]
    async fn malformed_entries_are_dropped_individually() {
        let dir = tempfile::tempdir().expect("tempdir");
        let raw = serde_json::json!({
            "version": SCHEMA_VERSION,
            "entries": {
                "good:300": {"kind": "polygon", "polygon": [[49.0, 8.4]], "updated_at": 5},
                "bad:300": {"kind": "polygon", "polygon": "nope", "updated_at": 5},
                "worse:300": {"kind": "unavailable", "updated_at": 5}
            }
        });
        std::fs::write(
            dir.path().join(PRIMARY_FILE),
            serde_json::to_vec(&raw).expect("encode"),
        )
        .expect("write");

        let store = JsonFileStore::new(dir.path());
        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.entries.len(), 1);
        assert!(loaded.entries.contains_key("good:300"));
    }

    #[tokio::test]
    async fn reset_marker_round_trips_and_defaults_to_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());

        assert_eq!(store.read_reset_marker().await, 0);
        store.write_reset_marker(1234).await.expect("write marker");
        assert_eq!(store.read_reset_marker().await, 1234);
    }

    #[tokio::test]
    async fn legacy_store_reads_flat_polygon_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let raw = serde_json::json!({
            "entries": {
                "s1:300": {"polygon": [[49.0069, 8.4037], [49.0079, 8.4047]], "updatedAt": 7},
                "broken": {"polygon": 12, "updatedAt": 7}
            }
        });
        std::fs::write(
            dir.path().join(LEGACY_FILE),
            serde_json::to_vec(&raw).expect("encode"),
        )
        .expect("write");

        let store = LegacyFlatStore::new(dir.path());
        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.entries.len(), 1);
        let CacheEntry::Polygon { points, updated_at } = &loaded.entries["s1:300"] else {
            panic!("expected polygon entry");
        };
        assert_eq!(*updated_at, 7);
        assert_eq!(points[0], Point::new(8.4037, 49.0069));
    }

    #[tokio::test]
    async fn discard_removes_the_store_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LegacyFlatStore::new(dir.path());
        store
            .persist(&CacheSnapshot::default())
            .await
            .expect("persist");

        store.discard().await.expect("discard");
        assert!(!dir.path().join(LEGACY_FILE).exists());
        // Discarding an absent store is fine too.
        store.discard().await.expect("discard twice");
    }
}
