//! Viewport-driven overlay scheduling.
//!
//! Keeps the rendered coverage overlay in sync with a moving map viewport:
//! decides which stops need a walkshed, queues them, and runs a bounded
//! number of computations at a time. Results that arrive after the world
//! changed under them (new settings, removed stop, panned-away viewport)
//! are discarded instead of rendered.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use hashbrown::{HashMap, HashSet};
use log::debug;
use tokio::task::JoinHandle;

use crate::StopId;
use crate::model::Stop;
use crate::service::WalkshedProvider;

/// Concurrent walkshed computations.
pub const LOAD_CONCURRENCY: usize = 4;
/// Debounce for viewport movement before resyncing.
pub const SYNC_DEBOUNCE: Duration = Duration::from_millis(120);
/// Fraction of the viewport span loaded beyond each edge.
pub const VIEWPORT_PADDING_FRACTION: f64 = 0.08;

/// Geographic viewport in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl Viewport {
    /// The viewport grown by the padding fraction on every edge, so stops
    /// just off-screen are ready when the user pans.
    pub fn padded(&self) -> Self {
        let lat_pad = (self.north - self.south) * VIEWPORT_PADDING_FRACTION;
        let lon_pad = (self.east - self.west) * VIEWPORT_PADDING_FRACTION;
        Self {
            south: self.south - lat_pad,
            west: self.west - lon_pad,
            north: self.north + lat_pad,
            east: self.east + lon_pad,
        }
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.south && lat <= self.north && lon >= self.west && lon <= self.east
    }
}

/// How stop coverage is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageMode {
    /// Plain radius circles, no computation needed here.
    Circle,
    /// Network-based walkshed polygons.
    Walkshed,
}

/// Rendering settings the scheduler reacts to.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlaySettings {
    pub mode: CoverageMode,
    pub radius_by_kind: HashMap<String, f64>,
    pub default_radius_meters: f64,
}

impl OverlaySettings {
    pub fn radius_for(&self, kind: &str) -> f64 {
        self.radius_by_kind
            .get(kind)
            .copied()
            .unwrap_or(self.default_radius_meters)
    }
}

/// Receives finished polygons. Implemented by the rendering host.
pub trait OverlaySink: Send + Sync {
    fn apply_polygon(&self, stop_id: &str, points: &[geo::Point<f64>]);
    fn remove_polygon(&self, stop_id: &str);
}

struct SchedulerState {
    stops: HashMap<StopId, Stop>,
    settings: OverlaySettings,
    viewport: Option<Viewport>,
    rendered: HashSet<StopId>,
    pending: VecDeque<StopId>,
    pending_set: HashSet<StopId>,
    in_flight: HashSet<StopId>,
    /// `stop:radius` keys that came back without a polygon; skipped until
    /// settings change or the cache is reset.
    unavailable: HashSet<String>,
    /// Bumped whenever settings or the stop set change wholesale; results
    /// started under an older epoch are discarded.
    epoch: u64,
    active_workers: usize,
    debounce: Option<JoinHandle<()>>,
}

struct Inner {
    provider: Arc<dyn WalkshedProvider>,
    sink: Arc<dyn OverlaySink>,
    state: Mutex<SchedulerState>,
}

/// Schedules walkshed computation for the stops in view.
pub struct OverlayScheduler {
    inner: Arc<Inner>,
}

impl OverlayScheduler {
    pub fn new(
        provider: Arc<dyn WalkshedProvider>,
        sink: Arc<dyn OverlaySink>,
        settings: OverlaySettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                sink,
                state: Mutex::new(SchedulerState {
                    stops: HashMap::new(),
                    settings,
                    viewport: None,
                    rendered: HashSet::new(),
                    pending: VecDeque::new(),
                    pending_set: HashSet::new(),
                    in_flight: HashSet::new(),
                    unavailable: HashSet::new(),
                    epoch: 0,
                    active_workers: 0,
                    debounce: None,
                }),
            }),
        }
    }

    /// Replace the whole stop set.
    pub fn set_stops(&self, stops: Vec<Stop>) {
        let removed: Vec<StopId> = {
            let mut state = self.inner.lock_state();
            state.epoch += 1;
            state.pending.clear();
            state.pending_set.clear();

            let next: HashMap<StopId, Stop> =
                stops.into_iter().map(|stop| (stop.id.clone(), stop)).collect();
            let removed = state
                .rendered
                .iter()
                .filter(|id| !next.contains_key(*id))
                .cloned()
                .collect();
            state.rendered.retain(|id| next.contains_key(id));
            state.stops = next;
            removed
        };
        for id in removed {
            self.inner.sink.remove_polygon(&id);
        }
        self.inner.clone().sync_visible();
    }

    /// Add or update a single stop. A moved stop gets a fresh polygon.
    pub fn upsert_stop(&self, stop: Stop) {
        let rerender = {
            let mut state = self.inner.lock_state();
            let changed = state
                .stops
                .get(&stop.id)
                .is_none_or(|existing| *existing != stop);
            if changed {
                state.rendered.remove(&stop.id);
                let prefix = format!("{}:", stop.id);
                state.unavailable.retain(|key| !key.starts_with(&prefix));
            }
            state.stops.insert(stop.id.clone(), stop.clone());
            changed
        };
        if rerender {
            self.inner.sink.remove_polygon(&stop.id);
            self.inner.clone().sync_visible();
        }
    }

    pub fn remove_stop(&self, stop_id: &str) {
        let was_rendered = {
            let mut state = self.inner.lock_state();
            state.stops.remove(stop_id);
            state.pending_set.remove(stop_id);
            state.pending.retain(|id| id != stop_id);
            state.in_flight.remove(stop_id);
            // A re-added stop starts fresh, without stale negatives.
            let prefix = format!("{stop_id}:");
            state.unavailable.retain(|key| !key.starts_with(&prefix));
            state.rendered.remove(stop_id)
        };
        if was_rendered {
            self.inner.sink.remove_polygon(stop_id);
        }
    }

    /// Request one stop ahead of everything else, skipping the debounce
    /// and any unavailable marker. Used when the user selects a stop.
    pub fn prioritize(&self, stop_id: &str) {
        {
            let mut state = self.inner.lock_state();
            if state.settings.mode != CoverageMode::Walkshed
                || !state.stops.contains_key(stop_id)
                || state.rendered.contains(stop_id)
                || state.in_flight.contains(stop_id)
            {
                return;
            }
            if let Some(stop) = state.stops.get(stop_id) {
                let key = format!("{}:{}", stop_id, state.settings.radius_for(&stop.kind));
                state.unavailable.remove(&key);
            }
            if state.pending_set.insert(stop_id.to_owned()) {
                state.pending.push_front(stop_id.to_owned());
            } else {
                state.pending.retain(|id| id != stop_id);
                state.pending.push_front(stop_id.to_owned());
            }
        }
        self.inner.clone().drain();
    }

    /// Report viewport movement. Syncs after a short quiet period so a
    /// continuous pan does not queue work for every frame.
    pub fn viewport_changed(&self, viewport: Viewport) {
        let mut state = self.inner.lock_state();
        state.viewport = Some(viewport);
        if let Some(handle) = state.debounce.take() {
            handle.abort();
        }
        let inner = Arc::clone(&self.inner);
        state.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(SYNC_DEBOUNCE).await;
            inner.sync_visible();
        }));
    }

    /// Apply new rendering settings. Everything rendered under the old
    /// settings comes down; in walkshed mode the visible set requeues.
    pub fn settings_changed(&self, settings: OverlaySettings) {
        let rendered: Vec<StopId> = {
            let mut state = self.inner.lock_state();
            if state.settings == settings {
                return;
            }
            state.settings = settings;
            state.epoch += 1;
            state.pending.clear();
            state.pending_set.clear();
            state.unavailable.clear();
            state.rendered.drain().collect()
        };
        for id in rendered {
            self.inner.sink.remove_polygon(&id);
        }
        self.inner.clone().sync_visible();
    }

    /// The backing cache was cleared elsewhere; drop local negatives and
    /// rendered polygons and recompute what is visible.
    pub fn cache_reset(&self) {
        let rendered: Vec<StopId> = {
            let mut state = self.inner.lock_state();
            state.epoch += 1;
            state.pending.clear();
            state.pending_set.clear();
            state.unavailable.clear();
            state.rendered.drain().collect()
        };
        for id in rendered {
            self.inner.sink.remove_polygon(&id);
        }
        self.inner.clone().sync_visible();
    }
}

impl Drop for OverlayScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.lock_state().debounce.take() {
            handle.abort();
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue every visible stop that still needs a polygon, take down
    /// polygons that scrolled out of view, then start workers up to the
    /// concurrency limit.
    fn sync_visible(self: Arc<Self>) {
        let hidden: Vec<StopId> = {
            let mut state = self.lock_state();
            if state.settings.mode != CoverageMode::Walkshed {
                return;
            }
            let Some(viewport) = state.viewport.map(|v| v.padded()) else {
                return;
            };

            let hidden: Vec<StopId> = state
                .rendered
                .iter()
                .filter(|id| {
                    state
                        .stops
                        .get(*id)
                        .is_none_or(|stop| !viewport.contains(stop.lat, stop.lon))
                })
                .cloned()
                .collect();
            for id in &hidden {
                state.rendered.remove(id);
            }

            let mut due: Vec<StopId> = Vec::new();
            for (id, stop) in &state.stops {
                if !viewport.contains(stop.lat, stop.lon)
                    || state.rendered.contains(id)
                    || state.in_flight.contains(id)
                    || state.pending_set.contains(id)
                {
                    continue;
                }
                let key = format!("{}:{}", id, state.settings.radius_for(&stop.kind));
                if state.unavailable.contains(&key) {
                    continue;
                }
                due.push(id.clone());
            }
            debug!("overlay sync queued {} stops", due.len());
            for id in due {
                state.pending_set.insert(id.clone());
                state.pending.push_back(id);
            }
            hidden
        };
        for id in hidden {
            self.sink.remove_polygon(&id);
        }
        self.drain();
    }

    fn drain(self: Arc<Self>) {
        loop {
            let job = {
                let mut state = self.lock_state();
                if state.active_workers >= LOAD_CONCURRENCY {
                    return;
                }
                let Some(id) = state.pending.pop_front() else {
                    return;
                };
                state.pending_set.remove(&id);
                let Some(stop) = state.stops.get(&id).cloned() else {
                    continue;
                };
                let radius = state.settings.radius_for(&stop.kind);
                state.in_flight.insert(id);
                state.active_workers += 1;
                (stop, radius, state.epoch)
            };

            let inner = Arc::clone(&self);
            let (stop, radius, epoch) = job;
            tokio::spawn(async move {
                inner.run_worker(stop, radius, epoch).await;
            });
        }
    }

    async fn run_worker(self: Arc<Self>, stop: Stop, radius: f64, epoch: u64) {
        let polygon = self.provider.walkshed_polygon(&stop, radius).await;

        let apply = {
            let mut state = self.lock_state();
            state.active_workers -= 1;
            state.in_flight.remove(&stop.id);

            let still_wanted = state.epoch == epoch
                && state.settings.mode == CoverageMode::Walkshed
                && state.settings.radius_for(&stop.kind) == radius
                && state.stops.get(&stop.id) == Some(&stop)
                && state
                    .viewport
                    .is_some_and(|v| v.padded().contains(stop.lat, stop.lon));

            match &polygon {
                Some(_) if still_wanted => {
                    state.rendered.insert(stop.id.clone());
                    true
                }
                Some(_) => {
                    debug!("discarding stale walkshed for stop {}", stop.id);
                    false
                }
                None => {
                    if state.epoch == epoch {
                        state.unavailable.insert(format!("{}:{radius}", stop.id));
                    }
                    false
                }
            }
        };

        // Sink calls happen outside the lock.
        if apply && let Some(points) = &polygon {
            self.sink.apply_polygon(&stop.id, points);
        }

        // A stale result may have left its stop wanting a recompute under
        // the new settings; a full sync picks that up.
        Arc::clone(&self).sync_visible();
        self.drain();
    }
}
