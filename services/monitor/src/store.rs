//! Device state store.
//!
//! Single writer for the local copy of the rig state: the authoritative
//! snapshot, the settings bundle, and the overlay of station `enabled`
//! edits still awaiting confirmation.  Every public mutation runs to
//! completion under one lock and then notifies subscribers with the
//! committed view, so a subscriber never sees a half-applied merge.
//!
//! Notifications are delivered in commit order.  A mutation made from inside
//! a subscriber callback is queued and delivered after the current round
//! finishes, instead of recursing.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use sw_protocol::{MachineState, StatusUpdate, SystemSettings};
use tracing::{debug, warn};

use crate::model::{EditContext, SettingsPatch, StationCounters, StationId, SystemSnapshot};

/// Callback invoked once per committed mutation.
pub type StoreCallback = Arc<dyn Fn(&StoreView) + Send + Sync>;

/// Immutable copy of the store contents at one revision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreView {
    /// Incremented on every committed mutation.
    pub revision: u64,
    /// Number of authoritative snapshots merged so far. Never reset.
    pub snapshots: u64,
    pub system: SystemSnapshot,
    pub settings: Option<SystemSettings>,
    /// Stations whose `enabled` field is shadowed by an in-flight command.
    pub pending: BTreeSet<StationId>,
    pub edit_context: Option<EditContext>,
}

#[derive(Debug, Default)]
struct StoreState {
    revision: u64,
    snapshots: u64,
    system: SystemSnapshot,
    settings: Option<SystemSettings>,
    pending: BTreeSet<StationId>,
    edit_context: Option<EditContext>,
}

impl StoreState {
    fn view(&self) -> StoreView {
        StoreView {
            revision: self.revision,
            snapshots: self.snapshots,
            system: self.system.clone(),
            settings: self.settings.clone(),
            pending: self.pending.clone(),
            edit_context: self.edit_context,
        }
    }
}

#[derive(Default)]
struct Delivery {
    queue: VecDeque<StoreView>,
    draining: bool,
}

struct StoreInner {
    state: Mutex<StoreState>,
    subscribers: Mutex<Vec<(u64, StoreCallback)>>,
    next_subscriber: AtomicU64,
    delivery: Mutex<Delivery>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cheaply cloneable handle; all clones share one store.
#[derive(Clone)]
pub struct DeviceStateStore {
    inner: Arc<StoreInner>,
}

impl Default for DeviceStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStateStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState::default()),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(1),
                delivery: Mutex::new(Delivery::default()),
            }),
        }
    }

    // -- reads --

    pub fn view(&self) -> StoreView {
        lock(&self.inner.state).view()
    }

    pub fn system(&self) -> SystemSnapshot {
        lock(&self.inner.state).system.clone()
    }

    pub fn settings(&self) -> Option<SystemSettings> {
        lock(&self.inner.state).settings.clone()
    }

    pub fn station_enabled(&self, id: StationId) -> bool {
        lock(&self.inner.state).system.station(id).enabled
    }

    pub fn station_counters(&self, id: StationId) -> StationCounters {
        StationCounters::of(lock(&self.inner.state).system.station(id))
    }

    pub fn machine_state(&self) -> MachineState {
        lock(&self.inner.state).system.machine_state
    }

    pub fn timer_active(&self) -> bool {
        lock(&self.inner.state).system.timer_active
    }

    pub fn is_pending(&self, id: StationId) -> bool {
        lock(&self.inner.state).pending.contains(&id)
    }

    // -- subscription --

    /// Register a change callback. It stays registered until the returned
    /// handle is dropped.
    pub fn subscribe<F>(&self, callback: F) -> StoreSubscription
    where
        F: Fn(&StoreView) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.subscribers).push((id, Arc::new(callback)));
        StoreSubscription {
            store: Arc::downgrade(&self.inner),
            id,
        }
    }

    // -- authoritative merge --

    /// Merge an authoritative snapshot.
    ///
    /// System-level fields are always taken from the update.  Station fields
    /// are taken from the update too, except `enabled` for stations with an
    /// in-flight command, which keeps its local value.  While an edit context
    /// is open the station array is left untouched for this tick.
    pub fn apply_snapshot(&self, update: StatusUpdate) {
        self.mutate(|s| {
            s.snapshots += 1;
            s.system.supply_voltage = update.supply_voltage;
            s.system.machine_state = update.machine_state;
            s.system.timer_active = update.timer_active;
            s.system.timer_end_time = update.timer_end_time;

            if let Some(context) = s.edit_context {
                debug!(?context, "edit context open, station merge skipped");
                return;
            }

            for incoming in update.stations {
                let Some(id) = StationId::new(incoming.id) else {
                    warn!(station_id = incoming.id, "snapshot names unknown station, ignored");
                    continue;
                };
                let shadowed = s.pending.contains(&id);
                let slot = s.system.station_mut(id);
                let local_enabled = slot.enabled;
                *slot = incoming;
                if shadowed {
                    if slot.enabled != local_enabled {
                        debug!(station = %id, "pending edit shadows snapshot enabled flag");
                    }
                    slot.enabled = local_enabled;
                }
            }
        });
    }

    pub fn load_settings(&self, settings: SystemSettings) {
        self.mutate(|s| s.settings = Some(settings));
    }

    // -- pending overlay --

    /// Mark a station's `enabled` field as locally owned until
    /// [`end_pending_mutation`](Self::end_pending_mutation). A second begin for
    /// the same station replaces the first; the overlay never stacks.
    pub fn begin_pending_mutation(&self, id: StationId) {
        self.mutate(|s| {
            s.pending.insert(id);
        });
    }

    /// Clear the in-flight marker. Idempotent: clearing an absent marker is
    /// not a mutation and does not notify.
    pub fn end_pending_mutation(&self, id: StationId) {
        self.mutate_if(|s| s.pending.remove(&id));
    }

    // -- optimistic edits and rollback --

    pub fn optimistic_set(&self, id: StationId, enabled: bool) {
        self.mutate(|s| s.system.station_mut(id).enabled = enabled);
    }

    /// Restore a station's `enabled` field to a value captured before an
    /// optimistic edit.
    pub fn rollback(&self, id: StationId, previous: bool) {
        self.mutate(|s| s.system.station_mut(id).enabled = previous);
    }

    pub fn set_machine_state(&self, state: MachineState) {
        self.mutate(|s| s.system.machine_state = state);
    }

    pub fn set_timer_active(&self, active: bool) {
        self.mutate(|s| s.system.timer_active = active);
    }

    pub fn set_station_counters(&self, id: StationId, counters: StationCounters) {
        self.mutate(|s| counters.write_to(s.system.station_mut(id)));
    }

    /// Apply a partial settings edit on top of the loaded bundle.
    ///
    /// Returns the merged settings, or `None` (and changes nothing) when no
    /// settings have been loaded yet.
    pub fn save_settings(&self, patch: &SettingsPatch) -> Option<SystemSettings> {
        let mut merged = None;
        self.mutate_if(|s| match &s.settings {
            Some(current) => {
                let next = patch.merged_onto(current);
                s.settings = Some(next.clone());
                merged = Some(next);
                true
            }
            None => false,
        });
        merged
    }

    pub fn revert_settings(&self, previous: SystemSettings) {
        self.mutate(|s| s.settings = Some(previous));
    }

    // -- presentation signals --

    pub fn set_edit_context(&self, context: Option<EditContext>) {
        self.mutate_if(|s| {
            let changed = s.edit_context != context;
            s.edit_context = context;
            changed
        });
    }

    /// Drop all state back to the pre-connection defaults. Subscribers stay
    /// registered and are notified of the reset.
    pub fn reset(&self) {
        self.mutate(|s| {
            s.system = SystemSnapshot::default();
            s.settings = None;
            s.pending.clear();
            s.edit_context = None;
        });
    }

    // -- internal --

    fn mutate(&self, f: impl FnOnce(&mut StoreState)) {
        self.mutate_if(|s| {
            f(s);
            true
        });
    }

    /// Run `f` under the state lock; commit and notify only if it reports a
    /// change.
    fn mutate_if(&self, f: impl FnOnce(&mut StoreState) -> bool) {
        {
            let mut state = lock(&self.inner.state);
            if !f(&mut state) {
                return;
            }
            state.revision += 1;
            // Enqueue while still holding the state lock so queue order is
            // commit order.
            lock(&self.inner.delivery).queue.push_back(state.view());
        }
        self.deliver();
    }

    fn deliver(&self) {
        {
            let mut delivery = lock(&self.inner.delivery);
            if delivery.draining {
                return;
            }
            delivery.draining = true;
        }
        let mut guard = DrainGuard {
            delivery: &self.inner.delivery,
            armed: true,
        };
        loop {
            let view = {
                let mut delivery = lock(&self.inner.delivery);
                match delivery.queue.pop_front() {
                    Some(view) => view,
                    None => {
                        delivery.draining = false;
                        guard.armed = false;
                        return;
                    }
                }
            };
            let callbacks: Vec<StoreCallback> = lock(&self.inner.subscribers)
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect();
            for callback in callbacks {
                callback(&view);
            }
        }
    }
}

/// Releases the drain flag if a subscriber panics mid-round, so later
/// mutations still notify.
struct DrainGuard<'a> {
    delivery: &'a Mutex<Delivery>,
    armed: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(self.delivery).draining = false;
        }
    }
}

/// Keeps a store callback registered; dropping it unsubscribes.
pub struct StoreSubscription {
    store: Weak<StoreInner>,
    id: u64,
}

impl Drop for StoreSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.store.upgrade() {
            lock(&inner.subscribers).retain(|(id, _)| *id != self.id);
        }
    }
}
