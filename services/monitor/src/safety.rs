//! Automatic station disable on threshold breach.
//!
//! Evaluated after every store change. A station that is enabled and has
//! reached its motor-failure, switch-failure or cycle limit is disabled
//! through the command gateway, exactly as an operator toggle would. The
//! gateway applies the optimistic disable before returning, so the next
//! evaluation already sees the station disabled and does not issue again.
//!
//! A disable whose remote call fails is rolled back, which re-enables the
//! station locally. At most one disable per station is issued per
//! authoritative snapshot, so a failing service is retried once per pushed
//! snapshot and the rollback alone never triggers another call.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use sw_protocol::SystemSettings;
use tracing::{debug, info, warn};

use crate::gateway::CommandGateway;
use crate::model::StationId;
use crate::store::{DeviceStateStore, StoreSubscription, StoreView};

/// Which limit a station has reached, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breach {
    MotorFailures,
    SwitchFailures,
    CycleLimit,
}

fn breach(settings: &SystemSettings, station: &sw_protocol::StationStatus) -> Option<Breach> {
    if station.motor_failures >= settings.motor_failure_threshold {
        Some(Breach::MotorFailures)
    } else if station.switch_failures >= settings.switch_failure_threshold {
        Some(Breach::SwitchFailures)
    } else if station.current_cycles >= settings.cycle_limit {
        Some(Breach::CycleLimit)
    } else {
        None
    }
}

/// Enabled stations that have reached a limit. Empty until settings are
/// loaded.
pub fn stations_to_disable(view: &StoreView) -> Vec<(StationId, Breach)> {
    let Some(settings) = &view.settings else {
        return Vec::new();
    };
    StationId::ALL
        .into_iter()
        .filter_map(|id| {
            let station = view.system.station(id);
            if !station.enabled {
                return None;
            }
            breach(settings, station).map(|b| (id, b))
        })
        .collect()
}

/// Keeps the check attached to the store; dropping it detaches.
pub struct AutoSafetyMonitor {
    _subscription: StoreSubscription,
}

impl AutoSafetyMonitor {
    /// Attach to `store`. Must be called inside a tokio runtime; disable
    /// commands are spawned onto it.
    pub fn attach(store: &DeviceStateStore, gateway: CommandGateway) -> Self {
        let current = store.clone();
        // Snapshot count at which each station was last disabled.
        let issued: Mutex<HashMap<StationId, u64>> = Mutex::new(HashMap::new());
        let subscription = store.subscribe(move |_| {
            // Queued notifications may be older than the store; judge the
            // live state so a station already disabled is never hit twice.
            let view = current.view();
            let due: Vec<(StationId, Breach)> = {
                let mut issued = issued.lock().unwrap_or_else(PoisonError::into_inner);
                stations_to_disable(&view)
                    .into_iter()
                    .filter(|(id, _)| {
                        if issued.get(id) == Some(&view.snapshots) {
                            debug!(station = %id, "disable already issued for this snapshot");
                            return false;
                        }
                        issued.insert(*id, view.snapshots);
                        true
                    })
                    .collect()
            };
            for (id, reason) in due {
                info!(station = %id, ?reason, "threshold reached, disabling station");
                let command = gateway.set_station_state(id, false);
                tokio::spawn(async move {
                    if let Err(e) = command.await {
                        warn!(station = %id, error = %e, "automatic disable failed");
                    }
                });
            }
        });
        Self {
            _subscription: subscription,
        }
    }
}
