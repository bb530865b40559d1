//! Command gateway: every operator action goes through here.
//!
//! Each action captures the value it is about to change, applies the change
//! to the store synchronously, and returns a future that performs the remote
//! call. On failure the captured value is restored. The optimistic edit is
//! already visible when the action method returns, before the future is
//! first polled.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use sw_protocol::{MachineState, TimerSettings};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::api::{ApiError, ControlApi};
use crate::model::{SettingsPatch, StationCounters, StationId};
use crate::settings::{ValidationError, validate_patch, validate_timer};
use crate::store::DeviceStateStore;

pub type CommandFuture = Pin<Box<dyn Future<Output = Result<(), CommandError>> + Send + 'static>>;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),
    #[error("machine is disabled")]
    MachineDisabled,
    #[error("unknown station {0}")]
    UnknownStation(u8),
    #[error("settings have not been loaded yet")]
    SettingsNotLoaded,
    #[error("remote call failed: {0}")]
    Remote(#[from] ApiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    ToggleRunning,
    SetStationState,
    SaveSettings,
    SetTimer,
    UpdateStationSettings,
}

/// Published whenever a remote call fails and the local edit was rolled back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandFailure {
    pub command: CommandKind,
    pub station: Option<StationId>,
    pub error: String,
}

const FAILURE_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct CommandGateway {
    store: DeviceStateStore,
    api: Arc<dyn ControlApi>,
    failures: broadcast::Sender<CommandFailure>,
}

impl CommandGateway {
    pub fn new(store: DeviceStateStore, api: Arc<dyn ControlApi>) -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CAPACITY);
        Self {
            store,
            api,
            failures,
        }
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<CommandFailure> {
        self.failures.subscribe()
    }

    /// Start the test cycle when off, stop it when on.
    ///
    /// Refused locally, without a remote call, when the machine is disabled.
    pub fn toggle_running(&self) -> Result<CommandFuture, CommandError> {
        let previous = self.store.machine_state();
        let target = match previous {
            MachineState::Disabled => return Err(CommandError::MachineDisabled),
            MachineState::On => MachineState::Off,
            MachineState::Off => MachineState::On,
        };
        self.store.set_machine_state(target);

        let this = self.clone();
        Ok(Box::pin(async move {
            let result = match target {
                MachineState::On => this.api.start_test().await,
                _ => this.api.stop_test().await,
            };
            match result {
                Ok(()) => {
                    info!(state = ?target, "run state change confirmed");
                    Ok(())
                }
                Err(e) => {
                    this.store.set_machine_state(previous);
                    Err(this.failed(CommandKind::ToggleRunning, None, e))
                }
            }
        }))
    }

    /// Enable or disable one station.
    ///
    /// The station's `enabled` flag is shadowed against inbound snapshots
    /// until the call settles either way.
    pub fn set_station_state(&self, id: StationId, enabled: bool) -> CommandFuture {
        let previous = self.store.station_enabled(id);
        self.store.begin_pending_mutation(id);
        self.store.optimistic_set(id, enabled);

        let this = self.clone();
        Box::pin(async move {
            let result = this.api.set_station_enabled(id, enabled).await;
            this.store.end_pending_mutation(id);
            match result {
                Ok(()) => {
                    debug!(station = %id, enabled, "station state confirmed");
                    Ok(())
                }
                Err(e) => {
                    this.store.rollback(id, previous);
                    Err(this.failed(CommandKind::SetStationState, Some(id), e))
                }
            }
        })
    }

    /// Save a partial settings edit. Out-of-range values are rejected here,
    /// before the store or the service sees them.
    pub fn save_settings(&self, patch: SettingsPatch) -> Result<CommandFuture, CommandError> {
        validate_patch(&patch)?;
        let previous = self.store.settings().ok_or(CommandError::SettingsNotLoaded)?;
        let merged = self
            .store
            .save_settings(&patch)
            .ok_or(CommandError::SettingsNotLoaded)?;

        let this = self.clone();
        Ok(Box::pin(async move {
            match this.api.update_settings(&merged).await {
                Ok(()) => {
                    info!("settings saved");
                    Ok(())
                }
                Err(e) => {
                    this.store.revert_settings(previous);
                    Err(this.failed(CommandKind::SaveSettings, None, e))
                }
            }
        }))
    }

    /// Set the countdown. Zero hours and zero minutes clears it.
    ///
    /// Only the active flag is set locally; the end timestamp is left for the
    /// next snapshot so the client clock never feeds the countdown.
    pub fn set_timer(&self, hours: u32, minutes: u32) -> Result<CommandFuture, CommandError> {
        let timer = TimerSettings { hours, minutes };
        validate_timer(&timer)?;
        let previous = self.store.timer_active();
        self.store.set_timer_active(!timer.is_clear());

        let this = self.clone();
        Ok(Box::pin(async move {
            match this.api.set_timer(timer).await {
                Ok(()) => {
                    info!(hours, minutes, "timer set");
                    Ok(())
                }
                Err(e) => {
                    this.store.set_timer_active(previous);
                    Err(this.failed(CommandKind::SetTimer, None, e))
                }
            }
        }))
    }

    pub fn clear_timer(&self) -> Result<CommandFuture, CommandError> {
        self.set_timer(0, 0)
    }

    /// Overwrite a station's cycle and failure counters (operator reset).
    pub fn update_station_settings(&self, id: StationId, counters: StationCounters) -> CommandFuture {
        let previous = self.store.station_counters(id);
        self.store.set_station_counters(id, counters);

        let this = self.clone();
        Box::pin(async move {
            match this.api.update_station_counters(id, counters.into()).await {
                Ok(()) => {
                    info!(station = %id, "station counters updated");
                    Ok(())
                }
                Err(e) => {
                    this.store.set_station_counters(id, previous);
                    Err(this.failed(CommandKind::UpdateStationSettings, Some(id), e))
                }
            }
        })
    }

    fn failed(&self, command: CommandKind, station: Option<StationId>, error: ApiError) -> CommandError {
        warn!(?command, station = ?station.map(StationId::get), error = %error, "command failed, local edit rolled back");
        let _ = self.failures.send(CommandFailure {
            command,
            station,
            error: error.to_string(),
        });
        CommandError::Remote(error)
    }
}
