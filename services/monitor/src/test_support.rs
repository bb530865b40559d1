//! Shared fixtures for unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sw_protocol::{
    MachineState, StationCountersUpdate, StationStatus, StatusUpdate, SystemSettings,
    TimerSettings,
};
use tokio::sync::Semaphore;

use crate::api::{ApiError, ApiFuture, ControlApi};
use crate::model::StationId;

pub(crate) fn settings() -> SystemSettings {
    SystemSettings {
        cutoff_voltage: 11.1,
        motor_current_threshold: 100.0,
        switch_current_threshold: 5.0,
        cycle_limit: 100_000,
        motor_failure_threshold: 10,
        switch_failure_threshold: 10,
        cycles_per_minute: 6,
    }
}

pub(crate) fn station(id: u8, enabled: bool, motor_failures: u32) -> StationStatus {
    StationStatus {
        id,
        enabled,
        motor_failures,
        switch_failures: 0,
        current_cycles: 250,
        motor_current: 1.2,
        switch_current: 0.3,
    }
}

pub(crate) fn status(machine_state: MachineState, stations: Vec<StationStatus>) -> StatusUpdate {
    StatusUpdate {
        supply_voltage: 13.2,
        machine_state,
        timer_active: false,
        timer_end_time: None,
        stations,
    }
}

/// In-memory `ControlApi` that records calls and can be told to fail or to
/// hold every call until released.
#[derive(Default)]
pub(crate) struct FakeApi {
    fail: AtomicBool,
    gate: Option<Semaphore>,
    calls: Mutex<Vec<String>>,
    last_settings: Mutex<Option<SystemSettings>>,
}

impl FakeApi {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn failing() -> Arc<Self> {
        let api = Self::default();
        api.fail.store(true, Ordering::SeqCst);
        Arc::new(api)
    }

    pub(crate) fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        })
    }

    /// Let one held call through.
    pub(crate) fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn last_settings(&self) -> Option<SystemSettings> {
        self.last_settings.lock().unwrap().clone()
    }

    async fn respond(&self, call: String) -> Result<(), ApiError> {
        self.calls.lock().unwrap().push(call);
        if let Some(gate) = &self.gate {
            gate.acquire().await.map_err(|e| ApiError::Transport(e.to_string()))?.forget();
        }
        if self.fail.load(Ordering::SeqCst) {
            Err(ApiError::Rejected {
                status: 500,
                detail: Some("rig unavailable".to_owned()),
            })
        } else {
            Ok(())
        }
    }
}

impl ControlApi for FakeApi {
    fn get_settings(&self) -> ApiFuture<'_, SystemSettings> {
        Box::pin(async move {
            self.respond("get_settings".to_owned()).await?;
            Ok(settings())
        })
    }

    fn update_settings<'a>(&'a self, s: &'a SystemSettings) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            *self.last_settings.lock().unwrap() = Some(s.clone());
            self.respond("update_settings".to_owned()).await
        })
    }

    fn get_status(&self) -> ApiFuture<'_, StatusUpdate> {
        Box::pin(async move {
            self.respond("get_status".to_owned()).await?;
            Ok(status(MachineState::Off, Vec::new()))
        })
    }

    fn start_test(&self) -> ApiFuture<'_, ()> {
        Box::pin(self.respond("start_test".to_owned()))
    }

    fn stop_test(&self) -> ApiFuture<'_, ()> {
        Box::pin(self.respond("stop_test".to_owned()))
    }

    fn set_station_enabled(&self, id: StationId, enabled: bool) -> ApiFuture<'_, ()> {
        Box::pin(self.respond(format!("set_station_enabled {id} {enabled}")))
    }

    fn update_station_counters(
        &self,
        id: StationId,
        _counters: StationCountersUpdate,
    ) -> ApiFuture<'_, ()> {
        Box::pin(self.respond(format!("update_station_counters {id}")))
    }

    fn set_timer(&self, timer: TimerSettings) -> ApiFuture<'_, ()> {
        Box::pin(self.respond(format!("set_timer {}:{}", timer.hours, timer.minutes)))
    }
}
