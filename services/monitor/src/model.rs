//! Client-side domain types held by the device state store.

use serde::{Deserialize, Serialize};
use sw_protocol::{MachineState, STATION_COUNT, StationStatus, SystemSettings};

/// Identity of one of the four fixed stations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct StationId(u8);

impl StationId {
    /// All station ids, in display order.
    pub const ALL: [StationId; STATION_COUNT] = [StationId(1), StationId(2), StationId(3), StationId(4)];

    pub fn new(id: u8) -> Option<Self> {
        (1..=STATION_COUNT as u8).contains(&id).then_some(Self(id))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    fn index(self) -> usize {
        usize::from(self.0 - 1)
    }
}

impl TryFrom<u8> for StationId {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("station id {value} out of range 1..={STATION_COUNT}"))
    }
}

impl From<StationId> for u8 {
    fn from(id: StationId) -> Self {
        id.0
    }
}

impl std::fmt::Display for StationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operator-editable station counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationCounters {
    pub current_cycles: u32,
    pub motor_failures: u32,
    pub switch_failures: u32,
}

impl StationCounters {
    pub fn of(station: &StationStatus) -> Self {
        Self {
            current_cycles: station.current_cycles,
            motor_failures: station.motor_failures,
            switch_failures: station.switch_failures,
        }
    }

    pub(crate) fn write_to(self, station: &mut StationStatus) {
        station.current_cycles = self.current_cycles;
        station.motor_failures = self.motor_failures;
        station.switch_failures = self.switch_failures;
    }
}

impl From<StationCounters> for sw_protocol::StationCountersUpdate {
    fn from(c: StationCounters) -> Self {
        Self {
            current_cycles: c.current_cycles,
            motor_failures: c.motor_failures,
            switch_failures: c.switch_failures,
        }
    }
}

/// Local copy of the authoritative system state.
///
/// The station array is fixed: slot `i` always holds station `i + 1`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemSnapshot {
    pub supply_voltage: f64,
    pub machine_state: MachineState,
    pub timer_active: bool,
    pub timer_end_time: Option<String>,
    pub stations: [StationStatus; STATION_COUNT],
}

impl Default for SystemSnapshot {
    fn default() -> Self {
        Self {
            supply_voltage: 0.0,
            machine_state: MachineState::Off,
            timer_active: false,
            timer_end_time: None,
            stations: StationId::ALL.map(|id| StationStatus::idle(id.get())),
        }
    }
}

impl SystemSnapshot {
    pub fn station(&self, id: StationId) -> &StationStatus {
        &self.stations[id.index()]
    }

    pub(crate) fn station_mut(&mut self, id: StationId) -> &mut StationStatus {
        &mut self.stations[id.index()]
    }
}

/// Modal editing context signaled by the presentation layer.
///
/// While one is open, inbound snapshots leave the station array alone so the
/// form being edited is not overwritten underneath the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditContext {
    Settings,
    Station(StationId),
}

/// Partial settings edit. `None` fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsPatch {
    pub cutoff_voltage: Option<f64>,
    pub motor_current_threshold: Option<f64>,
    pub switch_current_threshold: Option<f64>,
    pub cycle_limit: Option<u32>,
    pub motor_failure_threshold: Option<u32>,
    pub switch_failure_threshold: Option<u32>,
    pub cycles_per_minute: Option<u32>,
}

impl SettingsPatch {
    /// Apply the patch on top of `base`, returning the merged settings.
    pub fn merged_onto(&self, base: &SystemSettings) -> SystemSettings {
        SystemSettings {
            cutoff_voltage: self.cutoff_voltage.unwrap_or(base.cutoff_voltage),
            motor_current_threshold: self
                .motor_current_threshold
                .unwrap_or(base.motor_current_threshold),
            switch_current_threshold: self
                .switch_current_threshold
                .unwrap_or(base.switch_current_threshold),
            cycle_limit: self.cycle_limit.unwrap_or(base.cycle_limit),
            motor_failure_threshold: self
                .motor_failure_threshold
                .unwrap_or(base.motor_failure_threshold),
            switch_failure_threshold: self
                .switch_failure_threshold
                .unwrap_or(base.switch_failure_threshold),
            cycles_per_minute: self.cycles_per_minute.unwrap_or(base.cycles_per_minute),
        }
    }
}
