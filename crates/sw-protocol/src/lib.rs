// sw-protocol: wire types exchanged with the test-rig control service.
//
// Push-channel frames are JSON envelopes `{"type": ..., "data": ...}`.  The
// request/response calls share the same payload shapes, so both the monitor
// client and the mock server in sw-test-utils build on these types.

use serde::{Deserialize, Serialize};

/// Envelope `type` carried by every periodic status push.
pub const STATUS_UPDATE: &str = "status_update";

/// Number of test stations on a rig. Station ids run `1..=STATION_COUNT`.
pub const STATION_COUNT: usize = 4;

// ---------------------------------------------------------------------------
// Push channel
// ---------------------------------------------------------------------------

/// Untyped push-channel frame.
///
/// Parsing stops at the envelope so unknown message types can still be
/// routed (or dropped) by type name without a schema change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    /// Wrap a typed payload under the given message type.
    pub fn new<T: Serialize>(kind: &str, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: kind.to_owned(),
            data: serde_json::to_value(data)?,
        })
    }

    /// Convenience for the one message type the service pushes today.
    pub fn status_update(update: &StatusUpdate) -> Result<Self, serde_json::Error> {
        Self::new(STATUS_UPDATE, update)
    }
}

/// Overall run mode of the rig.
///
/// `Disabled` is terminal from the operator's point of view: the controller
/// has tripped (e.g. supply under cutoff voltage) and will not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    On,
    #[default]
    Off,
    Disabled,
}

/// One station as reported by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationStatus {
    pub id: u8,
    pub enabled: bool,
    pub motor_failures: u32,
    pub switch_failures: u32,
    pub current_cycles: u32,
    /// Amps.
    pub motor_current: f64,
    /// Amps.
    pub switch_current: f64,
}

impl StationStatus {
    /// A station with zeroed counters and readings.
    pub fn idle(id: u8) -> Self {
        Self {
            id,
            enabled: false,
            motor_failures: 0,
            switch_failures: 0,
            current_cycles: 0,
            motor_current: 0.0,
            switch_current: 0.0,
        }
    }
}

/// Authoritative system snapshot; the `data` of a `status_update` push and
/// the body of `GET /status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub supply_voltage: f64,
    pub machine_state: MachineState,
    pub timer_active: bool,
    /// ISO-8601, UTC. Kept as text; the client parses it leniently.
    #[serde(default)]
    pub timer_end_time: Option<String>,
    pub stations: Vec<StationStatus>,
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

/// Rig-wide thresholds and rates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSettings {
    /// Volts.
    pub cutoff_voltage: f64,
    /// Amps.
    pub motor_current_threshold: f64,
    /// Amps.
    pub switch_current_threshold: f64,
    pub cycle_limit: u32,
    pub motor_failure_threshold: u32,
    pub switch_failure_threshold: u32,
    pub cycles_per_minute: u32,
}

/// Body of `PUT /stations/{id}/state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationStateUpdate {
    pub enabled: bool,
}

/// Body of `PUT /stations/{id}/settings`: operator edit of a station's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationCountersUpdate {
    pub current_cycles: u32,
    pub motor_failures: u32,
    pub switch_failures: u32,
}

/// Body of `POST /system/timer`. Zero hours and zero minutes clears the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSettings {
    pub hours: u32,
    pub minutes: u32,
}

impl TimerSettings {
    pub fn is_clear(&self) -> bool {
        self.hours == 0 && self.minutes == 0
    }
}

/// Generic acknowledgement returned by every mutating call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Error body returned alongside non-2xx statuses.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_update_envelope_matches_service_shape() {
        let update = StatusUpdate {
            supply_voltage: 13.2,
            machine_state: MachineState::On,
            timer_active: true,
            timer_end_time: Some("2024-03-21T15:30:00Z".to_owned()),
            stations: vec![StationStatus::idle(1)],
        };
        let value = serde_json::to_value(Envelope::status_update(&update).unwrap()).unwrap();
        assert_eq!(value["type"], "status_update");
        assert_eq!(value["data"]["machine_state"], "on");
        assert_eq!(value["data"]["timer_end_time"], "2024-03-21T15:30:00Z");
        assert_eq!(value["data"]["stations"][0]["id"], 1);
    }

    #[test]
    fn envelope_without_data_defaults_to_null() {
        let env: Envelope = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(env.kind, "ping");
        assert!(env.data.is_null());
    }

    #[test]
    fn status_update_accepts_null_or_missing_timer_end() {
        let with_null = json!({
            "supply_voltage": 12.9,
            "machine_state": "disabled",
            "timer_active": false,
            "timer_end_time": null,
            "stations": []
        });
        let parsed: StatusUpdate = serde_json::from_value(with_null).unwrap();
        assert_eq!(parsed.machine_state, MachineState::Disabled);
        assert!(parsed.timer_end_time.is_none());

        let missing = json!({
            "supply_voltage": 12.9,
            "machine_state": "off",
            "timer_active": false,
            "stations": []
        });
        let parsed: StatusUpdate = serde_json::from_value(missing).unwrap();
        assert!(parsed.timer_end_time.is_none());
    }

    #[test]
    fn unknown_machine_state_is_rejected() {
        let bad = json!({
            "supply_voltage": 12.0,
            "machine_state": "paused",
            "timer_active": false,
            "stations": []
        });
        assert!(serde_json::from_value::<StatusUpdate>(bad).is_err());
    }

    #[test]
    fn zero_timer_means_clear() {
        assert!(TimerSettings { hours: 0, minutes: 0 }.is_clear());
        assert!(!TimerSettings { hours: 0, minutes: 1 }.is_clear());
    }

    #[test]
    fn error_response_tolerates_missing_detail() {
        let err: ErrorResponse = serde_json::from_str("{}").unwrap();
        assert!(err.detail.is_none());
        let err: ErrorResponse = serde_json::from_str(r#"{"detail":"Invalid PIN"}"#).unwrap();
        assert_eq!(err.detail.as_deref(), Some("Invalid PIN"));
    }
}
