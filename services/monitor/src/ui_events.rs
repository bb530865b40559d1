use serde::Serialize;

use crate::connection::ConnectionState;
use crate::countdown::Remaining;
use crate::gateway::CommandFailure;
use crate::store::StoreView;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorUiEvent {
    ConnectionChanged {
        connection: ConnectionState,
    },
    SnapshotChanged {
        view: StoreView,
    },
    CountdownTick {
        remaining: Remaining,
    },
    CommandFailed {
        failure: CommandFailure,
    },
}

impl MonitorUiEvent {
    /// SSE event name; matches the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            MonitorUiEvent::ConnectionChanged { .. } => "connection_changed",
            MonitorUiEvent::SnapshotChanged { .. } => "snapshot_changed",
            MonitorUiEvent::CountdownTick { .. } => "countdown_tick",
            MonitorUiEvent::CommandFailed { .. } => "command_failed",
        }
    }
}
