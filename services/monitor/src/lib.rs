//! StationWatch monitor: client-side synchronization engine for the
//! endurance test rig.
//!
//! [`Monitor`] wires the components together: the push channel feeds the
//! dispatcher, `status_update` frames merge into the device state store,
//! operator actions go through the command gateway, and the countdown and
//! auto-safety monitor follow the store.

pub mod api;
pub mod config;
pub mod connection;
pub mod control_api;
pub mod countdown;
pub mod dispatch;
pub mod gateway;
pub mod model;
pub mod safety;
pub mod settings;
pub mod sse;
pub mod store;
pub mod ui_events;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use sw_protocol::{STATUS_UPDATE, StatusUpdate};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::api::ControlApi;
use crate::config::MonitorConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::countdown::{CountdownTicker, Remaining};
use crate::dispatch::{MessageDispatcher, Unsubscribe};
use crate::gateway::CommandGateway;
use crate::safety::AutoSafetyMonitor;
use crate::store::{DeviceStateStore, StoreSubscription};
use crate::ui_events::MonitorUiEvent;

const UI_EVENT_CAPACITY: usize = 256;

/// The single engine instance for a process.
pub struct Monitor {
    store: DeviceStateStore,
    dispatcher: MessageDispatcher,
    connection: ConnectionManager,
    gateway: CommandGateway,
    countdown: CountdownTicker,
    ui_tx: broadcast::Sender<MonitorUiEvent>,
    status_handler: Option<Unsubscribe>,
    _safety: AutoSafetyMonitor,
    _snapshot_events: StoreSubscription,
    bridges: Vec<JoinHandle<()>>,
}

impl Monitor {
    /// Build the engine. Nothing connects until [`start`](Self::start).
    /// Must be called inside a tokio runtime.
    pub fn init(config: &MonitorConfig, api: Arc<dyn ControlApi>) -> Self {
        let store = DeviceStateStore::new();
        let dispatcher = MessageDispatcher::new();
        let (ui_tx, _) = broadcast::channel(UI_EVENT_CAPACITY);

        let status_store = store.clone();
        let status_handler = dispatcher.subscribe_typed(STATUS_UPDATE, move |update: StatusUpdate| {
            status_store.apply_snapshot(update);
            Ok(())
        });

        let connection = ConnectionManager::new(
            config.server.ws_url(),
            config.reconnect,
            dispatcher.clone(),
            store.clone(),
            Arc::clone(&api),
        );
        let gateway = CommandGateway::new(store.clone(), api);
        let safety = AutoSafetyMonitor::attach(&store, gateway.clone());
        let countdown = CountdownTicker::spawn(&store, connection.subscribe(), false);

        let snapshot_tx = ui_tx.clone();
        let snapshot_events = store.subscribe(move |view| {
            let _ = snapshot_tx.send(MonitorUiEvent::SnapshotChanged { view: view.clone() });
        });

        let bridges = vec![
            tokio::spawn(forward_connection(connection.subscribe(), ui_tx.clone())),
            tokio::spawn(forward_countdown(countdown.subscribe(), ui_tx.clone())),
            tokio::spawn(forward_failures(gateway.subscribe_failures(), ui_tx.clone())),
        ];

        info!(ws_url = %connection.ws_url(), "monitor initialized");
        Self {
            store,
            dispatcher,
            connection,
            gateway,
            countdown,
            ui_tx,
            status_handler: Some(status_handler),
            _safety: safety,
            _snapshot_events: snapshot_events,
            bridges,
        }
    }

    /// Open the push channel.
    pub fn start(&self) {
        self.connection.open();
    }

    /// Drop the connection and all local state. [`start`](Self::start) may
    /// be called again afterwards.
    pub fn reset(&self) {
        self.connection.reset();
        self.store.reset();
        info!("monitor reset");
    }

    pub fn store(&self) -> &DeviceStateStore {
        &self.store
    }

    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.dispatcher
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn gateway(&self) -> &CommandGateway {
        &self.gateway
    }

    pub fn countdown(&self) -> Remaining {
        self.countdown.current()
    }

    pub fn subscribe_ui(&self) -> broadcast::Receiver<MonitorUiEvent> {
        self.ui_tx.subscribe()
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if let Some(handler) = self.status_handler.take() {
            handler.unsubscribe();
        }
        for bridge in &self.bridges {
            bridge.abort();
        }
        self.connection.reset();
    }
}

async fn forward_connection(
    mut rx: broadcast::Receiver<ConnectionState>,
    ui_tx: broadcast::Sender<MonitorUiEvent>,
) {
    loop {
        match rx.recv().await {
            Ok(connection) => {
                let _ = ui_tx.send(MonitorUiEvent::ConnectionChanged { connection });
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn forward_countdown(
    mut rx: tokio::sync::watch::Receiver<Remaining>,
    ui_tx: broadcast::Sender<MonitorUiEvent>,
) {
    while rx.changed().await.is_ok() {
        let remaining = *rx.borrow_and_update();
        let _ = ui_tx.send(MonitorUiEvent::CountdownTick { remaining });
    }
}

async fn forward_failures(
    mut rx: broadcast::Receiver<gateway::CommandFailure>,
    ui_tx: broadcast::Sender<MonitorUiEvent>,
) {
    loop {
        match rx.recv().await {
            Ok(failure) => {
                let _ = ui_tx.send(MonitorUiEvent::CommandFailed { failure });
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;
    use crate::test_support::{FakeApi, station, status};
    use std::time::Duration;
    use sw_protocol::{Envelope, MachineState};

    fn config() -> MonitorConfig {
        load_config_from_str(
            r#"
schema_version = 1
[server]
base_url = "http://127.0.0.1:9"
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn status_update_frames_reach_the_store_and_ui_stream() {
        let monitor = Monitor::init(&config(), FakeApi::new());
        let mut ui = monitor.subscribe_ui();

        let frame = serde_json::to_string(
            &Envelope::status_update(&status(MachineState::On, vec![station(2, true, 4)])).unwrap(),
        )
        .unwrap();
        assert_eq!(monitor.dispatcher().dispatch(&frame), 1);
        assert_eq!(monitor.store().system().station(model::StationId::ALL[1]).motor_failures, 4);

        let event = tokio::time::timeout(Duration::from_secs(1), ui.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, MonitorUiEvent::SnapshotChanged { .. }));
    }

    #[tokio::test]
    async fn command_failures_are_published_as_ui_events() {
        let monitor = Monitor::init(&config(), FakeApi::failing());
        let mut ui = monitor.subscribe_ui();

        assert!(monitor.gateway().set_timer(1, 30).unwrap().await.is_err());
        let failed = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let MonitorUiEvent::CommandFailed { failure } = ui.recv().await.unwrap() {
                    return failure;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(failed.command, gateway::CommandKind::SetTimer);
        assert!(!monitor.store().timer_active());
    }

    #[tokio::test]
    async fn reset_clears_store_and_connection() {
        let monitor = Monitor::init(&config(), FakeApi::new());
        monitor.store().apply_snapshot(status(MachineState::On, vec![station(1, true, 1)]));
        monitor.reset();
        assert_eq!(monitor.store().machine_state(), MachineState::Off);
        assert_eq!(monitor.connection_state(), ConnectionState::default());
    }
}
