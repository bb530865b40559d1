// mock_station_server: an in-process stand-in for the rig control service.
//
// Serves the push channel at /ws and the request/response routes on one
// random localhost port. Tests drive it directly: push snapshots or raw
// frames, drop clients, refuse new connections, fail or hold commands.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde_json::Value;
use sw_protocol::{
    Envelope, ErrorResponse, MachineState, STATION_COUNT, StationCountersUpdate,
    StationStateUpdate, StationStatus, StatusUpdate, SuccessResponse, SystemSettings,
    TimerSettings,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};

/// One mutating request as received, before any failure or hold applies.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCommand {
    /// Method and path, e.g. `PUT /stations/2/state`.
    pub route: String,
    pub body: Value,
}

#[derive(Debug, Clone)]
enum Outbound {
    Text(String),
    Close,
    Drop,
}

struct Rig {
    status: StatusUpdate,
    settings: SystemSettings,
}

struct MockState {
    rig: Mutex<Rig>,
    commands: Mutex<Vec<RecordedCommand>>,
    outbound: broadcast::Sender<Outbound>,
    held: watch::Sender<bool>,
    refuse_ws: AtomicBool,
    fail_commands: AtomicBool,
    accepted: AtomicUsize,
    refused: AtomicUsize,
    live: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Factory defaults of the rig service.
pub fn default_settings() -> SystemSettings {
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

/// Rig at rest: machine off, all stations enabled with zero counters.
pub fn default_status() -> StatusUpdate {
    StatusUpdate {
        supply_voltage: 13.2,
        machine_state: MachineState::Off,
        timer_active: false,
        timer_end_time: None,
        stations: (1..=STATION_COUNT as u8)
            .map(|id| StationStatus {
                enabled: true,
                ..StationStatus::idle(id)
            })
            .collect(),
    }
}

/// A mock rig control service for integration testing.
///
/// Binds to port 0 and exposes the bound address. Mutating routes update the
/// mock's own state on success, so a later `GET /status` or
/// [`push_status`](Self::push_status) reflects them.
pub struct MockStationServer {
    addr: SocketAddr,
    state: Arc<MockState>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockStationServer {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (outbound, _) = broadcast::channel(64);
        let (held, _) = watch::channel(false);
        let state = Arc::new(MockState {
            rig: Mutex::new(Rig {
                status: default_status(),
                settings: default_settings(),
            }),
            commands: Mutex::new(Vec::new()),
            outbound,
            held,
            refuse_ws: AtomicBool::new(false),
            fail_commands: AtomicBool::new(false),
            accepted: AtomicUsize::new(0),
            refused: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
        });

        let app = router(Arc::clone(&state));
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self {
            addr,
            state,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    // -- rig state --

    pub fn status(&self) -> StatusUpdate {
        lock(&self.state.rig).status.clone()
    }

    pub fn settings(&self) -> SystemSettings {
        lock(&self.state.rig).settings.clone()
    }

    pub fn set_settings(&self, settings: SystemSettings) {
        lock(&self.state.rig).settings = settings;
    }

    pub fn update_status(&self, f: impl FnOnce(&mut StatusUpdate)) {
        f(&mut lock(&self.state.rig).status);
    }

    // -- push channel --

    /// Push the current status to every connected client.
    pub fn push_status(&self) {
        let status = self.status();
        self.push_status_update(&status);
    }

    /// Push an arbitrary snapshot without changing the mock's own state.
    pub fn push_status_update(&self, update: &StatusUpdate) {
        if let Ok(text) = Envelope::status_update(update).and_then(|env| serde_json::to_string(&env)) {
            self.push_raw(text);
        }
    }

    pub fn push_raw(&self, text: impl Into<String>) {
        let _ = self.state.outbound.send(Outbound::Text(text.into()));
    }

    /// Close every client with a close frame.
    pub fn close_clients(&self) {
        let _ = self.state.outbound.send(Outbound::Close);
    }

    /// Drop every client's TCP connection without a close frame.
    pub fn drop_clients(&self) {
        let _ = self.state.outbound.send(Outbound::Drop);
    }

    /// While set, push-channel upgrades are answered with 503.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_ws.store(refuse, Ordering::SeqCst);
    }

    /// Upgrades accepted so far.
    pub fn connection_count(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Upgrades refused so far.
    pub fn refused_count(&self) -> usize {
        self.state.refused.load(Ordering::SeqCst)
    }

    /// Push-channel clients currently connected.
    pub fn live_clients(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    // -- commands --

    /// While set, mutating routes answer 500 with a `detail` body.
    pub fn fail_commands(&self, fail: bool) {
        self.state.fail_commands.store(fail, Ordering::SeqCst);
    }

    /// Hold every mutating request after it is recorded until
    /// [`release_commands`](Self::release_commands).
    pub fn hold_commands(&self) {
        self.state.held.send_replace(true);
    }

    pub fn release_commands(&self) {
        self.state.held.send_replace(false);
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        lock(&self.state.commands).clone()
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

fn router(state: Arc<MockState>) -> Router {
    Router::new()
        .route("/ws",                    get(ws_handler))
        .route("/status",                get(get_status))
        .route("/settings",              get(get_settings).put(put_settings))
        .route("/system/start",          post(post_start))
        .route("/system/stop",           post(post_stop))
        .route("/system/timer",          post(post_timer))
        .route("/stations/{id}/state",    put(put_station_state))
        .route("/stations/{id}/settings", put(put_station_settings))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<MockState>>) -> Response {
    if state.refuse_ws.load(Ordering::SeqCst) {
        state.refused.fetch_add(1, Ordering::SeqCst);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    state.accepted.fetch_add(1, Ordering::SeqCst);
    let rx = state.outbound.subscribe();
    ws.on_upgrade(move |socket| serve_socket(socket, rx, state))
}

async fn serve_socket(mut socket: WebSocket, mut rx: broadcast::Receiver<Outbound>, state: Arc<MockState>) {
    state.live.fetch_add(1, Ordering::SeqCst);
    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Ok(Outbound::Text(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(Outbound::Close) => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Ok(Outbound::Drop) | Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
            incoming = socket.recv() => match incoming {
                None | Some(Err(_) | Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    state.live.fetch_sub(1, Ordering::SeqCst);
}

async fn get_status(State(state): State<Arc<MockState>>) -> Json<StatusUpdate> {
    Json(lock(&state.rig).status.clone())
}

async fn get_settings(State(state): State<Arc<MockState>>) -> Json<SystemSettings> {
    Json(lock(&state.rig).settings.clone())
}

fn error(status: StatusCode, detail: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            detail: Some(detail.to_owned()),
        }),
    )
        .into_response()
}

/// Record, wait while held, then fail or apply.
async fn command(
    state: &MockState,
    route: String,
    body: Value,
    apply: impl FnOnce(&mut Rig) + Send,
) -> Response {
    lock(&state.commands).push(RecordedCommand { route, body });
    let mut held = state.held.subscribe();
    let _ = held.wait_for(|h| !*h).await;
    if state.fail_commands.load(Ordering::SeqCst) {
        return error(StatusCode::INTERNAL_SERVER_ERROR, "mock failure");
    }
    apply(&mut lock(&state.rig));
    Json(SuccessResponse { success: true }).into_response()
}

fn station_mut(rig: &mut Rig, id: u8) -> Option<&mut StationStatus> {
    rig.status.stations.iter_mut().find(|s| s.id == id)
}

async fn put_settings(
    State(state): State<Arc<MockState>>,
    Json(body): Json<SystemSettings>,
) -> Response {
    let recorded = serde_json::to_value(&body).unwrap_or_default();
    command(&state, "PUT /settings".to_owned(), recorded, move |rig| {
        rig.settings = body;
    })
    .await
}

async fn post_start(State(state): State<Arc<MockState>>) -> Response {
    command(&state, "POST /system/start".to_owned(), Value::Null, |rig| {
        rig.status.machine_state = MachineState::On;
    })
    .await
}

async fn post_stop(State(state): State<Arc<MockState>>) -> Response {
    command(&state, "POST /system/stop".to_owned(), Value::Null, |rig| {
        rig.status.machine_state = MachineState::Off;
    })
    .await
}

async fn post_timer(State(state): State<Arc<MockState>>, Json(body): Json<TimerSettings>) -> Response {
    let recorded = serde_json::to_value(body).unwrap_or_default();
    command(&state, "POST /system/timer".to_owned(), recorded, move |rig| {
        if body.is_clear() {
            rig.status.timer_active = false;
            rig.status.timer_end_time = None;
        } else {
            let secs = i64::from(body.hours) * 3600 + i64::from(body.minutes) * 60;
            let end = chrono::Utc::now() + chrono::Duration::seconds(secs);
            rig.status.timer_active = true;
            rig.status.timer_end_time = Some(end.to_rfc3339());
        }
    })
    .await
}

async fn put_station_state(
    State(state): State<Arc<MockState>>,
    Path(id): Path<u8>,
    Json(body): Json<StationStateUpdate>,
) -> Response {
    if station_mut(&mut lock(&state.rig), id).is_none() {
        return error(StatusCode::NOT_FOUND, "Station not found");
    }
    let recorded = serde_json::to_value(body).unwrap_or_default();
    command(&state, format!("PUT /stations/{id}/state"), recorded, move |rig| {
        if let Some(station) = station_mut(rig, id) {
            station.enabled = body.enabled;
        }
    })
    .await
}

async fn put_station_settings(
    State(state): State<Arc<MockState>>,
    Path(id): Path<u8>,
    Json(body): Json<StationCountersUpdate>,
) -> Response {
    if station_mut(&mut lock(&state.rig), id).is_none() {
        return error(StatusCode::NOT_FOUND, "Station not found");
    }
    let recorded = serde_json::to_value(body).unwrap_or_default();
    command(&state, format!("PUT /stations/{id}/settings"), recorded, move |rig| {
        if let Some(station) = station_mut(rig, id) {
            station.current_cycles = body.current_cycles;
            station.motor_failures = body.motor_failures;
            station.switch_failures = body.switch_failures;
        }
    })
    .await
}
