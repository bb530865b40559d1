//! Push-channel connection lifecycle.
//!
//! Owns the single WebSocket to the rig service and the reconnection state
//! machine:
//!
//! ```text
//! initializing -> connecting -> connected -> disconnected -> reconnecting -> connecting ...
//!                     |                          |
//!                     +-> disconnected           +-> exhausted --(manual retry)--> connecting
//! ```
//!
//! A failed connect counts as an immediate disconnect. After
//! `max_attempts` consecutive failures the phase becomes `exhausted` and no
//! further attempt is scheduled until [`ConnectionManager::manual_retry`].
//!
//! Every transition is published on a broadcast channel. Each attempt gets a
//! generation number; events from a superseded attempt are ignored.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::api::ControlApi;
use crate::dispatch::MessageDispatcher;
use crate::store::DeviceStateStore;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

const TRANSITION_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("WS: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Initializing,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Exhausted,
}

impl ConnectionPhase {
    pub fn can_transition_to(self, next: ConnectionPhase) -> bool {
        matches!(
            (self, next),
            (Self::Initializing, Self::Connecting)
                | (Self::Connecting, Self::Connected | Self::Disconnected)
                | (Self::Connected, Self::Disconnected)
                | (Self::Disconnected, Self::Reconnecting | Self::Exhausted)
                | (Self::Reconnecting | Self::Exhausted, Self::Connecting)
        )
    }

    /// True while a channel is live or being established.
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionPhase::Connecting | ConnectionPhase::Connected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    /// Consecutive failed attempts since the last successful connect.
    pub retry_count: u32,
    /// True until the first attempt has either connected or failed.
    pub first_attempt: bool,
    /// Set once settings and status have been fetched after connecting.
    pub data_loaded: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Initializing,
            retry_count: 0,
            first_attempt: true,
            data_loaded: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    /// Fixed; there is no backoff.
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl ReconnectPolicy {
    /// Phase to enter from `disconnected` once `failures` consecutive
    /// attempts have failed.
    pub fn phase_after_failures(&self, failures: u32) -> ConnectionPhase {
        if failures >= self.max_attempts {
            ConnectionPhase::Exhausted
        } else {
            ConnectionPhase::Reconnecting
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Tasks {
    generation: u64,
    session: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        if let Some(task) = self.session.take() {
            task.abort();
        }
        if let Some(task) = self.reconnect.take() {
            task.abort();
        }
    }
}

struct Inner {
    ws_url: String,
    policy: ReconnectPolicy,
    dispatcher: MessageDispatcher,
    store: DeviceStateStore,
    api: Arc<dyn ControlApi>,
    state: Mutex<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    // Lock order: `tasks` before `state`.
    tasks: Mutex<Tasks>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        ws_url: impl Into<String>,
        policy: ReconnectPolicy,
        dispatcher: MessageDispatcher,
        store: DeviceStateStore,
        api: Arc<dyn ControlApi>,
    ) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                ws_url: ws_url.into(),
                policy,
                dispatcher,
                store,
                api,
                state: Mutex::new(ConnectionState::default()),
                transitions,
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.state).clone()
    }

    pub fn phase(&self) -> ConnectionPhase {
        lock(&self.inner.state).phase
    }

    /// Receive every state change from now on, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.transitions.subscribe()
    }

    pub fn ws_url(&self) -> &str {
        &self.inner.ws_url
    }

    /// Open the push channel. No-op if one is already open or being opened,
    /// once retries are exhausted (see [`manual_retry`](Self::manual_retry)),
    /// or when called outside a tokio runtime.
    pub fn open(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            debug!("no async runtime, open ignored");
            return;
        }
        match self.phase() {
            phase if phase.is_open() => {
                debug!("push channel already open");
                return;
            }
            ConnectionPhase::Exhausted => {
                debug!("reconnect attempts exhausted, open ignored");
                return;
            }
            _ => {}
        }
        self.inner.start_attempt(false);
    }

    /// Reset the failure counter and connect again, even from `exhausted`.
    pub fn manual_retry(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            debug!("no async runtime, retry ignored");
            return;
        }
        info!("manual reconnect requested");
        if self.phase().is_open() {
            self.inner.update(|s| s.retry_count = 0);
            return;
        }
        self.inner.start_attempt(true);
    }

    /// Tear down any session and pending reconnect and return to
    /// `initializing`.
    pub fn reset(&self) {
        let mut tasks = lock(&self.inner.tasks);
        tasks.generation += 1;
        tasks.abort_all();
        let mut state = lock(&self.inner.state);
        *state = ConnectionState::default();
        info!("connection reset");
        let _ = self.inner.transitions.send(state.clone());
    }
}

impl Inner {
    /// Apply a phase change if it is legal and publish it.
    fn transition(&self, next: ConnectionPhase, update: impl FnOnce(&mut ConnectionState)) -> bool {
        let mut state = lock(&self.state);
        if !state.phase.can_transition_to(next) {
            warn!(from = ?state.phase, to = ?next, "illegal connection transition ignored");
            return false;
        }
        state.phase = next;
        update(&mut state);
        info!(phase = ?next, retry_count = state.retry_count, "connection transition");
        let _ = self.transitions.send(state.clone());
        true
    }

    /// Change non-phase fields and publish the result.
    fn update(&self, update: impl FnOnce(&mut ConnectionState)) {
        let mut state = lock(&self.state);
        update(&mut state);
        let _ = self.transitions.send(state.clone());
    }

    fn start_attempt(self: &Arc<Self>, reset_retries: bool) {
        let mut tasks = lock(&self.tasks);
        let entered = self.transition(ConnectionPhase::Connecting, |s| {
            if reset_retries {
                s.retry_count = 0;
            }
        });
        if !entered {
            return;
        }
        tasks.generation += 1;
        tasks.abort_all();
        let generation = tasks.generation;
        tasks.session = Some(tokio::spawn(run_session(Arc::clone(self), generation)));
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.tasks).generation == generation
    }

    fn mark_connected(&self, generation: u64) -> bool {
        let mut tasks = lock(&self.tasks);
        if tasks.generation != generation {
            return false;
        }
        if let Some(timer) = tasks.reconnect.take() {
            timer.abort();
        }
        self.transition(ConnectionPhase::Connected, |s| {
            s.retry_count = 0;
            s.first_attempt = false;
        })
    }

    /// Record a drop or failed connect and decide between another attempt
    /// and `exhausted`.
    fn handle_close(self: &Arc<Self>, generation: u64) {
        let mut tasks = lock(&self.tasks);
        if tasks.generation != generation {
            debug!(generation, "close from superseded attempt ignored");
            return;
        }
        tasks.session = None;
        if !self.transition(ConnectionPhase::Disconnected, |s| s.first_attempt = false) {
            return;
        }
        let failures = lock(&self.state).retry_count.saturating_add(1);
        let next = self.policy.phase_after_failures(failures);
        self.transition(next, |s| s.retry_count = failures);

        if next == ConnectionPhase::Exhausted {
            warn!(failures, "reconnect attempts exhausted; waiting for manual retry");
            return;
        }

        let inner = Arc::clone(self);
        let delay = self.policy.delay;
        tasks.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut tasks = lock(&inner.tasks);
                if tasks.generation != generation {
                    return;
                }
                tasks.reconnect = None;
            }
            inner.start_attempt(false);
        }));
    }

    /// Fetch settings and status once per process, after the first
    /// successful connect. A failure leaves `data_loaded` unset so the next
    /// connect tries again.
    async fn load_initial_data(&self, generation: u64) {
        if lock(&self.state).data_loaded {
            return;
        }
        let settings = match self.api.get_settings().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "initial settings load failed");
                return;
            }
        };
        let frames_before = self.dispatcher.delivered_frames();
        let status = match self.api.get_status().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "initial status load failed");
                return;
            }
        };
        if !self.is_current(generation) {
            return;
        }
        self.store.load_settings(settings);
        // A snapshot pushed while the fetch was in flight is at least as new.
        if self.dispatcher.delivered_frames() == frames_before {
            self.store.apply_snapshot(status);
        } else {
            debug!("push arrived during initial load, fetched status discarded");
        }
        self.update(|s| s.data_loaded = true);
        info!("initial data loaded");
    }
}

async fn run_session(inner: Arc<Inner>, generation: u64) {
    let ws = match connect_async(inner.ws_url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!(url = %inner.ws_url, error = %e, "push channel connect failed");
            inner.handle_close(generation);
            return;
        }
    };
    if !inner.mark_connected(generation) {
        return;
    }
    // Keep reading while the initial load is in flight; a close ends the
    // session and drops the load with it.
    let load = inner.load_initial_data(generation);
    let reading = read_loop(ws, &inner.dispatcher);
    tokio::pin!(load, reading);
    let result = tokio::select! {
        result = &mut reading => result,
        () = &mut load => reading.await,
    };
    match result {
        Ok(()) => info!("push channel closed"),
        Err(e) => warn!(error = %e, "push channel error"),
    }
    inner.handle_close(generation);
}

/// Feed text frames to the dispatcher until the channel ends. Frames are
/// dispatched in arrival order, one at a time.
pub async fn read_loop<S>(mut ws: S, dispatcher: &MessageDispatcher) -> Result<(), SessionError>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => {
                dispatcher.dispatch(&text);
            }
            Message::Ping(payload) => ws.send(Message::Pong(payload)).await?,
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}
