//! Localhost control API: the presentation boundary.
//!
//! Reads expose the store, connection and countdown. Writes call the command
//! gateway and wait for the remote call to settle, so the response reports
//! whether the edit was confirmed or rolled back.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use sw_protocol::SystemSettings;

use crate::Monitor;
use crate::connection::ConnectionState;
use crate::countdown::Remaining;
use crate::gateway::{CommandError, CommandFuture};
use crate::model::{EditContext, SettingsPatch, StationCounters, StationId, SystemSnapshot};

pub struct AppState {
    pub monitor: Arc<Monitor>,
}

impl AppState {
    pub fn new(monitor: Arc<Monitor>) -> Arc<Self> {
        Arc::new(Self { monitor })
    }
}

// ---------------------------------------------------------------------------
// Bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub connection: ConnectionState,
    pub system: SystemSnapshot,
    pub settings: Option<SystemSettings>,
    pub pending: BTreeSet<StationId>,
    pub edit_context: Option<EditContext>,
    pub countdown: Remaining,
}

#[derive(Debug, Deserialize)]
pub struct EnabledBody {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct TimerBody {
    pub hours: u32,
    pub minutes: u32,
}

#[derive(Debug, Deserialize)]
pub struct EditContextBody {
    #[serde(default)]
    pub context: Option<EditContext>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/state",                  get(get_state))
        .route("/api/v1/running/toggle",         post(post_toggle_running))
        .route("/api/v1/stations/{id}/enabled",  put(put_station_enabled))
        .route("/api/v1/stations/{id}/counters", put(put_station_counters))
        .route("/api/v1/settings",               put(put_settings))
        .route("/api/v1/timer",                  put(put_timer).delete(delete_timer))
        .route("/api/v1/edit-context",           put(put_edit_context))
        .route("/api/v1/connection/retry",       post(post_retry))
        .route("/api/v1/events",                 get(crate::sse::monitor_sse))
        .with_state(state)
}

fn error_response(e: &CommandError) -> Response {
    let status = match e {
        CommandError::Validation(_) => StatusCode::BAD_REQUEST,
        CommandError::UnknownStation(_) => StatusCode::NOT_FOUND,
        CommandError::MachineDisabled | CommandError::SettingsNotLoaded => StatusCode::CONFLICT,
        CommandError::Remote(_) => StatusCode::BAD_GATEWAY,
    };
    (status, e.to_string()).into_response()
}

async fn settle(command: Result<CommandFuture, CommandError>) -> Response {
    let result = match command {
        Ok(fut) => fut.await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

fn station_id(raw: u8) -> Result<StationId, CommandError> {
    StationId::new(raw).ok_or(CommandError::UnknownStation(raw))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let monitor = &state.monitor;
    let view = monitor.store().view();
    Json(StateResponse {
        connection: monitor.connection_state(),
        system: view.system,
        settings: view.settings,
        pending: view.pending,
        edit_context: view.edit_context,
        countdown: monitor.countdown(),
    })
}

async fn post_toggle_running(State(state): State<Arc<AppState>>) -> Response {
    settle(state.monitor.gateway().toggle_running()).await
}

async fn put_station_enabled(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u8>,
    Json(body): Json<EnabledBody>,
) -> Response {
    let command = station_id(id).map(|id| state.monitor.gateway().set_station_state(id, body.enabled));
    settle(command).await
}

async fn put_station_counters(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u8>,
    Json(body): Json<StationCounters>,
) -> Response {
    let command =
        station_id(id).map(|id| state.monitor.gateway().update_station_settings(id, body));
    settle(command).await
}

async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<SettingsPatch>,
) -> Response {
    settle(state.monitor.gateway().save_settings(patch)).await
}

async fn put_timer(State(state): State<Arc<AppState>>, Json(body): Json<TimerBody>) -> Response {
    settle(state.monitor.gateway().set_timer(body.hours, body.minutes)).await
}

async fn delete_timer(State(state): State<Arc<AppState>>) -> Response {
    settle(state.monitor.gateway().clear_timer()).await
}

async fn put_edit_context(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EditContextBody>,
) -> impl IntoResponse {
    state.monitor.store().set_edit_context(body.context);
    StatusCode::NO_CONTENT
}

async fn post_retry(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.monitor.connection().manual_retry();
    StatusCode::ACCEPTED
}
