//! Request/response client for the rig control service.
//!
//! Routes (relative to the configured base URL):
//!   GET  /settings                 - read system settings
//!   PUT  /settings                 - replace system settings
//!   GET  /status                   - read a full status snapshot
//!   POST /system/start             - start the test cycle
//!   POST /system/stop              - stop the test cycle
//!   PUT  /stations/{id}/state      - enable/disable one station
//!   PUT  /stations/{id}/settings   - overwrite one station's counters
//!   POST /system/timer             - set (or with 0h0m, clear) the countdown

use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use serde::de::DeserializeOwned;
use sw_protocol::{
    ErrorResponse, StationCountersUpdate, StationStateUpdate, StatusUpdate, SuccessResponse,
    SystemSettings, TimerSettings,
};
use tracing::debug;

use crate::model::StationId;

pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("rejected with status {status}{}", .detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    Rejected { status: u16, detail: Option<String> },
    #[error("service reported failure")]
    Unsuccessful,
    #[error("decode: {0}")]
    Decode(String),
}

impl ApiError {
    /// Human-readable detail from the service, when it sent one.
    pub fn detail(&self) -> Option<&str> {
        match self {
            ApiError::Rejected { detail, .. } => detail.as_deref(),
            _ => None,
        }
    }
}

/// The remote calls the monitor issues. Every mutating call resolves to
/// `Ok(())` only when the service acknowledged it with `success: true`.
pub trait ControlApi: Send + Sync {
    fn get_settings(&self) -> ApiFuture<'_, SystemSettings>;
    fn update_settings<'a>(&'a self, settings: &'a SystemSettings) -> ApiFuture<'a, ()>;
    fn get_status(&self) -> ApiFuture<'_, StatusUpdate>;
    fn start_test(&self) -> ApiFuture<'_, ()>;
    fn stop_test(&self) -> ApiFuture<'_, ()>;
    fn set_station_enabled(&self, id: StationId, enabled: bool) -> ApiFuture<'_, ()>;
    fn update_station_counters(
        &self,
        id: StationId,
        counters: StationCountersUpdate,
    ) -> ApiFuture<'_, ()>;
    fn set_timer(&self, timer: TimerSettings) -> ApiFuture<'_, ()>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// `ControlApi` over HTTP/JSON.
#[derive(Debug, Clone)]
pub struct HttpControlApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpControlApi {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn fetch<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        debug!(path, "GET");
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        decode(resp).await
    }

    async fn command<B: Serialize + ?Sized>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<(), ApiError> {
        debug!(%method, path, "command");
        let mut req = self.client.request(method, self.url(path));
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let ack: SuccessResponse = decode(resp).await?;
        if ack.success {
            Ok(())
        } else {
            Err(ApiError::Unsuccessful)
        }
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ApiError> {
    let status = resp.status();
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| ApiError::Transport(e.to_string()))?;
    if !status.is_success() {
        let detail = serde_json::from_slice::<ErrorResponse>(&bytes)
            .ok()
            .and_then(|e| e.detail);
        return Err(ApiError::Rejected {
            status: status.as_u16(),
            detail,
        });
    }
    serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
}

impl ControlApi for HttpControlApi {
    fn get_settings(&self) -> ApiFuture<'_, SystemSettings> {
        Box::pin(self.fetch("/settings"))
    }

    fn update_settings<'a>(&'a self, settings: &'a SystemSettings) -> ApiFuture<'a, ()> {
        Box::pin(self.command(reqwest::Method::PUT, "/settings", Some(settings)))
    }

    fn get_status(&self) -> ApiFuture<'_, StatusUpdate> {
        Box::pin(self.fetch("/status"))
    }

    fn start_test(&self) -> ApiFuture<'_, ()> {
        Box::pin(self.command::<()>(reqwest::Method::POST, "/system/start", None))
    }

    fn stop_test(&self) -> ApiFuture<'_, ()> {
        Box::pin(self.command::<()>(reqwest::Method::POST, "/system/stop", None))
    }

    fn set_station_enabled(&self, id: StationId, enabled: bool) -> ApiFuture<'_, ()> {
        Box::pin(async move {
            self.command(
                reqwest::Method::PUT,
                &format!("/stations/{id}/state"),
                Some(&StationStateUpdate { enabled }),
            )
            .await
        })
    }

    fn update_station_counters(
        &self,
        id: StationId,
        counters: StationCountersUpdate,
    ) -> ApiFuture<'_, ()> {
        Box::pin(async move {
            self.command(
                reqwest::Method::PUT,
                &format!("/stations/{id}/settings"),
                Some(&counters),
            )
            .await
        })
    }

    fn set_timer(&self, timer: TimerSettings) -> ApiFuture<'_, ()> {
        Box::pin(async move {
            self.command(reqwest::Method::POST, "/system/timer", Some(&timer))
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let api = HttpControlApi::new("http://rig.local:8000/").unwrap();
        assert_eq!(api.base_url(), "http://rig.local:8000");
        assert_eq!(api.url("/status"), "http://rig.local:8000/status");
    }

    #[test]
    fn rejected_error_includes_detail_when_present() {
        let with = ApiError::Rejected {
            status: 400,
            detail: Some("Invalid station number".to_owned()),
        };
        assert_eq!(with.to_string(), "rejected with status 400: Invalid station number");
        assert_eq!(with.detail(), Some("Invalid station number"));

        let without = ApiError::Rejected {
            status: 502,
            detail: None,
        };
        assert_eq!(without.to_string(), "rejected with status 502");
        assert_eq!(without.detail(), None);
    }
}
