//! Message dispatcher: routes push-channel envelopes to handlers by type.
//!
//! Handlers for one type run in registration order. A handler error or
//! panic is logged and does not stop delivery to the handlers after it, nor
//! unwind into the session reading the push channel. Frames that are not a
//! valid `{type, data}` envelope are logged and dropped.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde::de::DeserializeOwned;
use sw_protocol::Envelope;
use tracing::{debug, error, warn};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("handler: {0}")]
    Handler(String),
}

type Handler = Arc<dyn Fn(&serde_json::Value) -> Result<(), DispatchError> + Send + Sync>;
type HandlerTable = HashMap<String, Vec<(u64, Handler)>>;

#[derive(Clone, Default)]
pub struct MessageDispatcher {
    handlers: Arc<RwLock<HandlerTable>>,
    next_id: Arc<AtomicU64>,
    delivered_frames: Arc<AtomicU64>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `message_type`. The handler stays registered
    /// until [`Unsubscribe::unsubscribe`] is called.
    pub fn subscribe<F>(&self, message_type: &str, handler: F) -> Unsubscribe
    where
        F: Fn(&serde_json::Value) -> Result<(), DispatchError> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(message_type.to_owned())
            .or_default()
            .push((id, Arc::new(handler)));
        Unsubscribe {
            handlers: Arc::downgrade(&self.handlers),
            message_type: message_type.to_owned(),
            id,
        }
    }

    /// Register a handler that receives `data` already decoded as `T`.
    pub fn subscribe_typed<T, F>(&self, message_type: &str, handler: F) -> Unsubscribe
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> Result<(), DispatchError> + Send + Sync + 'static,
    {
        self.subscribe(message_type, move |data| {
            let decoded: T = serde_json::from_value(data.clone())?;
            handler(decoded)
        })
    }

    /// Parse one raw frame and deliver it. Returns how many handlers ran
    /// without error.
    pub fn dispatch(&self, raw: &str) -> usize {
        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, len = raw.len(), "dropping malformed push message");
                return 0;
            }
        };

        let handlers: Vec<Handler> = match self
            .handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&envelope.kind)
        {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => {
                debug!(kind = %envelope.kind, "no handler for message type");
                return 0;
            }
        };

        self.delivered_frames.fetch_add(1, Ordering::Relaxed);
        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&envelope.data))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(kind = %envelope.kind, error = %e, "message handler failed"),
                Err(_) => error!(kind = %envelope.kind, "message handler panicked"),
            }
        }
        delivered
    }

    /// Frames that have reached at least one handler so far.
    pub fn delivered_frames(&self) -> u64 {
        self.delivered_frames.load(Ordering::Relaxed)
    }

    pub fn handler_count(&self, message_type: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(message_type)
            .map_or(0, Vec::len)
    }
}

/// Removes one handler registration when consumed.
pub struct Unsubscribe {
    handlers: Weak<RwLock<HandlerTable>>,
    message_type: String,
    id: u64,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        let Some(handlers) = self.handlers.upgrade() else {
            return;
        };
        let mut table = handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(list) = table.get_mut(&self.message_type) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                table.remove(&self.message_type);
            }
        }
    }
}
