//! Private user-data streams
//!
//! A [`UserStreamTracker`] owns exactly one listener task per exchange connection.
//! Transports live in [`UserStreamDataSource`], which also owns the reconnect
//! policy.

mod client;
mod source;
mod tracker;

pub use client::UserStreamClient;
pub use source::{ChannelUserStream, UserStreamDataSource, UserStreamFeed, WebSocketUserStream};
pub use tracker::UserStreamTracker;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Result, SyncError};

/// A normalized private event
#[derive(Debug, Clone)]
pub struct UserStreamEvent {
    pub received_at: DateTime<Utc>,
    pub payload: Value,
}

/// Endpoint plus the already-signed subscription payload.
///
/// Produced by the credential layer; this crate never sees the keys.
#[derive(Debug, Clone)]
pub struct AuthenticatedConnection {
    pub url: String,
    pub subscribe_message: Option<Value>,
}

impl AuthenticatedConnection {
    pub fn new(url: &str) -> Result<Self> {
        if url.trim().is_empty() {
            return Err(SyncError::MissingArgument("user_stream_url"));
        }
        Ok(Self {
            url: url.trim().to_string(),
            subscribe_message: None,
        })
    }

    pub fn with_subscribe_message(mut self, message: Value) -> Self {
        self.subscribe_message = Some(message);
        self
    }
}

/// Write side of a tracker's output queue
#[derive(Debug, Clone)]
pub struct UserStreamSink {
    tx: mpsc::UnboundedSender<UserStreamEvent>,
    /// Milliseconds since the epoch, zero before the first event
    last_recv_ms: Arc<AtomicI64>,
}

impl UserStreamSink {
    fn new(tx: mpsc::UnboundedSender<UserStreamEvent>) -> Self {
        Self {
            tx,
            last_recv_ms: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Stamp `payload` with its receive time and queue it
    pub fn send(&self, payload: Value) -> Result<()> {
        let received_at = Utc::now();
        self.last_recv_ms
            .store(received_at.timestamp_millis(), Ordering::Relaxed);
        self.tx
            .send(UserStreamEvent {
                received_at,
                payload,
            })
            .map_err(|_| SyncError::ChannelClosed("user stream output".to_string()))
    }

    pub fn last_recv_time(&self) -> Option<DateTime<Utc>> {
        match self.last_recv_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }
}
