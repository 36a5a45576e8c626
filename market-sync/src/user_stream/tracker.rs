//! User stream lifecycle

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{UserStreamDataSource, UserStreamEvent, UserStreamSink};
use crate::error::SyncError;
use crate::metrics;

/// Owns the single listener task of one exchange connection and its output queue
pub struct UserStreamTracker {
    exchange_name: String,
    data_source: Arc<UserStreamDataSource>,
    sink: UserStreamSink,
    events: mpsc::UnboundedReceiver<UserStreamEvent>,
    task: Option<JoinHandle<()>>,
}

impl UserStreamTracker {
    pub fn new(exchange_name: &str, data_source: UserStreamDataSource) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        Self {
            exchange_name: exchange_name.to_string(),
            data_source: Arc::new(data_source),
            sink: UserStreamSink::new(tx),
            events,
            task: None,
        }
    }

    /// Launch the listener, replacing any running one
    pub fn start(&mut self) {
        if let Some(previous) = self.task.take() {
            previous.abort();
        }

        let data_source = self.data_source.clone();
        let sink = self.sink.clone();
        let exchange_name = self.exchange_name.clone();
        self.task = Some(tokio::spawn(async move {
            match data_source.listen(sink).await {
                Ok(()) => info!(exchange = %exchange_name, "User stream finished"),
                Err(SyncError::Cancelled) => {}
                Err(e) => warn!(exchange = %exchange_name, error = %e, "User stream listener exited"),
            }
        }));

        metrics::global()
            .user_stream_restarts
            .with_label_values(&[&self.exchange_name])
            .inc();
        info!(
            exchange = %self.exchange_name,
            transport = self.data_source.transport(),
            "User stream started"
        );
    }

    /// Cancel the listener. Queued events stay readable.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!(exchange = %self.exchange_name, "User stream stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map_or(false, |task| !task.is_finished())
    }

    /// Wait for the next event
    pub async fn next_event(&mut self) -> Option<UserStreamEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<UserStreamEvent> {
        self.events.try_recv().ok()
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    /// Receive time of the most recent event
    pub fn last_recv_time(&self) -> Option<DateTime<Utc>> {
        self.sink.last_recv_time()
    }
}

impl Drop for UserStreamTracker {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
