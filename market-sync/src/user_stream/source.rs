//! User stream data sources

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use super::{AuthenticatedConnection, UserStreamClient, UserStreamSink};
use crate::error::{Result, SyncError};

/// Maximum backoff delay in milliseconds (60 seconds)
const MAX_BACKOFF_MS: u64 = 60_000;
/// Cooldown period after which reconnect attempts are reset (5 minutes)
const RECONNECT_COOLDOWN_SECS: u64 = 300;
/// Idle time before a keepalive ping is sent
const KEEPALIVE_AFTER: Duration = Duration::from_secs(30);
/// Silence that marks the connection as stale
const RECV_TIMEOUT: Duration = Duration::from_secs(45);

/// One variant per transport
#[derive(Debug, Clone)]
pub enum UserStreamDataSource {
    WebSocket(WebSocketUserStream),
    Channel(ChannelUserStream),
}

impl UserStreamDataSource {
    /// Feed `sink` until the source is exhausted or the sink is closed
    pub async fn listen(&self, sink: UserStreamSink) -> Result<()> {
        match self {
            UserStreamDataSource::WebSocket(source) => source.listen(&sink).await,
            UserStreamDataSource::Channel(source) => source.listen(&sink).await,
        }
    }

    pub fn transport(&self) -> &'static str {
        match self {
            UserStreamDataSource::WebSocket(_) => "websocket",
            UserStreamDataSource::Channel(_) => "channel",
        }
    }
}

/// Authenticated WebSocket stream with automatic reconnection
#[derive(Debug, Clone)]
pub struct WebSocketUserStream {
    connection: AuthenticatedConnection,
    reconnect_delay: Duration,
}

impl WebSocketUserStream {
    pub fn new(connection: AuthenticatedConnection, reconnect_delay: Duration) -> Self {
        Self {
            connection,
            reconnect_delay,
        }
    }

    /// Runs until the sink is closed, reconnecting with capped exponential backoff
    async fn listen(&self, sink: &UserStreamSink) -> Result<()> {
        let mut client = UserStreamClient::new(self.connection.clone());
        let mut reconnect_attempts: u32 = 0;
        let mut last_successful_connection: Option<Instant> = None;

        loop {
            // Reset reconnect attempts if we've been stable for a while
            if let Some(last_success) = last_successful_connection {
                if last_success.elapsed() > Duration::from_secs(RECONNECT_COOLDOWN_SECS)
                    && reconnect_attempts > 0
                {
                    info!(
                        previous_attempts = reconnect_attempts,
                        "Resetting reconnect counter after cooldown period"
                    );
                    reconnect_attempts = 0;
                }
            }

            let result = self
                .connect_and_stream(&mut client, sink, &mut last_successful_connection)
                .await;
            client.close().await;

            match result {
                Ok(()) => {
                    info!("User stream completed normally, reconnecting...");
                    sleep(Duration::from_secs(1)).await;
                }
                Err(e @ SyncError::ChannelClosed(_)) | Err(e @ SyncError::Cancelled) => return Err(e),
                Err(e) => {
                    error!(error = %e, "User stream error");
                    reconnect_attempts += 1;

                    let delay = backoff_delay(self.reconnect_delay, reconnect_attempts);
                    warn!(
                        attempt = reconnect_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Reconnecting user stream after error..."
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    async fn connect_and_stream(
        &self,
        client: &mut UserStreamClient,
        sink: &UserStreamSink,
        last_successful_connection: &mut Option<Instant>,
    ) -> Result<()> {
        client.connect().await?;
        *last_successful_connection = Some(Instant::now());

        let mut last_message = Instant::now();
        loop {
            match timeout(RECV_TIMEOUT, client.recv()).await {
                Ok(Ok(Some(text))) => {
                    last_message = Instant::now();
                    match serde_json::from_str::<Value>(&text) {
                        Ok(payload) => sink.send(payload)?,
                        Err(e) => warn!(error = %e, "Dropping malformed user stream frame"),
                    }
                }
                Ok(Ok(None)) => {
                    if last_message.elapsed() > KEEPALIVE_AFTER {
                        if let Err(e) = client.ping().await {
                            warn!(error = %e, "Failed to send keepalive ping");
                        }
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(
                        last_message_secs = last_message.elapsed().as_secs(),
                        "No user stream message within timeout, sending keepalive"
                    );
                    if let Err(e) = client.ping().await {
                        warn!(error = %e, "Failed to send keepalive ping, reconnecting");
                        return Err(SyncError::ConnectionTimeout);
                    }
                }
            }
        }
    }
}

/// Exponential backoff from `base`, capped at [`MAX_BACKOFF_MS`]
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let delay = base_ms.saturating_mul(2u64.pow(attempt.min(6)));
    Duration::from_millis(delay.min(MAX_BACKOFF_MS))
}

/// In-process user stream fed through a [`UserStreamFeed`]
#[derive(Debug, Clone)]
pub struct ChannelUserStream {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Value>>>,
}

/// Producer side of a [`ChannelUserStream`]
#[derive(Debug, Clone)]
pub struct UserStreamFeed {
    tx: mpsc::UnboundedSender<Value>,
}

impl ChannelUserStream {
    pub fn new() -> (Self, UserStreamFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx: Arc::new(Mutex::new(rx)),
            },
            UserStreamFeed { tx },
        )
    }

    async fn listen(&self, sink: &UserStreamSink) -> Result<()> {
        let mut rx = self.rx.lock().await;
        while let Some(payload) = rx.recv().await {
            sink.send(payload)?;
        }
        Ok(())
    }
}

impl UserStreamFeed {
    pub fn send(&self, payload: Value) -> Result<()> {
        self.tx
            .send(payload)
            .map_err(|_| SyncError::ChannelClosed("user stream feed".to_string()))
    }
}
