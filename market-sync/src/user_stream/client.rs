//! WebSocket client for authenticated user streams
//!
//! Handles connection, subscription, and frame reception.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use super::AuthenticatedConnection;
use crate::error::{Result, SyncError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client for a single user stream connection
pub struct UserStreamClient {
    stream: Option<WsStream>,
    connection: AuthenticatedConnection,
}

impl UserStreamClient {
    /// Create a new client. Nothing connects until [`connect`](Self::connect).
    pub fn new(connection: AuthenticatedConnection) -> Self {
        Self {
            stream: None,
            connection,
        }
    }

    /// Connect and send the subscription payload, if any
    pub async fn connect(&mut self) -> Result<()> {
        info!(url = %self.connection.url, "Connecting to user stream");

        let (mut ws_stream, response) = connect_async(self.connection.url.as_str())
            .await
            .map_err(|e| SyncError::WebSocket(format!("Failed to connect: {}", e)))?;
        info!(status = ?response.status(), "User stream connected");

        if let Some(subscribe) = &self.connection.subscribe_message {
            ws_stream.send(Message::Text(subscribe.to_string())).await?;
            debug!("Subscription sent");
        }

        self.stream = Some(ws_stream);
        Ok(())
    }

    /// Receive the next data frame. Control frames yield `Ok(None)`.
    pub async fn recv(&mut self) -> Result<Option<String>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SyncError::WebSocket("Not connected".to_string()))?;

        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                debug!(len = text.len(), "Received text frame");
                Ok(Some(text))
            }
            Some(Ok(Message::Binary(data))) => Ok(Some(String::from_utf8_lossy(&data).into_owned())),
            Some(Ok(Message::Ping(data))) => {
                debug!("Received ping, sending pong");
                if let Err(e) = stream.send(Message::Pong(data)).await {
                    warn!(error = %e, "Failed to answer ping");
                }
                Ok(None)
            }
            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => Ok(None),
            Some(Ok(Message::Close(frame))) => {
                warn!(frame = ?frame, "Received close frame");
                self.stream = None;
                Err(SyncError::WebSocket("Connection closed".to_string()))
            }
            Some(Err(e)) => {
                error!(error = %e, "User stream error");
                self.stream = None;
                Err(e.into())
            }
            None => {
                warn!("User stream ended");
                self.stream = None;
                Err(SyncError::WebSocket("Stream ended".to_string()))
            }
        }
    }

    /// Send a ping to keep the connection alive
    pub async fn ping(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            stream.send(Message::Ping(Vec::new())).await?;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Close the connection
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}
