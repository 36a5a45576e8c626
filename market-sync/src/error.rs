//! Error types for market data synchronization and admission control

use thiserror::Error;

/// How a failure is handled by the component that observes it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Logged with an advisory, retried after a fixed backoff, never fatal
    Transient,
    /// Raised at construction time, never retried
    Configuration,
    /// Malformed inbound message, rejected before any book mutation
    Protocol,
    /// Cooperative shutdown, always propagated
    Cancelled,
}

/// Synchronization errors
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("WebSocket connection error: {0}")]
    WebSocket(String),

    #[error("REST API error: {0}")]
    RestApi(String),

    #[error("Failed to parse message: {0}")]
    Parse(String),

    #[error("Order book error: {0}")]
    OrderBook(String),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Data source type {0} is not supported")]
    UnsupportedDataSource(String),

    #[error("Missing required argument: {0}")]
    MissingArgument(&'static str),

    #[error("Invalid rate limit for {path}: {reason}")]
    InvalidRateLimit { path: String, reason: String },

    #[error("Snapshot message for {0} has no explicit timestamp")]
    MissingTimestamp(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl SyncError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::WebSocket(_)
            | SyncError::RestApi(_)
            | SyncError::Parse(_)
            | SyncError::OrderBook(_)
            | SyncError::ConnectionTimeout
            | SyncError::ChannelClosed(_) => ErrorKind::Transient,
            SyncError::Config(_)
            | SyncError::UnsupportedDataSource(_)
            | SyncError::MissingArgument(_)
            | SyncError::InvalidRateLimit { .. } => ErrorKind::Configuration,
            SyncError::MissingTimestamp(_) | SyncError::InvalidMessage(_) => ErrorKind::Protocol,
            SyncError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::WebSocket(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::RestApi(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
