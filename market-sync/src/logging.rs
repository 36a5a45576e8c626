//! Logging setup and network fault advisories
//!
//! Components log under their module path as the tracing target, so per-component
//! verbosity is set once at startup through `RUST_LOG` directives such as
//! `market_sync::throttler=debug`. Recoverable network faults are logged and also
//! published as [`Advisory`] notices for user-facing surfaces.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::SyncError;
use crate::metrics;

/// Output format of the global subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "pretty" | "text" => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(format: LogFormat) {
    let filter = EnvFilter::from_default_env().add_directive(Level::INFO.into());
    let result = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
}

/// User-facing notice attached to a recoverable fault
#[derive(Debug, Clone)]
pub struct Advisory {
    pub component: &'static str,
    pub message: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast bus for advisories
#[derive(Debug, Clone)]
pub struct AdvisoryBus {
    tx: broadcast::Sender<Advisory>,
}

impl AdvisoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Advisory> {
        self.tx.subscribe()
    }

    /// Log a recoverable network fault and publish its advisory
    pub fn network_fault(&self, component: &'static str, error: &SyncError, advisory: &str) {
        warn!(
            component,
            error = %error,
            kind = ?error.kind(),
            advisory,
            "Network fault"
        );
        metrics::global().network_faults.with_label_values(&[component]).inc();

        // No subscribers is fine
        let _ = self.tx.send(Advisory {
            component,
            message: advisory.to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
        });
    }
}

impl Default for AdvisoryBus {
    fn default() -> Self {
        Self::new(256)
    }
}
