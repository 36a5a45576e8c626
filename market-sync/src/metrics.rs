//! Prometheus counters

use std::sync::OnceLock;

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Process-wide counters
pub struct Metrics {
    registry: Registry,
    pub diffs_applied: IntCounterVec,
    pub snapshots_applied: IntCounterVec,
    pub messages_rejected: IntCounterVec,
    pub throttle_admissions: IntCounterVec,
    pub throttle_waits: IntCounterVec,
    pub network_faults: IntCounterVec,
    pub user_stream_restarts: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Shared metrics, registered on first use
pub fn global() -> &'static Metrics {
    METRICS.get_or_init(|| Metrics::new().expect("metric definitions are static and valid"))
}

impl Metrics {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str, labels: &[&str]| -> prometheus::Result<IntCounterVec> {
            let vec = IntCounterVec::new(Opts::new(name, help).namespace("market_sync"), labels)?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };

        Ok(Self {
            diffs_applied: counter(
                "orderbook_diffs_applied_total",
                "Diff messages applied to order books",
                &["exchange", "trading_pair"],
            )?,
            snapshots_applied: counter(
                "orderbook_snapshots_applied_total",
                "Snapshot messages applied to order books",
                &["exchange", "trading_pair"],
            )?,
            messages_rejected: counter(
                "orderbook_messages_rejected_total",
                "Order book messages dropped as stale or untracked",
                &["exchange", "reason"],
            )?,
            throttle_admissions: counter(
                "throttler_admissions_total",
                "Requests admitted by the throttler",
                &["path"],
            )?,
            throttle_waits: counter(
                "throttler_waits_total",
                "Requests that had to wait for rate limit capacity",
                &["path"],
            )?,
            network_faults: counter(
                "network_faults_total",
                "Recoverable network faults",
                &["component"],
            )?,
            user_stream_restarts: counter(
                "user_stream_restarts_total",
                "User stream listener (re)starts",
                &["exchange"],
            )?,
            registry,
        })
    }

    /// Text exposition of every counter
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        global()
            .throttle_admissions
            .with_label_values(&["/metrics-test"])
            .inc();
        let text = global().render().unwrap();
        assert!(text.contains("market_sync_throttler_admissions_total"));
        assert!(text.contains("/metrics-test"));
    }
}
