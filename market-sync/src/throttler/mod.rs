//! Outbound request admission control
//!
//! Sliding-window rate limits keyed by endpoint path. Callers await
//! [`AsyncThrottler::acquire`] before each request.

mod async_throttler;

pub use async_throttler::{Admission, AsyncThrottler};

use std::time::Duration;

use rust_decimal::Decimal;
use tokio::time::Instant;

/// Default poll interval while a caller waits for capacity
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
/// Default margin added to every window to absorb clock skew with the exchange
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_millis(100);

/// A pool that a path's requests also count against, with the weight they carry there
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedLimit {
    pub limit_id: String,
    pub weight: u32,
}

/// Published limit for one endpoint path or request pool
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimit {
    pub path: String,
    /// Total weight admitted per window
    pub limit: u32,
    pub window: Duration,
    /// Weight of one request against this limit
    pub weight: u32,
    /// Overrides the throttler-wide safety margin
    pub safety_margin: Option<Duration>,
    pub linked_limits: Vec<LinkedLimit>,
}

impl RateLimit {
    pub fn new(path: &str, limit: u32, window: Duration) -> Self {
        Self {
            path: path.to_string(),
            limit,
            window,
            weight: 1,
            safety_margin: None,
            linked_limits: Vec::new(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin = Some(margin);
        self
    }

    pub fn with_linked_limit(mut self, limit_id: &str, weight: u32) -> Self {
        self.linked_limits.push(LinkedLimit {
            limit_id: limit_id.to_string(),
            weight,
        });
        self
    }
}

/// One admitted request, kept while inside its limit's window
#[derive(Debug, Clone)]
pub struct TaskLog {
    pub timestamp: Instant,
    pub limit_id: String,
    pub weight: u32,
}

/// Throttler settings
#[derive(Debug, Clone)]
pub struct ThrottlerConfig {
    pub rate_limits: Vec<RateLimit>,
    pub safety_margin: Duration,
    pub retry_interval: Duration,
    /// Share of each published limit this client may use, in percent
    pub limits_share_pct: Option<Decimal>,
}

impl ThrottlerConfig {
    pub fn new(rate_limits: Vec<RateLimit>) -> Self {
        Self {
            rate_limits,
            ..Self::default()
        }
    }
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            rate_limits: Vec::new(),
            safety_margin: DEFAULT_SAFETY_MARGIN,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            limits_share_pct: None,
        }
    }
}
