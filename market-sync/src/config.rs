//! Configuration for the synchronization service

use std::env;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::data_source::DataSourceKind;
use crate::error::{Result, SyncError};
use crate::logging::LogFormat;
use crate::throttler::{RateLimit, ThrottlerConfig, DEFAULT_RETRY_INTERVAL, DEFAULT_SAFETY_MARGIN};
use crate::tracker::{TrackerConfig, PAST_DIFF_WINDOW_SIZE, SAVED_MESSAGE_CAPACITY};

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Exchange label used in logs and metrics
    pub exchange_name: String,

    /// Trading pairs to track (e.g., ["BTC-USDT", "ETH-USDT"])
    pub trading_pairs: Vec<String>,

    /// Where order book messages come from
    pub data_source: DataSourceKind,

    /// REST endpoint serving normalized snapshots
    pub rest_endpoint: String,
    pub snapshot_poll_interval_ms: u64,

    /// Authenticated user stream; disabled when unset
    pub user_stream_url: Option<String>,
    pub user_stream_subscribe: Option<String>,

    /// Outbound rate limits
    pub rate_limits: Vec<RateLimit>,
    pub safety_margin_ms: u64,
    pub retry_interval_ms: u64,
    pub limits_share_pct: Option<Decimal>,

    /// Synchronizer settings
    pub past_diff_window_size: usize,
    pub error_backoff_secs: u64,

    /// Reconnection settings
    pub reconnect_delay_ms: u64,

    /// Health check server port
    pub health_port: u16,

    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let trading_pairs = parse_list(
            &env::var("TRADING_PAIRS").unwrap_or_else(|_| defaults.trading_pairs.join(",")),
        );
        if trading_pairs.is_empty() {
            return Err(SyncError::MissingArgument("trading_pairs"));
        }

        let rate_limits = match env::var("RATE_LIMITS") {
            Ok(value) => parse_rate_limits(&value)?,
            Err(_) => defaults.rate_limits,
        };

        let limits_share_pct = env::var("RATE_LIMITS_SHARE_PCT")
            .ok()
            .map(|value| {
                Decimal::from_str(value.trim()).map_err(|e| {
                    SyncError::Config(format!("invalid RATE_LIMITS_SHARE_PCT {}: {}", value, e))
                })
            })
            .transpose()?;

        Ok(Self {
            exchange_name: env::var("EXCHANGE_NAME").unwrap_or(defaults.exchange_name),
            trading_pairs,
            data_source: env::var("DATA_SOURCE")
                .unwrap_or_else(|_| "channel".to_string())
                .parse()?,
            rest_endpoint: env::var("REST_ENDPOINT").unwrap_or(defaults.rest_endpoint),
            snapshot_poll_interval_ms: env_or("SNAPSHOT_POLL_INTERVAL_MS", defaults.snapshot_poll_interval_ms),
            user_stream_url: env::var("USER_STREAM_URL").ok().filter(|url| !url.trim().is_empty()),
            user_stream_subscribe: env::var("USER_STREAM_SUBSCRIBE").ok(),
            rate_limits,
            safety_margin_ms: env_or("SAFETY_MARGIN_MS", defaults.safety_margin_ms),
            retry_interval_ms: env_or("RETRY_INTERVAL_MS", defaults.retry_interval_ms),
            limits_share_pct,
            past_diff_window_size: env_or("PAST_DIFF_WINDOW_SIZE", defaults.past_diff_window_size),
            error_backoff_secs: env_or("ERROR_BACKOFF_SECS", defaults.error_backoff_secs),
            reconnect_delay_ms: env_or("RECONNECT_DELAY_MS", defaults.reconnect_delay_ms),
            health_port: env_or("HEALTH_PORT", defaults.health_port),
            log_format: env::var("LOG_FORMAT")
                .map(|value| LogFormat::parse(&value))
                .unwrap_or(defaults.log_format),
        })
    }

    pub fn throttler_config(&self) -> ThrottlerConfig {
        ThrottlerConfig {
            rate_limits: self.rate_limits.clone(),
            safety_margin: Duration::from_millis(self.safety_margin_ms),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            limits_share_pct: self.limits_share_pct,
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            past_diff_window_size: self.past_diff_window_size,
            saved_message_capacity: SAVED_MESSAGE_CAPACITY,
            error_backoff: Duration::from_secs(self.error_backoff_secs),
            ..TrackerConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange_name: "exchange".to_string(),
            trading_pairs: vec!["BTC-USDT".to_string()],
            data_source: DataSourceKind::Channel,
            rest_endpoint: "http://127.0.0.1:8080".to_string(),
            snapshot_poll_interval_ms: 30_000,
            user_stream_url: None,
            user_stream_subscribe: None,
            rate_limits: Vec::new(),
            safety_margin_ms: DEFAULT_SAFETY_MARGIN.as_millis() as u64,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL.as_millis() as u64,
            limits_share_pct: None,
            past_diff_window_size: PAST_DIFF_WINDOW_SIZE,
            error_backoff_secs: 5,
            reconnect_delay_ms: 1000,
            health_port: 9090,
            log_format: LogFormat::Json,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `path:limit:window_secs[:weight]` entries separated by commas
pub fn parse_rate_limits(value: &str) -> Result<Vec<RateLimit>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_rate_limit)
        .collect()
}

fn parse_rate_limit(entry: &str) -> Result<RateLimit> {
    let invalid = |reason: &str| SyncError::InvalidRateLimit {
        path: entry.to_string(),
        reason: reason.to_string(),
    };

    let fields: Vec<&str> = entry.split(':').map(str::trim).collect();
    if !(3..=4).contains(&fields.len()) || fields[0].is_empty() {
        return Err(invalid("expected path:limit:window[:weight]"));
    }

    let limit: u32 = fields[1].parse().map_err(|_| invalid("limit is not an integer"))?;
    let window: f64 = fields[2].parse().map_err(|_| invalid("window is not a number"))?;
    if !window.is_finite() || window <= 0.0 {
        return Err(invalid("window must be positive"));
    }

    let mut rate_limit = RateLimit::new(fields[0], limit, Duration::from_secs_f64(window));
    if let Some(weight) = fields.get(3) {
        rate_limit = rate_limit.with_weight(weight.parse().map_err(|_| invalid("weight is not an integer"))?);
    }
    Ok(rate_limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rate_limits() {
        let limits = parse_rate_limits("/orders:2:1.0, /snapshot:10:60:2").unwrap();
        assert_eq!(limits.len(), 2);
        assert_eq!(limits[0].path, "/orders");
        assert_eq!(limits[0].limit, 2);
        assert_eq!(limits[0].window, Duration::from_secs(1));
        assert_eq!(limits[0].weight, 1);
        assert_eq!(limits[1].weight, 2);
        assert_eq!(limits[1].window, Duration::from_secs(60));
    }

    #[test]
    fn test_parse_rate_limits_rejects_garbage() {
        assert!(matches!(
            parse_rate_limits("/orders:two:1"),
            Err(SyncError::InvalidRateLimit { .. })
        ));
        assert!(matches!(
            parse_rate_limits("/orders:2:-1"),
            Err(SyncError::InvalidRateLimit { .. })
        ));
        assert!(matches!(parse_rate_limits("/orders"), Err(SyncError::InvalidRateLimit { .. })));
        assert!(parse_rate_limits("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_list_normalizes() {
        assert_eq!(parse_list(" btc-usdt, ,eth-usdt "), vec!["BTC-USDT", "ETH-USDT"]);
    }

    #[test]
    fn test_derived_configs() {
        let config = Config {
            safety_margin_ms: 250,
            error_backoff_secs: 7,
            ..Config::default()
        };
        assert_eq!(config.throttler_config().safety_margin, Duration::from_millis(250));
        assert_eq!(config.tracker_config().error_backoff, Duration::from_secs(7));
        assert_eq!(config.tracker_config().past_diff_window_size, PAST_DIFF_WINDOW_SIZE);
    }
}
