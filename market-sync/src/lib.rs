//! Market Sync - order book synchronization and API admission control
//!
//! Reconstructs a consistent order book per trading pair from unordered snapshot
//! and diff feeds, manages private user-stream listeners, and keeps outbound
//! requests within each exchange's published rate limits.

pub mod config;
pub mod data_source;
pub mod error;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod orderbook;
pub mod parser;
pub mod throttler;
pub mod tracker;
pub mod user_stream;

pub use config::Config;
pub use data_source::{ChannelDataSource, DataSourceKind, MessageFeed, OrderBookDataSource, RestSnapshotSource};
pub use error::{ErrorKind, Result, SyncError};
pub use message::{BookContent, OrderBookMessage, OrderBookMessageType};
pub use orderbook::{OrderBook, OrderBookMetrics, OrderBookReader, OrderBookState, OrderBookView};
pub use parser::parse_message;
pub use throttler::{AsyncThrottler, RateLimit, ThrottlerConfig};
pub use tracker::{OrderBookTracker, TrackerConfig};
pub use user_stream::{AuthenticatedConnection, UserStreamDataSource, UserStreamEvent, UserStreamTracker};
