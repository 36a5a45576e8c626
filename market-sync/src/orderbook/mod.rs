//! Order book module
//!
//! Per-pair price ladders, the order-id tracker that feeds them, and the registry
//! that hands out read-only views to strategy consumers.

mod active_orders;
mod book;
mod manager;
mod metrics;

pub use active_orders::{ActiveOrder, ActiveOrderTracker};
pub use book::OrderBook;
pub use manager::{OrderBookReader, OrderBookRegistry, OrderBookView};
pub use metrics::OrderBookMetrics;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    #[serde(alias = "buy", alias = "BUY")]
    Bid,
    #[serde(alias = "sell", alias = "SELL")]
    Ask,
}

/// A price level delta: the new aggregate amount at `price` as of `update_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookRow {
    pub price: Decimal,
    pub amount: Decimal,
    pub update_id: u64,
}

/// A single level in the published book state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Level {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Order book state handed to consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookState {
    pub trading_pair: String,
    pub snapshot_uid: u64,
    pub last_update_id: u64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub metrics: OrderBookMetrics,
}
