//! Order book message model
//!
//! Every snapshot, diff and trade observed for a trading pair is normalized into an
//! [`OrderBookMessage`]. Messages are totally ordered by timestamp, with ties broken
//! by type priority (snapshot, then diff, then trade), which is what lets the
//! synchronizer locate a snapshot's position inside its buffered diffs.

use std::cmp::Ordering;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::orderbook::{OrderBookRow, Side};

/// Kind of order book message, ordered by replay priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderBookMessageType {
    Snapshot,
    Diff,
    Trade,
}

/// A resting order as listed in an order-level snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEntry {
    pub order_id: String,
    pub price: Decimal,
    pub amount: Decimal,
    pub side: Side,
}

/// Order-level event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderEventKind {
    /// New resting order; `amount` is the remaining size
    Open,
    /// Resting size changed; `amount` is the new size
    Change,
    /// Maker order partially or fully filled; `amount` is the matched size
    Match,
    /// Order left the book
    Done,
}

/// An order-level change carried by a diff message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub kind: OrderEventKind,
    pub order_id: String,
    pub price: Decimal,
    #[serde(default)]
    pub amount: Decimal,
    pub side: Side,
}

/// Price level (price, amount pair)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub amount: Decimal,
}

/// A trade print
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeContent {
    pub trade_id: String,
    pub price: Decimal,
    pub amount: Decimal,
    pub side: Side,
}

/// Exchange payload of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookContent {
    /// Full list of resting orders
    Orders(Vec<OrderEntry>),
    /// Order-level add/change/match/done events
    OrderEvents(Vec<OrderEvent>),
    /// Price-level rows; a zero amount removes the level
    Levels {
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
    },
    Trade(TradeContent),
}

/// Normalized order book message
#[derive(Debug, Clone)]
pub struct OrderBookMessage {
    message_type: OrderBookMessageType,
    timestamp: f64,
    trading_pair: String,
    update_id: u64,
    first_update_id: Option<u64>,
    content: BookContent,
}

impl OrderBookMessage {
    /// Build a snapshot message. The timestamp is mandatory and never inferred.
    pub fn snapshot(
        trading_pair: &str,
        update_id: Option<u64>,
        timestamp: Option<f64>,
        content: BookContent,
    ) -> Result<Self> {
        let timestamp =
            timestamp.ok_or_else(|| SyncError::MissingTimestamp(trading_pair.to_string()))?;
        match content {
            BookContent::Orders(_) | BookContent::Levels { .. } => {}
            _ => {
                return Err(SyncError::InvalidMessage(format!(
                    "snapshot for {} must carry orders or levels",
                    trading_pair
                )))
            }
        }
        Self::build(
            OrderBookMessageType::Snapshot,
            trading_pair,
            update_id,
            None,
            timestamp,
            content,
        )
    }

    /// Build a diff message. A missing timestamp defaults to the receive time.
    pub fn diff(
        trading_pair: &str,
        update_id: Option<u64>,
        timestamp: Option<f64>,
        content: BookContent,
    ) -> Result<Self> {
        Self::diff_range(trading_pair, None, update_id, timestamp, content)
    }

    /// Build a diff message covering the sequence range `first_update_id..=update_id`
    pub fn diff_range(
        trading_pair: &str,
        first_update_id: Option<u64>,
        update_id: Option<u64>,
        timestamp: Option<f64>,
        content: BookContent,
    ) -> Result<Self> {
        match content {
            BookContent::OrderEvents(_) | BookContent::Levels { .. } => {}
            _ => {
                return Err(SyncError::InvalidMessage(format!(
                    "diff for {} must carry order events or levels",
                    trading_pair
                )))
            }
        }
        Self::build(
            OrderBookMessageType::Diff,
            trading_pair,
            update_id,
            first_update_id,
            timestamp.unwrap_or_else(now_seconds),
            content,
        )
    }

    /// Build a trade message. A missing timestamp defaults to the receive time.
    pub fn trade(trading_pair: &str, timestamp: Option<f64>, trade: TradeContent) -> Result<Self> {
        Self::build(
            OrderBookMessageType::Trade,
            trading_pair,
            None,
            None,
            timestamp.unwrap_or_else(now_seconds),
            BookContent::Trade(trade),
        )
    }

    fn build(
        message_type: OrderBookMessageType,
        trading_pair: &str,
        update_id: Option<u64>,
        first_update_id: Option<u64>,
        timestamp: f64,
        content: BookContent,
    ) -> Result<Self> {
        if trading_pair.is_empty() {
            return Err(SyncError::InvalidMessage("empty trading pair".to_string()));
        }
        if !timestamp.is_finite() || timestamp < 0.0 {
            return Err(SyncError::InvalidMessage(format!(
                "invalid timestamp {} for {}",
                timestamp, trading_pair
            )));
        }

        Ok(Self {
            message_type,
            timestamp,
            trading_pair: trading_pair.to_string(),
            update_id: update_id.unwrap_or_else(|| derive_update_id(timestamp)),
            first_update_id,
            content,
        })
    }

    pub fn message_type(&self) -> OrderBookMessageType {
        self.message_type
    }

    /// Timestamp in seconds
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn trading_pair(&self) -> &str {
        &self.trading_pair
    }

    pub fn update_id(&self) -> u64 {
        self.update_id
    }

    /// First sequence number covered by this message, `update_id` when not a range
    pub fn first_update_id(&self) -> u64 {
        self.first_update_id.unwrap_or(self.update_id)
    }

    pub fn content(&self) -> &BookContent {
        &self.content
    }

    /// Bid rows of a price-level payload
    pub fn bids(&self) -> Vec<OrderBookRow> {
        match &self.content {
            BookContent::Levels { bids, .. } => self.rows(bids),
            _ => Vec::new(),
        }
    }

    /// Ask rows of a price-level payload
    pub fn asks(&self) -> Vec<OrderBookRow> {
        match &self.content {
            BookContent::Levels { asks, .. } => self.rows(asks),
            _ => Vec::new(),
        }
    }

    pub fn trade_id(&self) -> Option<&str> {
        match &self.content {
            BookContent::Trade(trade) => Some(&trade.trade_id),
            _ => None,
        }
    }

    fn rows(&self, levels: &[PriceLevel]) -> Vec<OrderBookRow> {
        levels
            .iter()
            .map(|level| OrderBookRow {
                price: level.price,
                amount: level.amount,
                update_id: self.update_id,
            })
            .collect()
    }
}

impl PartialEq for OrderBookMessage {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderBookMessage {}

impl PartialOrd for OrderBookMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderBookMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .total_cmp(&other.timestamp)
            .then(self.message_type.cmp(&other.message_type))
    }
}

/// Sequence number for payloads that carry none: the timestamp in milliseconds
pub fn derive_update_id(timestamp: f64) -> u64 {
    (timestamp * 1000.0).round() as u64
}

/// Current wall clock time in seconds
pub fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn levels() -> BookContent {
        BookContent::Levels {
            bids: vec![PriceLevel {
                price: dec!(100),
                amount: dec!(1),
            }],
            asks: vec![PriceLevel {
                price: dec!(101),
                amount: dec!(2),
            }],
        }
    }

    fn trade_content() -> TradeContent {
        TradeContent {
            trade_id: "t-1".to_string(),
            price: dec!(100.5),
            amount: dec!(0.1),
            side: Side::Bid,
        }
    }

    #[test]
    fn test_type_priority_breaks_timestamp_ties() {
        let snapshot = OrderBookMessage::snapshot("BTC-USD", Some(1), Some(5.0), levels()).unwrap();
        let diff = OrderBookMessage::diff("BTC-USD", Some(2), Some(5.0), levels()).unwrap();
        let trade = OrderBookMessage::trade("BTC-USD", Some(5.0), trade_content()).unwrap();

        assert!(snapshot < diff);
        assert!(diff < trade);
        assert!(snapshot < trade);
    }

    #[test]
    fn test_timestamp_is_primary_key() {
        let trade = OrderBookMessage::trade("BTC-USD", Some(4.0), trade_content()).unwrap();
        let snapshot = OrderBookMessage::snapshot("BTC-USD", Some(1), Some(5.0), levels()).unwrap();
        assert!(trade < snapshot);
    }

    #[test]
    fn test_equality_ignores_payload() {
        let a = OrderBookMessage::diff("BTC-USD", Some(1), Some(7.0), levels()).unwrap();
        let b = OrderBookMessage::diff(
            "BTC-USD",
            Some(9),
            Some(7.0),
            BookContent::OrderEvents(Vec::new()),
        )
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_snapshot_without_timestamp_is_rejected() {
        let err = OrderBookMessage::snapshot("BTC-USD", Some(100), None, levels()).unwrap_err();
        assert!(matches!(err, SyncError::MissingTimestamp(pair) if pair == "BTC-USD"));
    }

    #[test]
    fn test_diff_defaults_timestamp_and_derives_update_id() {
        let diff = OrderBookMessage::diff("BTC-USD", None, None, levels()).unwrap();
        assert!(diff.timestamp() > 0.0);
        assert_eq!(diff.update_id(), derive_update_id(diff.timestamp()));
        assert_eq!(diff.first_update_id(), diff.update_id());
    }

    #[test]
    fn test_content_must_match_type() {
        assert!(matches!(
            OrderBookMessage::snapshot(
                "BTC-USD",
                Some(1),
                Some(1.0),
                BookContent::OrderEvents(Vec::new())
            ),
            Err(SyncError::InvalidMessage(_))
        ));
        assert!(matches!(
            OrderBookMessage::diff("BTC-USD", Some(1), Some(1.0), BookContent::Orders(Vec::new())),
            Err(SyncError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_level_rows_carry_update_id() {
        let msg = OrderBookMessage::snapshot("BTC-USD", Some(42), Some(1.0), levels()).unwrap();
        let bids = msg.bids();
        assert_eq!(bids.len(), 1);
        assert_eq!(bids[0].price, dec!(100));
        assert_eq!(bids[0].update_id, 42);
        assert_eq!(msg.asks()[0].amount, dec!(2));
        assert_eq!(msg.trade_id(), None);
    }
}
