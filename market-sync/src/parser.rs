//! Parser for normalized order book messages
//!
//! Exchange adapters emit a single JSON envelope per frame. This module turns that
//! envelope into a validated [`OrderBookMessage`].

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::str::FromStr;

use crate::error::{Result, SyncError};
use crate::message::{
    BookContent, OrderBookMessage, OrderBookMessageType, OrderEntry, OrderEvent, PriceLevel,
    TradeContent,
};
use crate::orderbook::Side;

/// Normalized inbound message as produced by an exchange adapter
#[derive(Debug, Clone, Deserialize)]
pub struct RawBookMessage {
    #[serde(rename = "type")]
    pub message_type: OrderBookMessageType,

    pub trading_pair: String,

    /// Seconds; mandatory for snapshots
    #[serde(default)]
    pub timestamp: Option<f64>,

    #[serde(default)]
    pub update_id: Option<u64>,

    #[serde(default)]
    pub first_update_id: Option<u64>,

    /// Price-level rows as `[price, amount]` string pairs
    #[serde(default, deserialize_with = "deserialize_price_levels")]
    pub bids: Option<Vec<PriceLevel>>,

    #[serde(default, deserialize_with = "deserialize_price_levels")]
    pub asks: Option<Vec<PriceLevel>>,

    /// Resting orders of an order-level snapshot
    #[serde(default)]
    pub orders: Option<Vec<OrderEntry>>,

    /// Order-level diff events
    #[serde(default)]
    pub events: Option<Vec<OrderEvent>>,

    #[serde(default)]
    pub trade_id: Option<String>,

    #[serde(default, deserialize_with = "deserialize_optional_decimal")]
    pub price: Option<Decimal>,

    #[serde(default, deserialize_with = "deserialize_optional_decimal")]
    pub amount: Option<Decimal>,

    #[serde(default)]
    pub side: Option<Side>,
}

impl RawBookMessage {
    fn book_content(&mut self) -> Result<BookContent> {
        if let Some(orders) = self.orders.take() {
            return Ok(BookContent::Orders(orders));
        }
        if let Some(events) = self.events.take() {
            return Ok(BookContent::OrderEvents(events));
        }
        match (self.bids.take(), self.asks.take()) {
            (None, None) => Err(SyncError::InvalidMessage(format!(
                "{:?} message for {} carries no book payload",
                self.message_type, self.trading_pair
            ))),
            (bids, asks) => Ok(BookContent::Levels {
                bids: bids.unwrap_or_default(),
                asks: asks.unwrap_or_default(),
            }),
        }
    }

    fn trade_content(&self) -> Result<TradeContent> {
        let missing = |field: &str| {
            SyncError::InvalidMessage(format!(
                "trade message for {} is missing {}",
                self.trading_pair, field
            ))
        };
        Ok(TradeContent {
            trade_id: self.trade_id.clone().ok_or_else(|| missing("trade_id"))?,
            price: self.price.ok_or_else(|| missing("price"))?,
            amount: self.amount.ok_or_else(|| missing("amount"))?,
            side: self.side.ok_or_else(|| missing("side"))?,
        })
    }
}

impl TryFrom<RawBookMessage> for OrderBookMessage {
    type Error = SyncError;

    fn try_from(mut raw: RawBookMessage) -> Result<Self> {
        match raw.message_type {
            OrderBookMessageType::Snapshot => {
                let content = raw.book_content()?;
                OrderBookMessage::snapshot(&raw.trading_pair, raw.update_id, raw.timestamp, content)
            }
            OrderBookMessageType::Diff => {
                let content = raw.book_content()?;
                OrderBookMessage::diff_range(
                    &raw.trading_pair,
                    raw.first_update_id,
                    raw.update_id,
                    raw.timestamp,
                    content,
                )
            }
            OrderBookMessageType::Trade => {
                let trade = raw.trade_content()?;
                OrderBookMessage::trade(&raw.trading_pair, raw.timestamp, trade)
            }
        }
    }
}

/// Parse one JSON frame into a validated message
pub fn parse_message(raw: &str) -> Result<OrderBookMessage> {
    let envelope: RawBookMessage = serde_json::from_str(raw)?;
    OrderBookMessage::try_from(envelope)
}

/// Parse a JSON array of frames, failing on the first invalid one
pub fn parse_messages(raw: &str) -> Result<Vec<OrderBookMessage>> {
    let envelopes: Vec<RawBookMessage> = serde_json::from_str(raw)?;
    envelopes.into_iter().map(OrderBookMessage::try_from).collect()
}

fn deserialize_optional_decimal<'de, D>(deserializer: D) -> std::result::Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: Option<String> = Deserialize::deserialize(deserializer)?;
    s.map(|s| Decimal::from_str(&s).map_err(serde::de::Error::custom))
        .transpose()
}

/// Price levels from an array of string pairs
fn deserialize_price_levels<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<PriceLevel>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<Vec<String>>> = Deserialize::deserialize(deserializer)?;
    raw.map(|levels| {
        levels
            .into_iter()
            .map(|pair| {
                if pair.len() != 2 {
                    return Err(serde::de::Error::custom("Invalid price level format"));
                }
                Ok(PriceLevel {
                    price: Decimal::from_str(&pair[0]).map_err(serde::de::Error::custom)?,
                    amount: Decimal::from_str(&pair[1]).map_err(serde::de::Error::custom)?,
                })
            })
            .collect()
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::OrderEventKind;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_level_snapshot() {
        let raw = r#"{
            "type": "snapshot",
            "trading_pair": "BTC-USDT",
            "timestamp": 1672531200.5,
            "update_id": 100,
            "bids": [["50000.00", "1.5"], ["49999.00", "2.0"]],
            "asks": [["50001.00", "1.0"]]
        }"#;

        let msg = parse_message(raw).unwrap();
        assert_eq!(msg.message_type(), OrderBookMessageType::Snapshot);
        assert_eq!(msg.update_id(), 100);
        assert_eq!(msg.bids().len(), 2);
        assert_eq!(msg.bids()[0].price, dec!(50000.00));
        assert_eq!(msg.asks()[0].amount, dec!(1.0));
    }

    #[test]
    fn test_snapshot_without_timestamp_is_protocol_violation() {
        let raw = r#"{"type": "snapshot", "trading_pair": "BTC-USDT", "update_id": 1, "bids": []}"#;
        let err = parse_message(raw).unwrap_err();
        assert!(matches!(err, SyncError::MissingTimestamp(_)));
    }

    #[test]
    fn test_parse_order_events() {
        let raw = r#"{
            "type": "diff",
            "trading_pair": "ETH-USD",
            "timestamp": 10.0,
            "update_id": 7,
            "events": [
                {"kind": "open", "order_id": "abc", "price": "1337.0", "amount": "100", "side": "buy"},
                {"kind": "done", "order_id": "def", "price": "1338.0", "side": "sell"}
            ]
        }"#;

        let msg = parse_message(raw).unwrap();
        match msg.content() {
            BookContent::OrderEvents(events) => {
                assert_eq!(events.len(), 2);
                assert_eq!(events[0].kind, OrderEventKind::Open);
                assert_eq!(events[0].side, Side::Bid);
                assert_eq!(events[1].side, Side::Ask);
                assert_eq!(events[1].amount, Decimal::ZERO);
            }
            other => panic!("Expected order events, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_trade() {
        let raw = r#"{
            "type": "trade",
            "trading_pair": "BTC-USDT",
            "timestamp": 1672531200.0,
            "trade_id": "12345",
            "price": "50000.50",
            "amount": "0.5",
            "side": "sell"
        }"#;

        let msg = parse_message(raw).unwrap();
        assert_eq!(msg.trade_id(), Some("12345"));
        assert_eq!(msg.update_id(), 1672531200000);
    }

    #[test]
    fn test_trade_missing_price_is_rejected() {
        let raw = r#"{"type": "trade", "trading_pair": "BTC-USDT", "trade_id": "1", "amount": "1", "side": "buy"}"#;
        assert!(matches!(parse_message(raw), Err(SyncError::InvalidMessage(_))));
    }

    #[test]
    fn test_malformed_level_is_parse_error() {
        let raw = r#"{"type": "diff", "trading_pair": "BTC-USDT", "bids": [["1"]]}"#;
        assert!(matches!(parse_message(raw), Err(SyncError::Parse(_))));
    }
}
