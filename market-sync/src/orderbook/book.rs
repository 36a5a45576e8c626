//! Core order book implementation
//!
//! Uses BTreeMap for sorted price level management. The book is only mutated by
//! replacing it with a snapshot or merging diff rows into it.

use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::BTreeMap;

use super::{Level, OrderBookMetrics, OrderBookRow, OrderBookState};
use crate::message::TradeContent;

/// Order book for a single trading pair
#[derive(Debug, Clone)]
pub struct OrderBook {
    trading_pair: String,
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<Decimal, Decimal>,
    /// Update ID of the last applied snapshot
    snapshot_uid: u64,
    /// Update ID of the last applied diff
    last_diff_uid: u64,
    /// Highest update ID applied so far; never decreases
    last_applied_update_id: u64,
    /// Whether a snapshot has been applied
    initialized: bool,
    last_trade_price: Option<Decimal>,
    last_trade_amount: Option<Decimal>,
}

impl OrderBook {
    /// Create a new empty order book
    pub fn new(trading_pair: &str) -> Self {
        Self {
            trading_pair: trading_pair.to_string(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            snapshot_uid: 0,
            last_diff_uid: 0,
            last_applied_update_id: 0,
            initialized: false,
            last_trade_price: None,
            last_trade_amount: None,
        }
    }

    /// Replace both sides wholesale
    pub fn apply_snapshot(&mut self, bids: &[OrderBookRow], asks: &[OrderBookRow], update_id: u64) {
        self.bids.clear();
        self.asks.clear();

        for row in bids {
            if row.amount > Decimal::ZERO {
                self.bids.insert(Reverse(row.price), row.amount);
            }
        }

        for row in asks {
            if row.amount > Decimal::ZERO {
                self.asks.insert(row.price, row.amount);
            }
        }

        self.snapshot_uid = update_id;
        self.last_applied_update_id = self.last_applied_update_id.max(update_id);
        self.initialized = true;
    }

    /// Merge level deltas; a zero amount removes the level
    pub fn apply_diffs(&mut self, bids: &[OrderBookRow], asks: &[OrderBookRow], update_id: u64) {
        for row in bids {
            if row.amount <= Decimal::ZERO {
                self.bids.remove(&Reverse(row.price));
            } else {
                self.bids.insert(Reverse(row.price), row.amount);
            }
        }

        for row in asks {
            if row.amount <= Decimal::ZERO {
                self.asks.remove(&row.price);
            } else {
                self.asks.insert(row.price, row.amount);
            }
        }

        self.last_diff_uid = update_id;
        self.last_applied_update_id = self.last_applied_update_id.max(update_id);
    }

    /// Drop every level. The update id high-water mark is kept.
    pub fn reset(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.initialized = false;
    }

    /// Record the last trade print
    pub fn apply_trade(&mut self, trade: &TradeContent) {
        self.last_trade_price = Some(trade.price);
        self.last_trade_amount = Some(trade.amount);
    }

    pub fn trading_pair(&self) -> &str {
        &self.trading_pair
    }

    /// Get best bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first_key_value().map(|(Reverse(p), _)| *p)
    }

    /// Get best ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first_key_value().map(|(p, _)| *p)
    }

    /// Get mid price
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::from(2)),
            _ => None,
        }
    }

    /// Get spread in basis points
    pub fn spread_bps(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask(), self.mid_price()) {
            (Some(bid), Some(ask), Some(mid)) if mid > Decimal::ZERO => {
                Some((ask - bid) / mid * Decimal::from(10000))
            }
            _ => None,
        }
    }

    /// Calculate order book imbalance at top N levels
    pub fn imbalance(&self, levels: usize) -> Option<Decimal> {
        let bid_volume: Decimal = self.bids.iter().take(levels).map(|(_, q)| q).sum();
        let ask_volume: Decimal = self.asks.iter().take(levels).map(|(_, q)| q).sum();

        let total = bid_volume + ask_volume;
        if total > Decimal::ZERO {
            Some((bid_volume - ask_volume) / total)
        } else {
            None
        }
    }

    /// Aggregate amount resting at a bid price
    pub fn bid_amount(&self, price: Decimal) -> Option<Decimal> {
        self.bids.get(&Reverse(price)).copied()
    }

    /// Aggregate amount resting at an ask price
    pub fn ask_amount(&self, price: Decimal) -> Option<Decimal> {
        self.asks.get(&price).copied()
    }

    /// Bid levels, best first
    pub fn bid_levels(&self) -> impl Iterator<Item = (Decimal, Decimal)> + '_ {
        self.bids.iter().map(|(Reverse(p), q)| (*p, *q))
    }

    /// Ask levels, best first
    pub fn ask_levels(&self) -> impl Iterator<Item = (Decimal, Decimal)> + '_ {
        self.asks.iter().map(|(p, q)| (*p, *q))
    }

    /// Check if the book has received a snapshot
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn snapshot_uid(&self) -> u64 {
        self.snapshot_uid
    }

    pub fn last_diff_uid(&self) -> u64 {
        self.last_diff_uid
    }

    pub fn last_applied_update_id(&self) -> u64 {
        self.last_applied_update_id
    }

    pub fn last_trade_price(&self) -> Option<Decimal> {
        self.last_trade_price
    }

    pub fn last_trade_amount(&self) -> Option<Decimal> {
        self.last_trade_amount
    }

    /// Current state limited to `depth` levels per side
    pub fn state(&self, depth: usize) -> OrderBookState {
        OrderBookState {
            trading_pair: self.trading_pair.clone(),
            snapshot_uid: self.snapshot_uid,
            last_update_id: self.last_applied_update_id,
            bids: self
                .bid_levels()
                .take(depth)
                .map(|(price, quantity)| Level { price, quantity })
                .collect(),
            asks: self
                .ask_levels()
                .take(depth)
                .map(|(price, quantity)| Level { price, quantity })
                .collect(),
            metrics: self.calculate_metrics(),
        }
    }

    fn calculate_metrics(&self) -> OrderBookMetrics {
        OrderBookMetrics {
            mid_price: self.mid_price(),
            spread_bps: self.spread_bps(),
            imbalance: self.imbalance(5),
            last_trade_price: self.last_trade_price,
            bid_depth: self.bids.values().copied().sum(),
            ask_depth: self.asks.values().copied().sum(),
            bid_levels: self.bids.len(),
            ask_levels: self.asks.len(),
        }
    }
}
