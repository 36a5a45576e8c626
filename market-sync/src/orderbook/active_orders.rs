//! Active order tracking
//!
//! Some exchanges publish order-level events instead of price-level deltas. The
//! tracker keeps every resting order by id and turns each message into the set of
//! price levels whose aggregate changed.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use rust_decimal::Decimal;

use super::{OrderBookRow, Side};
use crate::error::{Result, SyncError};
use crate::message::{BookContent, OrderBookMessage, OrderEntry, OrderEvent, OrderEventKind};

pub type RowPair = (Vec<OrderBookRow>, Vec<OrderBookRow>);

/// Number of recently applied diffs remembered for redelivery detection
pub const APPLIED_DIFF_MEMORY: usize = 1024;

/// Identity of a diff: update id plus the exact timestamp bits
type DiffKey = (u64, u64);

/// A resting order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveOrder {
    pub price: Decimal,
    pub amount: Decimal,
    pub side: Side,
}

/// Order-id state for one trading pair
#[derive(Debug, Default)]
pub struct ActiveOrderTracker {
    orders: HashMap<String, ActiveOrder>,
    /// Aggregates per price, always the sum over `orders`
    bid_levels: BTreeMap<Decimal, Decimal>,
    ask_levels: BTreeMap<Decimal, Decimal>,
    last_update_id: Option<u64>,
    /// Diffs applied since the last snapshot, oldest first
    applied: VecDeque<DiffKey>,
    applied_keys: HashSet<DiffKey>,
}

impl ActiveOrderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a snapshot and return every level on both sides
    pub fn apply_snapshot(&mut self, message: &OrderBookMessage) -> Result<RowPair> {
        let update_id = message.update_id();
        self.orders.clear();
        self.bid_levels.clear();
        self.ask_levels.clear();
        self.applied.clear();
        self.applied_keys.clear();

        let rows = match message.content() {
            BookContent::Orders(entries) => {
                for entry in entries {
                    self.close(&entry.order_id)?;
                    self.open(entry.order_id.clone(), order_from_entry(entry))?;
                }
                (
                    level_rows(self.bid_levels.iter().rev(), update_id),
                    level_rows(self.ask_levels.iter(), update_id),
                )
            }
            BookContent::Levels { .. } => (message.bids(), message.asks()),
            _ => {
                return Err(SyncError::InvalidMessage(format!(
                    "snapshot for {} has no book content",
                    message.trading_pair()
                )))
            }
        };

        self.last_update_id = Some(update_id);
        Ok(rows)
    }

    /// Apply a diff and return the levels whose aggregate changed.
    ///
    /// A diff with the same update id and timestamp as one applied since the last
    /// snapshot is a redelivery and yields no rows. Distinct diffs sharing an
    /// update id are all applied.
    pub fn apply_diff(&mut self, message: &OrderBookMessage) -> Result<RowPair> {
        let update_id = message.update_id();
        let key = diff_key(message);
        if self.applied_keys.contains(&key) {
            return Ok((Vec::new(), Vec::new()));
        }

        let rows = match message.content() {
            BookContent::OrderEvents(events) => {
                let mut changed_bids = BTreeSet::new();
                let mut changed_asks = BTreeSet::new();
                for event in events {
                    for (side, price) in self.apply_event(event)? {
                        match side {
                            Side::Bid => changed_bids.insert(price),
                            Side::Ask => changed_asks.insert(price),
                        };
                    }
                }
                (
                    self.changed_rows(Side::Bid, changed_bids.iter().rev(), update_id),
                    self.changed_rows(Side::Ask, changed_asks.iter(), update_id),
                )
            }
            BookContent::Levels { .. } => (message.bids(), message.asks()),
            _ => {
                return Err(SyncError::InvalidMessage(format!(
                    "diff for {} has no book content",
                    message.trading_pair()
                )))
            }
        };

        self.remember(key);
        self.last_update_id = Some(self.last_update_id.map_or(update_id, |last| last.max(update_id)));
        Ok(rows)
    }

    /// Aggregate amount resting at `price`
    pub fn aggregate(&self, side: Side, price: Decimal) -> Decimal {
        self.levels(side).get(&price).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn order(&self, order_id: &str) -> Option<&ActiveOrder> {
        self.orders.get(order_id)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Highest update id applied so far
    pub fn last_update_id(&self) -> Option<u64> {
        self.last_update_id
    }

    fn remember(&mut self, key: DiffKey) {
        if self.applied.len() >= APPLIED_DIFF_MEMORY {
            if let Some(oldest) = self.applied.pop_front() {
                self.applied_keys.remove(&oldest);
            }
        }
        self.applied.push_back(key);
        self.applied_keys.insert(key);
    }

    /// Returns the touched (side, price) levels
    fn apply_event(&mut self, event: &OrderEvent) -> Result<Vec<(Side, Decimal)>> {
        let touched = match event.kind {
            OrderEventKind::Open => {
                let order = ActiveOrder {
                    price: event.price,
                    amount: event.amount,
                    side: event.side,
                };
                let mut touched = self.close(&event.order_id)?;
                touched.extend(self.open(event.order_id.clone(), order)?);
                touched
            }
            OrderEventKind::Change => match self.orders.get(&event.order_id).copied() {
                Some(order) => self.resize(&event.order_id, order, event.amount)?,
                None => Vec::new(),
            },
            OrderEventKind::Match => match self.orders.get(&event.order_id).copied() {
                Some(order) => {
                    let remaining = checked_sub(order.amount, event.amount)?;
                    self.resize(&event.order_id, order, remaining)?
                }
                None => Vec::new(),
            },
            OrderEventKind::Done => self.close(&event.order_id)?,
        };
        Ok(touched)
    }

    fn open(&mut self, order_id: String, order: ActiveOrder) -> Result<Vec<(Side, Decimal)>> {
        if order.amount <= Decimal::ZERO {
            return Ok(Vec::new());
        }
        let level = self.levels_mut(order.side).entry(order.price).or_insert(Decimal::ZERO);
        *level = checked_add(*level, order.amount)?;
        self.orders.insert(order_id, order);
        Ok(vec![(order.side, order.price)])
    }

    fn close(&mut self, order_id: &str) -> Result<Vec<(Side, Decimal)>> {
        match self.orders.remove(order_id) {
            Some(order) => {
                self.withdraw(order.side, order.price, order.amount)?;
                Ok(vec![(order.side, order.price)])
            }
            None => Ok(Vec::new()),
        }
    }

    fn resize(
        &mut self,
        order_id: &str,
        order: ActiveOrder,
        amount: Decimal,
    ) -> Result<Vec<(Side, Decimal)>> {
        if amount <= Decimal::ZERO {
            return self.close(order_id);
        }
        self.withdraw(order.side, order.price, order.amount)?;
        let level = self.levels_mut(order.side).entry(order.price).or_insert(Decimal::ZERO);
        *level = checked_add(*level, amount)?;
        self.orders.insert(order_id.to_string(), ActiveOrder { amount, ..order });
        Ok(vec![(order.side, order.price)])
    }

    fn withdraw(&mut self, side: Side, price: Decimal, amount: Decimal) -> Result<()> {
        let levels = self.levels_mut(side);
        let remaining = match levels.get(&price) {
            Some(level) => checked_sub(*level, amount)?,
            None => return Ok(()),
        };
        if remaining <= Decimal::ZERO {
            levels.remove(&price);
        } else {
            levels.insert(price, remaining);
        }
        Ok(())
    }

    fn changed_rows<'a>(
        &self,
        side: Side,
        prices: impl Iterator<Item = &'a Decimal>,
        update_id: u64,
    ) -> Vec<OrderBookRow> {
        prices
            .map(|price| OrderBookRow {
                price: *price,
                amount: self.aggregate(side, *price),
                update_id,
            })
            .collect()
    }

    fn levels(&self, side: Side) -> &BTreeMap<Decimal, Decimal> {
        match side {
            Side::Bid => &self.bid_levels,
            Side::Ask => &self.ask_levels,
        }
    }

    fn levels_mut(&mut self, side: Side) -> &mut BTreeMap<Decimal, Decimal> {
        match side {
            Side::Bid => &mut self.bid_levels,
            Side::Ask => &mut self.ask_levels,
        }
    }
}

fn diff_key(message: &OrderBookMessage) -> DiffKey {
    (message.update_id(), message.timestamp().to_bits())
}

fn order_from_entry(entry: &OrderEntry) -> ActiveOrder {
    ActiveOrder {
        price: entry.price,
        amount: entry.amount,
        side: entry.side,
    }
}

fn level_rows<'a>(
    levels: impl Iterator<Item = (&'a Decimal, &'a Decimal)>,
    update_id: u64,
) -> Vec<OrderBookRow> {
    levels
        .map(|(price, amount)| OrderBookRow {
            price: *price,
            amount: *amount,
            update_id,
        })
        .collect()
}

fn checked_add(a: Decimal, b: Decimal) -> Result<Decimal> {
    a.checked_add(b)
        .ok_or_else(|| SyncError::OrderBook(format!("aggregate overflow adding {} to {}", b, a)))
}

fn checked_sub(a: Decimal, b: Decimal) -> Result<Decimal> {
    a.checked_sub(b)
        .ok_or_else(|| SyncError::OrderBook(format!("aggregate overflow subtracting {} from {}", b, a)))
}
