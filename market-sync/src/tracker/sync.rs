//! Per-pair snapshot/diff reconciliation
//!
//! Every applied diff is kept in a bounded window sorted by the message order. A
//! snapshot replaces the book and replays the buffered diffs that are strictly newer
//! than it. A diff that arrives behind newer ones triggers a rebuild from the last
//! snapshot, so the book only depends on the set of messages seen and not on their
//! arrival order, as long as the window still holds every diff since that snapshot.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::message::{BookContent, OrderBookMessage, OrderBookMessageType};
use crate::orderbook::{ActiveOrderTracker, OrderBook};

/// Default capacity of the replay window
pub const PAST_DIFF_WINDOW_SIZE: usize = 32;

/// Outcome of processing one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Diff,
    /// A late diff applied on top of newer ones because the window no longer
    /// holds everything since the last snapshot
    OutOfOrder,
    /// A late diff forced a rebuild from the last snapshot
    Rebuilt { replayed: usize },
    Snapshot { replayed: usize },
    Trade,
    /// Same diff already buffered
    Duplicate,
    /// Ordered before the last applied snapshot
    Stale(OrderBookMessageType),
}

/// Reconciliation state for one trading pair
#[derive(Debug)]
pub struct PairSynchronizer {
    trading_pair: String,
    active_orders: ActiveOrderTracker,
    past_diffs: VecDeque<OrderBookMessage>,
    window_size: usize,
    last_snapshot: Option<OrderBookMessage>,
    /// A diff newer than the last snapshot has left the window
    window_truncated: bool,
}

impl PairSynchronizer {
    pub fn new(trading_pair: &str, window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            trading_pair: trading_pair.to_string(),
            active_orders: ActiveOrderTracker::new(),
            past_diffs: VecDeque::with_capacity(window_size + 1),
            window_size,
            last_snapshot: None,
            window_truncated: false,
        }
    }

    /// Apply `message` to `book`. The caller holds the book's write guard for the
    /// whole call.
    pub fn process(&mut self, book: &mut OrderBook, message: &OrderBookMessage) -> Result<Applied> {
        if message.trading_pair() != self.trading_pair || book.trading_pair() != self.trading_pair {
            return Err(SyncError::OrderBook(format!(
                "{} message routed to the {} synchronizer",
                message.trading_pair(),
                self.trading_pair
            )));
        }

        match message.message_type() {
            OrderBookMessageType::Diff => self.process_diff(book, message),
            OrderBookMessageType::Snapshot => self.process_snapshot(book, message),
            OrderBookMessageType::Trade => {
                if let BookContent::Trade(trade) = message.content() {
                    book.apply_trade(trade);
                }
                Ok(Applied::Trade)
            }
        }
    }

    fn process_diff(&mut self, book: &mut OrderBook, message: &OrderBookMessage) -> Result<Applied> {
        if self.is_before_snapshot(message) {
            debug!(
                trading_pair = %self.trading_pair,
                update_id = message.update_id(),
                "Dropping diff older than the last snapshot"
            );
            return Ok(Applied::Stale(OrderBookMessageType::Diff));
        }

        let position = self.past_diffs.partition_point(|diff| diff <= message);
        let duplicate = self
            .past_diffs
            .range(..position)
            .rev()
            .take_while(|diff| *diff == message)
            .any(|diff| diff.update_id() == message.update_id());
        if duplicate {
            return Ok(Applied::Duplicate);
        }

        // Only diffs that applied cleanly enter the window
        let late = position < self.past_diffs.len();
        if !late || self.window_truncated {
            if late {
                warn!(
                    trading_pair = %self.trading_pair,
                    update_id = message.update_id(),
                    "Late diff beyond the replay window, applying out of order"
                );
            }
            self.apply_or_restore(book, message)?;
            self.past_diffs.insert(position, message.clone());
            self.trim_window();
            return Ok(if late { Applied::OutOfOrder } else { Applied::Diff });
        }

        self.past_diffs.insert(position, message.clone());
        match self.rebuild(book) {
            Ok(replayed) => {
                self.trim_window();
                Ok(Applied::Rebuilt { replayed })
            }
            Err(e) => {
                self.past_diffs.remove(position);
                self.restore(book);
                Err(e)
            }
        }
    }

    fn apply_or_restore(&mut self, book: &mut OrderBook, message: &OrderBookMessage) -> Result<()> {
        if let Err(e) = apply_diff(&mut self.active_orders, book, message) {
            self.restore(book);
            return Err(e);
        }
        Ok(())
    }

    /// Drop partial order state left by a failed diff by rebuilding from the
    /// buffered messages
    fn restore(&mut self, book: &mut OrderBook) {
        if self.window_truncated {
            warn!(
                trading_pair = %self.trading_pair,
                "Replay window truncated, order book stays as is until the next snapshot"
            );
            return;
        }
        if let Err(e) = self.rebuild(book) {
            warn!(trading_pair = %self.trading_pair, error = %e, "Failed to rebuild order book");
        }
    }

    fn process_snapshot(&mut self, book: &mut OrderBook, message: &OrderBookMessage) -> Result<Applied> {
        if self.is_before_snapshot(message) {
            debug!(
                trading_pair = %self.trading_pair,
                update_id = message.update_id(),
                "Discarding snapshot older than the last applied one"
            );
            return Ok(Applied::Stale(OrderBookMessageType::Snapshot));
        }

        self.last_snapshot = Some(message.clone());
        self.window_truncated = false;
        let replayed = self.rebuild(book)?;

        debug!(
            trading_pair = %self.trading_pair,
            update_id = message.update_id(),
            replayed,
            "Snapshot applied"
        );
        Ok(Applied::Snapshot { replayed })
    }

    /// Reapply the last snapshot, or an empty book, plus every newer buffered diff
    fn rebuild(&mut self, book: &mut OrderBook) -> Result<usize> {
        let start = match &self.last_snapshot {
            Some(snapshot) => {
                let (bids, asks) = self.active_orders.apply_snapshot(snapshot)?;
                book.apply_snapshot(&bids, &asks, snapshot.update_id());
                self.past_diffs.partition_point(|diff| diff <= snapshot)
            }
            None => {
                self.active_orders = ActiveOrderTracker::new();
                book.reset();
                0
            }
        };

        let mut replayed = 0;
        for diff in self.past_diffs.range(start..) {
            apply_diff(&mut self.active_orders, book, diff)?;
            replayed += 1;
        }
        Ok(replayed)
    }

    fn trim_window(&mut self) {
        while self.past_diffs.len() > self.window_size {
            if let Some(evicted) = self.past_diffs.pop_front() {
                let after_snapshot = match &self.last_snapshot {
                    Some(snapshot) => &evicted > snapshot,
                    None => true,
                };
                self.window_truncated |= after_snapshot;
            }
        }
    }

    fn is_before_snapshot(&self, message: &OrderBookMessage) -> bool {
        self.last_snapshot
            .as_ref()
            .map_or(false, |snapshot| message < snapshot)
    }

    pub fn trading_pair(&self) -> &str {
        &self.trading_pair
    }

    pub fn active_orders(&self) -> &ActiveOrderTracker {
        &self.active_orders
    }

    /// Buffered diffs, oldest first
    pub fn past_diffs(&self) -> impl Iterator<Item = &OrderBookMessage> + '_ {
        self.past_diffs.iter()
    }

    pub fn window_len(&self) -> usize {
        self.past_diffs.len()
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn last_snapshot_update_id(&self) -> Option<u64> {
        self.last_snapshot.as_ref().map(OrderBookMessage::update_id)
    }
}

fn apply_diff(
    active_orders: &mut ActiveOrderTracker,
    book: &mut OrderBook,
    diff: &OrderBookMessage,
) -> Result<()> {
    let (bids, asks) = active_orders.apply_diff(diff)?;
    if !bids.is_empty() || !asks.is_empty() {
        book.apply_diffs(&bids, &asks, diff.update_id());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{OrderEntry, OrderEvent, OrderEventKind, PriceLevel, TradeContent};
    use crate::orderbook::Side;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    const PAIR: &str = "BTC-USDT";

    fn level(price: Decimal, amount: Decimal) -> PriceLevel {
        PriceLevel { price, amount }
    }

    fn snapshot(uid: u64, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> OrderBookMessage {
        OrderBookMessage::snapshot(PAIR, Some(uid), Some(uid as f64), BookContent::Levels { bids, asks })
            .unwrap()
    }

    fn diff(uid: u64, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> OrderBookMessage {
        OrderBookMessage::diff(PAIR, Some(uid), Some(uid as f64), BookContent::Levels { bids, asks })
            .unwrap()
    }

    fn levels(book: &OrderBook) -> (Vec<(Decimal, Decimal)>, Vec<(Decimal, Decimal)>) {
        (book.bid_levels().collect(), book.ask_levels().collect())
    }

    #[test]
    fn test_snapshot_replays_only_newer_diffs() {
        let mut sync = PairSynchronizer::new(PAIR, PAST_DIFF_WINDOW_SIZE);
        let mut book = OrderBook::new(PAIR);

        for msg in [
            diff(98, vec![level(dec!(9), dec!(5))], vec![]),
            diff(99, vec![level(dec!(8), dec!(5))], vec![]),
            diff(101, vec![level(dec!(10), dec!(2))], vec![]),
            diff(102, vec![level(dec!(11), dec!(3))], vec![]),
        ] {
            assert_eq!(sync.process(&mut book, &msg).unwrap(), Applied::Diff);
        }

        let applied = sync
            .process(&mut book, &snapshot(100, vec![level(dec!(10), dec!(1))], vec![level(dec!(12), dec!(1))]))
            .unwrap();

        assert_eq!(applied, Applied::Snapshot { replayed: 2 });
        assert_eq!(book.snapshot_uid(), 100);
        assert_eq!(book.last_applied_update_id(), 102);
        assert_eq!(
            levels(&book),
            (vec![(dec!(11), dec!(3)), (dec!(10), dec!(2))], vec![(dec!(12), dec!(1))])
        );
        assert_eq!(book.bid_amount(dec!(9)), None);
        assert_eq!(book.bid_amount(dec!(8)), None);
    }

    fn scenario() -> Vec<OrderBookMessage> {
        vec![
            snapshot(95, vec![level(dec!(50), dec!(1))], vec![level(dec!(60), dec!(1))]),
            diff(98, vec![level(dec!(9), dec!(5))], vec![]),
            diff(99, vec![level(dec!(10), dec!(7))], vec![]),
            snapshot(100, vec![level(dec!(10), dec!(1))], vec![level(dec!(12), dec!(2))]),
            diff(101, vec![level(dec!(10), dec!(2))], vec![]),
            diff(102, vec![level(dec!(10), dec!(0))], vec![level(dec!(12), dec!(1))]),
            diff(103, vec![level(dec!(11), dec!(1))], vec![level(dec!(12), dec!(4))]),
        ]
    }

    fn run(messages: &[&OrderBookMessage]) -> OrderBook {
        let mut sync = PairSynchronizer::new(PAIR, PAST_DIFF_WINDOW_SIZE);
        let mut book = OrderBook::new(PAIR);
        for msg in messages {
            sync.process(&mut book, msg).unwrap();
        }
        book
    }

    fn permutations<'a>(
        items: &mut Vec<&'a OrderBookMessage>,
        k: usize,
        out: &mut Vec<Vec<&'a OrderBookMessage>>,
    ) {
        if k == items.len() {
            out.push(items.clone());
            return;
        }
        for i in k..items.len() {
            items.swap(k, i);
            permutations(items, k + 1, out);
            items.swap(k, i);
        }
    }

    #[test]
    fn test_arrival_order_does_not_change_final_book() {
        let messages = scenario();
        let mut sorted: Vec<&OrderBookMessage> = messages.iter().collect();
        sorted.sort();
        let expected = run(&sorted);

        assert_eq!(
            levels(&expected),
            (vec![(dec!(11), dec!(1))], vec![(dec!(12), dec!(4))])
        );

        let mut arrivals = Vec::new();
        permutations(&mut messages.iter().collect(), 0, &mut arrivals);
        assert_eq!(arrivals.len(), 5040);

        for arrival in &arrivals {
            let book = run(arrival);
            let order: Vec<u64> = arrival.iter().map(|m| m.update_id()).collect();
            assert_eq!(levels(&book), levels(&expected), "arrival order {:?}", order);
            assert_eq!(book.snapshot_uid(), expected.snapshot_uid(), "arrival order {:?}", order);
            assert_eq!(
                book.last_applied_update_id(),
                expected.last_applied_update_id(),
                "arrival order {:?}",
                order
            );
        }
    }

    #[test]
    fn test_window_is_bounded() {
        let mut sync = PairSynchronizer::new(PAIR, 3);
        let mut book = OrderBook::new(PAIR);
        for uid in 1..=5 {
            sync.process(&mut book, &diff(uid, vec![level(dec!(1), Decimal::from(uid))], vec![]))
                .unwrap();
        }

        assert_eq!(sync.window_len(), 3);
        let buffered: Vec<u64> = sync.past_diffs().map(|m| m.update_id()).collect();
        assert_eq!(buffered, vec![3, 4, 5]);
    }

    #[test]
    fn test_stale_messages_are_dropped() {
        let mut sync = PairSynchronizer::new(PAIR, PAST_DIFF_WINDOW_SIZE);
        let mut book = OrderBook::new(PAIR);
        sync.process(&mut book, &snapshot(100, vec![level(dec!(10), dec!(1))], vec![]))
            .unwrap();

        let old_diff = diff(90, vec![level(dec!(10), dec!(9))], vec![]);
        assert_eq!(
            sync.process(&mut book, &old_diff).unwrap(),
            Applied::Stale(OrderBookMessageType::Diff)
        );

        let old_snapshot = snapshot(80, vec![], vec![]);
        assert_eq!(
            sync.process(&mut book, &old_snapshot).unwrap(),
            Applied::Stale(OrderBookMessageType::Snapshot)
        );
        assert_eq!(book.bid_amount(dec!(10)), Some(dec!(1)));
        assert_eq!(sync.last_snapshot_update_id(), Some(100));
    }

    #[test]
    fn test_redelivered_diff_is_ignored() {
        let mut sync = PairSynchronizer::new(PAIR, PAST_DIFF_WINDOW_SIZE);
        let mut book = OrderBook::new(PAIR);
        let msg = diff(5, vec![level(dec!(10), dec!(1))], vec![]);

        assert_eq!(sync.process(&mut book, &msg).unwrap(), Applied::Diff);
        assert_eq!(sync.process(&mut book, &msg).unwrap(), Applied::Duplicate);
        assert_eq!(sync.window_len(), 1);
    }

    #[test]
    fn test_order_level_feed() {
        let mut sync = PairSynchronizer::new(PAIR, PAST_DIFF_WINDOW_SIZE);
        let mut book = OrderBook::new(PAIR);

        let snap = OrderBookMessage::snapshot(
            PAIR,
            Some(10),
            Some(10.0),
            BookContent::Orders(vec![
                OrderEntry {
                    order_id: "a".to_string(),
                    price: dec!(100),
                    amount: dec!(1),
                    side: Side::Bid,
                },
                OrderEntry {
                    order_id: "b".to_string(),
                    price: dec!(100),
                    amount: dec!(2),
                    side: Side::Bid,
                },
                OrderEntry {
                    order_id: "c".to_string(),
                    price: dec!(101),
                    amount: dec!(5),
                    side: Side::Ask,
                },
            ]),
        )
        .unwrap();
        sync.process(&mut book, &snap).unwrap();
        assert_eq!(book.bid_amount(dec!(100)), Some(dec!(3)));

        let fill = OrderBookMessage::diff(
            PAIR,
            Some(11),
            Some(11.0),
            BookContent::OrderEvents(vec![
                OrderEvent {
                    kind: OrderEventKind::Done,
                    order_id: "a".to_string(),
                    price: dec!(100),
                    amount: Decimal::ZERO,
                    side: Side::Bid,
                },
                OrderEvent {
                    kind: OrderEventKind::Match,
                    order_id: "c".to_string(),
                    price: dec!(101),
                    amount: dec!(5),
                    side: Side::Ask,
                },
            ]),
        )
        .unwrap();
        sync.process(&mut book, &fill).unwrap();

        assert_eq!(book.bid_amount(dec!(100)), Some(dec!(2)));
        assert_eq!(book.best_ask(), None);
        assert_eq!(sync.active_orders().len(), 1);
    }

    #[test]
    fn test_trade_updates_last_price() {
        let mut sync = PairSynchronizer::new(PAIR, PAST_DIFF_WINDOW_SIZE);
        let mut book = OrderBook::new(PAIR);
        let trade = OrderBookMessage::trade(
            PAIR,
            Some(1.0),
            TradeContent {
                trade_id: "t".to_string(),
                price: dec!(100.5),
                amount: dec!(2),
                side: Side::Bid,
            },
        )
        .unwrap();

        assert_eq!(sync.process(&mut book, &trade).unwrap(), Applied::Trade);
        assert_eq!(book.last_trade_price(), Some(dec!(100.5)));
        assert_eq!(sync.window_len(), 0);
    }

    #[test]
    fn test_misrouted_message_is_rejected() {
        let mut sync = PairSynchronizer::new(PAIR, PAST_DIFF_WINDOW_SIZE);
        let mut book = OrderBook::new(PAIR);
        let other = OrderBookMessage::diff(
            "ETH-USDT",
            Some(1),
            Some(1.0),
            BookContent::Levels {
                bids: vec![],
                asks: vec![],
            },
        )
        .unwrap();
        assert!(matches!(sync.process(&mut book, &other), Err(SyncError::OrderBook(_))));
    }

    #[test]
    fn test_late_diff_beyond_window_is_applied_out_of_order() {
        let mut sync = PairSynchronizer::new(PAIR, 2);
        let mut book = OrderBook::new(PAIR);
        sync.process(&mut book, &snapshot(10, vec![level(dec!(10), dec!(1))], vec![]))
            .unwrap();
        for uid in [20, 30, 40] {
            sync.process(&mut book, &diff(uid, vec![level(Decimal::from(uid), dec!(1))], vec![]))
                .unwrap();
        }

        // Diff 20 was evicted, so a rebuild would lose it
        let late = diff(25, vec![level(dec!(25), dec!(2))], vec![]);
        assert_eq!(sync.process(&mut book, &late).unwrap(), Applied::OutOfOrder);
        assert_eq!(book.bid_amount(dec!(25)), Some(dec!(2)));
        assert_eq!(book.bid_amount(dec!(20)), Some(dec!(1)));
        assert_eq!(book.bid_amount(dec!(40)), Some(dec!(1)));
        assert_eq!(sync.window_len(), 2);
    }

    #[test]
    fn test_failed_diff_is_not_buffered() {
        let mut sync = PairSynchronizer::new(PAIR, PAST_DIFF_WINDOW_SIZE);
        let mut book = OrderBook::new(PAIR);
        let open = |order_id: &str, price: Decimal, amount: Decimal| OrderEvent {
            kind: OrderEventKind::Open,
            order_id: order_id.to_string(),
            price,
            amount,
            side: Side::Bid,
        };

        let snap = OrderBookMessage::snapshot(
            PAIR,
            Some(10),
            Some(10.0),
            BookContent::Orders(vec![OrderEntry {
                order_id: "whale".to_string(),
                price: dec!(10),
                amount: Decimal::MAX,
                side: Side::Bid,
            }]),
        )
        .unwrap();
        sync.process(&mut book, &snap).unwrap();

        // The first event applies, the second overflows the level aggregate
        let overflow = OrderBookMessage::diff(
            PAIR,
            Some(11),
            Some(11.0),
            BookContent::OrderEvents(vec![open("small", dec!(20), dec!(1)), open("more", dec!(10), dec!(1))]),
        )
        .unwrap();
        assert!(matches!(sync.process(&mut book, &overflow), Err(SyncError::OrderBook(_))));
        assert_eq!(sync.window_len(), 0);
        assert_eq!(sync.active_orders().aggregate(Side::Bid, dec!(20)), Decimal::ZERO);
        assert_eq!(book.bid_amount(dec!(20)), None);

        let next = OrderBookMessage::diff(
            PAIR,
            Some(12),
            Some(12.0),
            BookContent::OrderEvents(vec![open("fresh", dec!(9), dec!(3))]),
        )
        .unwrap();
        assert_eq!(sync.process(&mut book, &next).unwrap(), Applied::Diff);

        // Later rebuilds no longer trip over the rejected diff
        assert_eq!(
            sync.process(&mut book, &snap).unwrap(),
            Applied::Snapshot { replayed: 1 }
        );
        assert_eq!(book.bid_amount(dec!(9)), Some(dec!(3)));
        assert_eq!(book.bid_amount(dec!(10)), Some(Decimal::MAX));
    }
}
