//! Order book tracker
//!
//! Routes messages from a data source to one task per trading pair. Each pair task
//! owns its [`PairSynchronizer`] and is the only writer of its book. Consumers read
//! books through [`OrderBookView`]s.

mod sync;

pub use sync::{Applied, PairSynchronizer, PAST_DIFF_WINDOW_SIZE};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::data_source::{OrderBookDataSource, TrackedPairs};
use crate::error::{Result, SyncError};
use crate::logging::AdvisoryBus;
use crate::message::{OrderBookMessage, OrderBookMessageType};
use crate::metrics;
use crate::orderbook::{OrderBook, OrderBookReader, OrderBookRegistry, OrderBookView};

/// Default bound on each pair's saved-message backlog
pub const SAVED_MESSAGE_CAPACITY: usize = 1000;

/// Tracker tuning
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub past_diff_window_size: usize,
    pub saved_message_capacity: usize,
    /// Pause after a processing fault before resuming
    pub error_backoff: Duration,
    /// Interval between diagnostic summaries
    pub report_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            past_diff_window_size: PAST_DIFF_WINDOW_SIZE,
            saved_message_capacity: SAVED_MESSAGE_CAPACITY,
            error_backoff: Duration::from_secs(5),
            report_interval: Duration::from_secs(60),
        }
    }
}

type Backlog = Arc<Mutex<VecDeque<OrderBookMessage>>>;
type PairInput = (mpsc::UnboundedSender<OrderBookMessage>, Backlog, Arc<Notify>);

/// Live state of one pair task
struct PairHandle {
    queue: mpsc::UnboundedSender<OrderBookMessage>,
    backlog: Backlog,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

/// State shared by the tracker, its router and its listener
struct Shared {
    exchange_name: String,
    config: TrackerConfig,
    tracked: TrackedPairs,
    books: Arc<RwLock<OrderBookRegistry>>,
    pairs: StdMutex<HashMap<String, PairHandle>>,
    advisories: AdvisoryBus,
    trades: mpsc::UnboundedSender<OrderBookMessage>,
}

impl Shared {
    /// Queue, backlog and wake handle of `trading_pair`, creating its book and task
    /// on first use. `None` once the pair is no longer tracked.
    async fn pair(&self, trading_pair: &str) -> Option<PairInput> {
        let existing = self
            .lock_pairs()
            .get(trading_pair)
            .map(|handle| (handle.queue.clone(), handle.backlog.clone(), handle.wake.clone()));
        if existing.is_some() {
            return existing;
        }

        // Registration and untracking both hold the registry write lock, so a pair
        // removed since the caller checked is never brought back
        let mut books = self.books.write().await;
        if !self.tracked.contains(trading_pair).await {
            return None;
        }
        let book = books.register(trading_pair);

        let mut pairs = self.lock_pairs();
        let handle = pairs.entry(trading_pair.to_string()).or_insert_with(|| {
            let (queue, rx) = mpsc::unbounded_channel();
            let backlog: Backlog = Arc::new(Mutex::new(VecDeque::new()));
            let wake = Arc::new(Notify::new());
            let task = tokio::spawn(run_pair(PairTask {
                exchange_name: self.exchange_name.clone(),
                trading_pair: trading_pair.to_string(),
                config: self.config.clone(),
                book,
                queue: rx,
                backlog: backlog.clone(),
                wake: wake.clone(),
                advisories: self.advisories.clone(),
                trades: self.trades.clone(),
            }));
            info!(exchange = %self.exchange_name, trading_pair, "Tracking order book");
            PairHandle {
                queue,
                backlog,
                wake,
                task,
            }
        });
        Some((handle.queue.clone(), handle.backlog.clone(), handle.wake.clone()))
    }

    fn lock_pairs(&self) -> std::sync::MutexGuard<'_, HashMap<String, PairHandle>> {
        self.pairs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn abort_pairs(&self) {
        for (_, handle) in self.lock_pairs().drain() {
            handle.task.abort();
        }
    }

    async fn untrack(&self, trading_pair: &str) {
        let mut books = self.books.write().await;
        let handle = self.lock_pairs().remove(trading_pair);
        if let Some(handle) = handle {
            handle.task.abort();
        }
        books.remove(trading_pair);
        info!(exchange = %self.exchange_name, trading_pair, "Stopped tracking order book");
    }
}

/// Keeps one synchronized order book per tracked pair of an exchange
pub struct OrderBookTracker {
    shared: Arc<Shared>,
    data_source: Arc<OrderBookDataSource>,
    trade_stream: Option<mpsc::UnboundedReceiver<OrderBookMessage>>,
    tasks: Vec<JoinHandle<()>>,
}

impl OrderBookTracker {
    /// Create a tracker. Nothing runs until [`start`](Self::start).
    pub fn new(
        exchange_name: &str,
        data_source: OrderBookDataSource,
        trading_pairs: Vec<String>,
        config: TrackerConfig,
    ) -> Self {
        let (trades, trade_stream) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                exchange_name: exchange_name.to_string(),
                config,
                tracked: TrackedPairs::new(trading_pairs),
                books: Arc::new(RwLock::new(OrderBookRegistry::new())),
                pairs: StdMutex::new(HashMap::new()),
                advisories: AdvisoryBus::default(),
                trades,
            }),
            data_source: Arc::new(data_source),
            trade_stream: Some(trade_stream),
            tasks: Vec::new(),
        }
    }

    /// Spawn the listener and router tasks. A running tracker is restarted.
    pub async fn start(&mut self) {
        self.stop().await;

        let (input, rx) = mpsc::unbounded_channel();
        self.tasks.push(tokio::spawn(run_listener(
            self.data_source.clone(),
            self.shared.clone(),
            input,
        )));
        self.tasks.push(tokio::spawn(run_router(self.shared.clone(), rx)));

        info!(
            exchange = %self.shared.exchange_name,
            data_source = ?self.data_source.kind(),
            trading_pairs = ?self.shared.tracked.to_vec().await,
            "Order book tracker started"
        );
    }

    /// Cancel every task and drop all per-pair state
    pub async fn stop(&mut self) {
        let was_running = !self.tasks.is_empty();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.shared.abort_pairs();
        self.shared.books.write().await.clear();
        if was_running {
            info!(exchange = %self.shared.exchange_name, "Order book tracker stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }

    pub fn exchange_name(&self) -> &str {
        &self.shared.exchange_name
    }

    /// Read-only views of every book created so far
    pub async fn order_books(&self) -> HashMap<String, OrderBookView> {
        self.shared.books.read().await.views()
    }

    pub async fn order_book(&self, trading_pair: &str) -> Option<OrderBookView> {
        self.shared.books.read().await.view(trading_pair)
    }

    /// Cloneable read handle for other tasks
    pub fn reader(&self) -> OrderBookReader {
        OrderBookReader::new(self.shared.books.clone())
    }

    pub async fn trading_pairs(&self) -> Vec<String> {
        self.shared.tracked.to_vec().await
    }

    /// Queue a message on its pair's backlog. The pair task drains the backlog
    /// before reading live messages.
    pub async fn save_message(&self, message: OrderBookMessage) -> Result<()> {
        let trading_pair = message.trading_pair().to_string();
        let (_, backlog, wake) = match self.shared.pair(&trading_pair).await {
            Some(input) => input,
            None => return Err(SyncError::OrderBook(format!("{} is not tracked", trading_pair))),
        };
        {
            let mut backlog = backlog.lock().await;
            if backlog.len() >= self.shared.config.saved_message_capacity {
                backlog.pop_front();
                warn!(trading_pair = %trading_pair, "Saved message backlog full, dropping oldest");
            }
            backlog.push_back(message);
        }
        wake.notify_one();
        Ok(())
    }

    /// Replace the tracked pairs. State of removed pairs is dropped; added pairs get
    /// a book on their first message.
    pub async fn update_trading_pairs(&self, trading_pairs: Vec<String>) {
        let (added, removed) = self.shared.tracked.replace(trading_pairs).await;
        for trading_pair in &removed {
            self.shared.untrack(trading_pair).await;
        }
        if !added.is_empty() || !removed.is_empty() {
            info!(
                exchange = %self.shared.exchange_name,
                added = ?added,
                removed = ?removed,
                "Trading pairs updated"
            );
        }
    }

    /// Trades applied to any book. Only the first caller gets the stream.
    pub fn take_trade_stream(&mut self) -> Option<mpsc::UnboundedReceiver<OrderBookMessage>> {
        self.trade_stream.take()
    }

    pub fn advisories(&self) -> &AdvisoryBus {
        &self.shared.advisories
    }
}

impl Drop for OrderBookTracker {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.shared.abort_pairs();
    }
}

async fn run_listener(
    data_source: Arc<OrderBookDataSource>,
    shared: Arc<Shared>,
    input: mpsc::UnboundedSender<OrderBookMessage>,
) {
    loop {
        match data_source.listen(&shared.tracked, &input).await {
            Ok(()) => {
                info!(exchange = %shared.exchange_name, "Order book data source finished");
                return;
            }
            Err(SyncError::Cancelled) => return,
            Err(e) => {
                let backoff = shared.config.error_backoff;
                shared.advisories.network_fault(
                    "order_book_data_source",
                    &e,
                    &format!(
                        "Unexpected error listening for {} order book messages. Retrying after {} seconds.",
                        shared.exchange_name,
                        backoff.as_secs()
                    ),
                );
                sleep(backoff).await;
            }
        }
    }
}

async fn run_router(shared: Arc<Shared>, mut input: mpsc::UnboundedReceiver<OrderBookMessage>) {
    let mut accepted = 0u64;
    let mut rejected = 0u64;
    let mut last_report = Instant::now();

    while let Some(message) = input.recv().await {
        let trading_pair = message.trading_pair().to_string();
        let input = if shared.tracked.contains(&trading_pair).await {
            shared.pair(&trading_pair).await
        } else {
            None
        };
        if let Some((queue, _, _)) = input {
            if queue.send(message).is_err() {
                warn!(trading_pair = %trading_pair, "Pair task is gone, dropping message");
            }
            accepted += 1;
        } else {
            metrics::global()
                .messages_rejected
                .with_label_values(&[&shared.exchange_name, "untracked"])
                .inc();
            rejected += 1;
        }

        if last_report.elapsed() >= shared.config.report_interval {
            info!(
                exchange = %shared.exchange_name,
                accepted,
                rejected,
                "Routed order book messages"
            );
            accepted = 0;
            rejected = 0;
            last_report = Instant::now();
        }
    }
    debug!(exchange = %shared.exchange_name, "Order book router input closed");
}

/// Everything a pair task needs. Holds no reference back to the tracker.
struct PairTask {
    exchange_name: String,
    trading_pair: String,
    config: TrackerConfig,
    book: Arc<RwLock<OrderBook>>,
    queue: mpsc::UnboundedReceiver<OrderBookMessage>,
    backlog: Backlog,
    wake: Arc<Notify>,
    advisories: AdvisoryBus,
    trades: mpsc::UnboundedSender<OrderBookMessage>,
}

impl PairTask {
    /// Backlog first, then the live queue
    async fn next_message(&mut self) -> Option<OrderBookMessage> {
        loop {
            if let Some(message) = self.backlog.lock().await.pop_front() {
                return Some(message);
            }
            tokio::select! {
                biased;
                _ = self.wake.notified() => continue,
                message = self.queue.recv() => return message,
            }
        }
    }
}

async fn run_pair(mut task: PairTask) {
    let mut sync = PairSynchronizer::new(&task.trading_pair, task.config.past_diff_window_size);
    let exchange_name = task.exchange_name.clone();
    let trading_pair = task.trading_pair.clone();
    let labels = [exchange_name.as_str(), trading_pair.as_str()];
    let mut diffs_processed = 0u64;
    let mut last_report = Instant::now();

    while let Some(message) = task.next_message().await {
        let result = {
            let mut book = task.book.write().await;
            sync.process(&mut book, &message)
        };

        match result {
            Ok(Applied::Diff) | Ok(Applied::OutOfOrder) | Ok(Applied::Rebuilt { .. }) => {
                metrics::global().diffs_applied.with_label_values(&labels).inc();
                diffs_processed += 1;
            }
            Ok(Applied::Snapshot { replayed }) => {
                metrics::global().snapshots_applied.with_label_values(&labels).inc();
                debug!(
                    trading_pair = %task.trading_pair,
                    update_id = message.update_id(),
                    replayed,
                    "Processed order book snapshot"
                );
            }
            Ok(Applied::Trade) => {
                // Nobody listening is fine
                let _ = task.trades.send(message);
            }
            Ok(Applied::Duplicate) => reject(&task.exchange_name, "duplicate"),
            Ok(Applied::Stale(message_type)) => reject(
                &task.exchange_name,
                match message_type {
                    OrderBookMessageType::Snapshot => "stale_snapshot",
                    _ => "stale_diff",
                },
            ),
            Err(e) => {
                let backoff = task.config.error_backoff;
                task.advisories.network_fault(
                    "order_book_tracker",
                    &e,
                    &format!(
                        "Unexpected error processing order book messages for {}. Retrying after {} seconds.",
                        task.trading_pair,
                        backoff.as_secs()
                    ),
                );
                sleep(backoff).await;
            }
        }

        if last_report.elapsed() >= task.config.report_interval {
            info!(
                trading_pair = %task.trading_pair,
                diffs = diffs_processed,
                "Processed order book diffs"
            );
            diffs_processed = 0;
            last_report = Instant::now();
        }
    }
    debug!(trading_pair = %task.trading_pair, "Pair queue closed");
}

fn reject(exchange_name: &str, reason: &str) {
    metrics::global()
        .messages_rejected
        .with_label_values(&[exchange_name, reason])
        .inc();
}
