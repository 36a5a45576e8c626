//! Order book data sources
//!
//! One variant per transport, chosen once from configuration. Each source pushes
//! normalized [`OrderBookMessage`]s into the tracker's input channel.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::interval;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::message::OrderBookMessage;
use crate::parser::parse_message;
use crate::throttler::AsyncThrottler;

/// Throttler path charged for every REST snapshot request
pub const SNAPSHOT_PATH: &str = "/snapshot";

/// Transport selector read from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourceKind {
    Channel,
    Rest,
}

impl FromStr for DataSourceKind {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "channel" => Ok(DataSourceKind::Channel),
            "rest" => Ok(DataSourceKind::Rest),
            other => Err(SyncError::UnsupportedDataSource(other.to_string())),
        }
    }
}

/// Trading pairs a tracker currently follows, shared with its data source
#[derive(Debug, Clone, Default)]
pub struct TrackedPairs {
    pairs: Arc<RwLock<BTreeSet<String>>>,
}

impl TrackedPairs {
    pub fn new<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pairs: Arc::new(RwLock::new(pairs.into_iter().map(Into::into).collect())),
        }
    }

    pub async fn contains(&self, trading_pair: &str) -> bool {
        self.pairs.read().await.contains(trading_pair)
    }

    pub async fn to_vec(&self) -> Vec<String> {
        self.pairs.read().await.iter().cloned().collect()
    }

    /// Swap in a new set, returning the (added, removed) pairs
    pub async fn replace(&self, pairs: Vec<String>) -> (Vec<String>, Vec<String>) {
        let next: BTreeSet<String> = pairs.into_iter().collect();
        let mut current = self.pairs.write().await;
        let added = next.difference(&current).cloned().collect();
        let removed = current.difference(&next).cloned().collect();
        *current = next;
        (added, removed)
    }
}

/// Where a tracker's messages come from
#[derive(Debug, Clone)]
pub enum OrderBookDataSource {
    Channel(ChannelDataSource),
    RestSnapshots(RestSnapshotSource),
}

impl OrderBookDataSource {
    pub fn kind(&self) -> DataSourceKind {
        match self {
            OrderBookDataSource::Channel(_) => DataSourceKind::Channel,
            OrderBookDataSource::RestSnapshots(_) => DataSourceKind::Rest,
        }
    }

    /// Forward messages into `output`.
    ///
    /// Returns `Ok(())` once the source is exhausted. Errors are recoverable and the
    /// caller is expected to back off and listen again.
    pub async fn listen(
        &self,
        trading_pairs: &TrackedPairs,
        output: &mpsc::UnboundedSender<OrderBookMessage>,
    ) -> Result<()> {
        match self {
            OrderBookDataSource::Channel(source) => source.listen(output).await,
            OrderBookDataSource::RestSnapshots(source) => source.listen(trading_pairs, output).await,
        }
    }
}

/// In-process source fed through a [`MessageFeed`]
#[derive(Debug, Clone)]
pub struct ChannelDataSource {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<OrderBookMessage>>>,
}

/// Producer side of a [`ChannelDataSource`]
#[derive(Debug, Clone)]
pub struct MessageFeed {
    tx: mpsc::UnboundedSender<OrderBookMessage>,
}

impl ChannelDataSource {
    pub fn new() -> (Self, MessageFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx: Arc::new(Mutex::new(rx)),
            },
            MessageFeed { tx },
        )
    }

    async fn listen(&self, output: &mpsc::UnboundedSender<OrderBookMessage>) -> Result<()> {
        let mut rx = self.rx.lock().await;
        while let Some(message) = rx.recv().await {
            output
                .send(message)
                .map_err(|_| SyncError::ChannelClosed("order book input".to_string()))?;
        }
        info!("Message feed closed");
        Ok(())
    }
}

impl MessageFeed {
    pub fn send(&self, message: OrderBookMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| SyncError::ChannelClosed("message feed".to_string()))
    }

    /// Parse a normalized JSON frame and send it
    pub fn send_raw(&self, raw: &str) -> Result<()> {
        self.send(parse_message(raw)?)
    }
}

/// Polls a REST endpoint for normalized snapshots of every tracked pair
#[derive(Debug, Clone)]
pub struct RestSnapshotSource {
    client: reqwest::Client,
    endpoint: String,
    throttler: AsyncThrottler,
    poll_interval: Duration,
}

impl RestSnapshotSource {
    pub fn new(endpoint: &str, throttler: AsyncThrottler, poll_interval: Duration) -> Result<Self> {
        if endpoint.trim().is_empty() {
            return Err(SyncError::MissingArgument("rest_endpoint"));
        }
        if poll_interval.is_zero() {
            return Err(SyncError::Config("snapshot poll interval must be positive".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            throttler,
            poll_interval,
        })
    }

    async fn listen(
        &self,
        trading_pairs: &TrackedPairs,
        output: &mpsc::UnboundedSender<OrderBookMessage>,
    ) -> Result<()> {
        let mut ticker = interval(self.poll_interval);
        loop {
            ticker.tick().await;
            for trading_pair in trading_pairs.to_vec().await {
                let snapshot = self.fetch_snapshot(&trading_pair).await?;
                output
                    .send(snapshot)
                    .map_err(|_| SyncError::ChannelClosed("order book input".to_string()))?;
            }
        }
    }

    /// Fetch one snapshot, waiting for throttler capacity first
    pub async fn fetch_snapshot(&self, trading_pair: &str) -> Result<OrderBookMessage> {
        let url = format!("{}{}", self.endpoint, SNAPSHOT_PATH);
        debug!(trading_pair, url = %url, "Fetching order book snapshot");

        let body = self
            .throttler
            .execute(SNAPSHOT_PATH, async {
                self.client
                    .get(&url)
                    .query(&[("trading_pair", trading_pair)])
                    .send()
                    .await?
                    .error_for_status()?
                    .text()
                    .await
            })
            .await??;

        let message = parse_message(&body)?;
        if message.trading_pair() != trading_pair {
            return Err(SyncError::InvalidMessage(format!(
                "requested {} snapshot, received {}",
                trading_pair,
                message.trading_pair()
            )));
        }
        Ok(message)
    }
}
