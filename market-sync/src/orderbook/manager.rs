//! Order book registry
//!
//! Explicit per-pair registry of shared books. Entries are only created through
//! [`OrderBookRegistry::register`]; lookups never insert.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard};

use super::{OrderBook, OrderBookState};

/// Read-only handle on a pair's book for strategy consumers
#[derive(Debug, Clone)]
pub struct OrderBookView {
    book: Arc<RwLock<OrderBook>>,
}

impl OrderBookView {
    pub async fn read(&self) -> RwLockReadGuard<'_, OrderBook> {
        self.book.read().await
    }

    /// Depth-limited copy of the current state
    pub async fn state(&self, depth: usize) -> OrderBookState {
        self.book.read().await.state(depth)
    }
}

/// Cloneable read side of a shared registry
#[derive(Debug, Clone)]
pub struct OrderBookReader {
    registry: Arc<RwLock<OrderBookRegistry>>,
}

impl OrderBookReader {
    pub fn new(registry: Arc<RwLock<OrderBookRegistry>>) -> Self {
        Self { registry }
    }

    pub async fn view(&self, trading_pair: &str) -> Option<OrderBookView> {
        self.registry.read().await.view(trading_pair)
    }

    pub async fn views(&self) -> HashMap<String, OrderBookView> {
        self.registry.read().await.views()
    }

    /// Depth-limited state of every book, sorted by trading pair
    pub async fn states(&self, depth: usize) -> Vec<OrderBookState> {
        let mut views: Vec<_> = self.views().await.into_iter().collect();
        views.sort_by(|a, b| a.0.cmp(&b.0));

        let mut states = Vec::with_capacity(views.len());
        for (_, view) in views {
            states.push(view.state(depth).await);
        }
        states
    }
}

/// Shared books for every tracked pair
#[derive(Debug, Default)]
pub struct OrderBookRegistry {
    books: HashMap<String, Arc<RwLock<OrderBook>>>,
}

impl OrderBookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the book for `trading_pair`, returning the writer handle.
    /// An existing book is kept and its handle returned.
    pub fn register(&mut self, trading_pair: &str) -> Arc<RwLock<OrderBook>> {
        self.books
            .entry(trading_pair.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(OrderBook::new(trading_pair))))
            .clone()
    }

    pub fn view(&self, trading_pair: &str) -> Option<OrderBookView> {
        self.books.get(trading_pair).map(|book| OrderBookView {
            book: book.clone(),
        })
    }

    pub fn views(&self) -> HashMap<String, OrderBookView> {
        self.books
            .iter()
            .map(|(pair, book)| (pair.clone(), OrderBookView { book: book.clone() }))
            .collect()
    }

    pub fn remove(&mut self, trading_pair: &str) -> bool {
        self.books.remove(trading_pair).is_some()
    }

    pub fn clear(&mut self) {
        self.books.clear();
    }

    pub fn contains(&self, trading_pair: &str) -> bool {
        self.books.contains_key(trading_pair)
    }

    /// Get list of pairs being tracked
    pub fn trading_pairs(&self) -> Vec<String> {
        self.books.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_does_not_create_entries() {
        let mut registry = OrderBookRegistry::new();
        assert!(registry.view("ETH-USD").is_none());
        assert!(registry.is_empty());

        registry.register("ETH-USD");
        let view = registry.view("ETH-USD").unwrap();
        assert_eq!(view.read().await.trading_pair(), "ETH-USD");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_register_keeps_existing_book() {
        let mut registry = OrderBookRegistry::new();
        let first = registry.register("ETH-USD");
        let second = registry.register("ETH-USD");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(registry.remove("ETH-USD"));
        assert!(!registry.contains("ETH-USD"));
    }

    #[tokio::test]
    async fn test_reader_states_are_sorted() {
        let registry = Arc::new(RwLock::new(OrderBookRegistry::new()));
        {
            let mut registry = registry.write().await;
            registry.register("SOL-USD");
            registry.register("BTC-USD");
        }

        let reader = OrderBookReader::new(registry.clone());
        let pairs: Vec<String> = reader
            .states(5)
            .await
            .into_iter()
            .map(|state| state.trading_pair)
            .collect();
        assert_eq!(pairs, vec!["BTC-USD".to_string(), "SOL-USD".to_string()]);
        assert!(reader.view("ETH-USD").await.is_none());
    }
}
