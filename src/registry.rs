use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

use crate::error::{EngineError, Result};
use crate::orderbook::{BookSettings, LevelPool, Orderbook};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BookKey {
    pub symbol: Arc<str>,
    pub provider_id: Arc<str>,
}

impl BookKey {
    pub fn new(symbol: &str, provider_id: &str) -> Self {
        Self {
            symbol: Arc::from(symbol),
            provider_id: Arc::from(provider_id),
        }
    }
}

/// Owns one [`Orderbook`] per (symbol, venue).
///
/// Books are created on first subscription and torn down, with every level
/// returned to the shared pool, on unsubscribe or venue disconnect.
pub struct BookRegistry {
    pool: Arc<LevelPool>,
    settings: BookSettings,
    books: DashMap<BookKey, Arc<Orderbook>>,
}

impl BookRegistry {
    pub fn new(pool: Arc<LevelPool>, settings: BookSettings) -> Self {
        Self {
            pool,
            settings,
            books: DashMap::new(),
        }
    }

    pub fn pool(&self) -> &Arc<LevelPool> {
        &self.pool
    }

    /// Book for (symbol, venue), created if this is the first subscription
    pub fn subscribe(&self, symbol: &str, provider_id: &str) -> Arc<Orderbook> {
        self.subscribe_with(symbol, provider_id, self.settings)
    }

    /// Like `subscribe`, with per-book settings (e.g. decimal places) for a new book
    pub fn subscribe_with(&self, symbol: &str, provider_id: &str, settings: BookSettings) -> Arc<Orderbook> {
        let key = BookKey::new(symbol, provider_id);
        self.books
            .entry(key.clone())
            .or_insert_with(|| {
                info!(symbol, provider = provider_id, decimals = settings.decimal_places, "Book created");
                Arc::new(Orderbook::with_settings(
                    key.symbol,
                    key.provider_id,
                    settings,
                    self.pool.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, symbol: &str, provider_id: &str) -> Result<Arc<Orderbook>> {
        self.books
            .get(&BookKey::new(symbol, provider_id))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::UnknownBook {
                symbol: symbol.to_string(),
                provider_id: provider_id.to_string(),
            })
    }

    /// Remove the book and return its levels to the pool.
    ///
    /// Other holders of the `Arc` see an empty book from here on.
    pub fn unsubscribe(&self, symbol: &str, provider_id: &str) -> Result<()> {
        let (_, book) = self
            .books
            .remove(&BookKey::new(symbol, provider_id))
            .ok_or_else(|| EngineError::UnknownBook {
                symbol: symbol.to_string(),
                provider_id: provider_id.to_string(),
            })?;

        book.clear();
        info!(symbol, provider = provider_id, "Book removed");
        Ok(())
    }

    /// Tear down every book of one venue. Returns how many were removed.
    pub fn disconnect_venue(&self, provider_id: &str) -> usize {
        let keys: Vec<BookKey> = self
            .books
            .iter()
            .filter(|entry| &*entry.key().provider_id == provider_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in keys {
            if let Some((_, book)) = self.books.remove(&key) {
                book.clear();
                removed += 1;
            }
        }

        info!(provider = provider_id, removed, "Venue disconnected");
        removed
    }

    pub fn books(&self) -> Vec<Arc<Orderbook>> {
        self.books.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}
