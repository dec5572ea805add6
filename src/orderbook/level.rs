use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use serde::Serialize;
use std::sync::Arc;

use crate::pool::{ObjectPool, Poolable};

pub type Price = OrderedFloat<f64>;

pub type LevelPool = ObjectPool<BookLevel>;

/// One price level on one side of a book.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
    pub is_bid: bool,
    pub provider_id: Option<Arc<str>>,
    pub symbol: Option<Arc<str>>,
    pub entry_id: u64,
    pub local_timestamp: DateTime<Utc>,
    pub server_timestamp: DateTime<Utc>,
    /// Visible part of `size` for venues that hide liquidity
    pub active_size: Option<f64>,
}

impl BookLevel {
    /// Field-copy `other` into `self`. Only refcounts are touched, nothing is allocated.
    #[inline]
    pub fn copy_from(&mut self, other: &BookLevel) {
        self.price = other.price;
        self.size = other.size;
        self.is_bid = other.is_bid;
        self.provider_id.clone_from(&other.provider_id);
        self.symbol.clone_from(&other.symbol);
        self.entry_id = other.entry_id;
        self.local_timestamp = other.local_timestamp;
        self.server_timestamp = other.server_timestamp;
        self.active_size = other.active_size;
    }

    /// Overwrite size and timestamps from an incoming update.
    #[inline]
    pub fn apply(&mut self, update: &LevelUpdate, size: f64) {
        self.size = size;
        self.active_size = update.active_size;
        self.local_timestamp = update.local_timestamp;
        self.server_timestamp = update.server_timestamp;
        if update.entry_id != 0 {
            self.entry_id = update.entry_id;
        }
    }

    #[inline]
    pub fn key(&self) -> Price {
        Price::from(self.price)
    }
}

impl Poolable for BookLevel {
    fn reset(&mut self) {
        self.price = 0.0;
        self.size = 0.0;
        self.is_bid = false;
        self.provider_id = None;
        self.symbol = None;
        self.entry_id = 0;
        self.local_timestamp = DateTime::<Utc>::default();
        self.server_timestamp = DateTime::<Utc>::default();
        self.active_size = None;
    }
}

/// A level as delivered by a venue adapter. Price and size may be missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LevelUpdate {
    pub price: Option<f64>,
    pub size: Option<f64>,
    pub is_bid: bool,
    pub entry_id: u64,
    pub local_timestamp: DateTime<Utc>,
    pub server_timestamp: DateTime<Utc>,
    pub active_size: Option<f64>,
}

impl LevelUpdate {
    pub fn bid(price: f64, size: f64) -> Self {
        Self::new(price, size, true)
    }

    pub fn ask(price: f64, size: f64) -> Self {
        Self::new(price, size, false)
    }

    pub fn new(price: f64, size: f64, is_bid: bool) -> Self {
        Self {
            price: Some(price),
            size: Some(size),
            is_bid,
            local_timestamp: Utc::now(),
            ..Default::default()
        }
    }

    pub fn with_server_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.server_timestamp = ts;
        self
    }

    /// `(price, size)` if both are present and well-formed, `None` otherwise.
    #[inline]
    pub fn validated(&self) -> Option<(f64, f64)> {
        let price = self.price?;
        let size = self.size?;
        if !price.is_finite() || price <= 0.0 || !size.is_finite() || size < 0.0 {
            return None;
        }
        Some((price, size))
    }
}

/// Running total of size from the best level through `price`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CumulativeLevel {
    pub price: f64,
    pub size: f64,
}
