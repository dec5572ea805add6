use std::sync::Arc;

use super::level::{BookLevel, CumulativeLevel, LevelPool};
use super::manager::{copy_ladder, BookStatus, Ladder, Orderbook};
use super::metrics::{self, BookMetrics};

/// Point-in-time copy of an [`Orderbook`] for one consumer.
///
/// Levels are drawn from the book's pool and returned on `reset` or drop.
/// The master's lock is held only while copying, so a consumer can take as
/// long as it likes over the copy. Reusing one snapshot across
/// `update_from` calls keeps its vectors' capacity and allocates nothing.
/// Derived values are computed from the copied levels on access.
pub struct BookSnapshot {
    pool: Arc<LevelPool>,
    symbol: Option<Arc<str>>,
    provider_id: Option<Arc<str>>,
    decimal_places: u32,
    bids: Ladder,
    asks: Ladder,
    update_id: u64,
    status: BookStatus,
    update_count: u64,
}

impl BookSnapshot {
    pub fn new(pool: Arc<LevelPool>) -> Self {
        Self {
            pool,
            symbol: None,
            provider_id: None,
            decimal_places: 0,
            bids: Vec::new(),
            asks: Vec::new(),
            update_id: 0,
            status: BookStatus::Empty,
            update_count: 0,
        }
    }

    /// Replace this copy's contents with `master`'s current state.
    pub fn update_from(&mut self, master: &Orderbook) {
        self.symbol = Some(master.symbol().clone());
        self.provider_id = Some(master.provider_id().clone());
        self.decimal_places = master.decimal_places();

        let state = master.lock_state();
        self.update_id = state.last_applied_update_id;
        self.status = state.status;
        copy_ladder(&mut self.bids, &state.bids, &self.pool);
        copy_ladder(&mut self.asks, &state.asks, &self.pool);
        drop(state);

        self.update_count = master.update_count();
    }

    /// Return every held level to the pool. Safe to call repeatedly.
    pub fn reset(&mut self) {
        self.pool.put_all(&mut self.bids);
        self.pool.put_all(&mut self.asks);
        self.update_id = 0;
        self.status = BookStatus::Empty;
    }

    pub fn symbol(&self) -> Option<&str> {
        self.symbol.as_deref()
    }

    pub fn provider_id(&self) -> Option<&str> {
        self.provider_id.as_deref()
    }

    pub fn decimal_places(&self) -> u32 {
        self.decimal_places
    }

    /// Bids, best first
    pub fn bids(&self) -> impl ExactSizeIterator<Item = &BookLevel> {
        self.bids.iter().map(|level| &**level)
    }

    /// Asks, best first
    pub fn asks(&self) -> impl ExactSizeIterator<Item = &BookLevel> {
        self.asks.iter().map(|level| &**level)
    }

    pub fn update_id(&self) -> u64 {
        self.update_id
    }

    pub fn status(&self) -> BookStatus {
        self.status
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn top_of_book(&self, is_bid: bool) -> Option<&BookLevel> {
        let ladder = if is_bid { &self.bids } else { &self.asks };
        ladder.first().map(|level| &**level)
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|level| level.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|level| level.price)
    }

    pub fn mid_price(&self) -> f64 {
        metrics::mid_price(self.best_bid(), self.best_ask())
    }

    pub fn spread(&self) -> f64 {
        metrics::spread(self.best_bid(), self.best_ask())
    }

    pub fn imbalance(&self) -> f64 {
        metrics::imbalance(self.bid_volume(), self.ask_volume())
    }

    pub fn depth_imbalance(&self, depth: usize) -> f64 {
        metrics::depth_imbalance(&self.bids, &self.asks, depth)
    }

    pub fn bid_volume(&self) -> f64 {
        metrics::volume(&self.bids, usize::MAX)
    }

    pub fn ask_volume(&self) -> f64 {
        metrics::volume(&self.asks, usize::MAX)
    }

    /// Running sums for one side written into `out` (cleared first)
    pub fn cumulative_into(&self, is_bid: bool, out: &mut Vec<CumulativeLevel>) {
        let ladder = if is_bid { &self.bids } else { &self.asks };
        out.clear();
        metrics::rebuild_cumulative(ladder, out, 0);
    }

    pub fn metrics(&self) -> BookMetrics {
        let (bid, ask) = (self.best_bid(), self.best_ask());
        BookMetrics {
            best_bid: bid,
            best_ask: ask,
            mid_price: metrics::mid_price(bid, ask),
            spread: metrics::spread(bid, ask),
            spread_bps: metrics::spread_bps(bid, ask),
            imbalance: self.imbalance(),
            bid_volume: self.bid_volume(),
            ask_volume: self.ask_volume(),
            bid_levels: self.bids.len(),
            ask_levels: self.asks.len(),
            update_id: self.update_id,
        }
    }
}

impl Drop for BookSnapshot {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::LevelUpdate;

    fn loaded_book(pool: &Arc<LevelPool>) -> Orderbook {
        let ob = Orderbook::new("BTCUSDT", "sim", pool.clone());
        ob.apply_snapshot(
            &[LevelUpdate::ask(101.0, 2.0), LevelUpdate::ask(102.0, 3.0)],
            &[LevelUpdate::bid(100.0, 4.0), LevelUpdate::bid(99.0, 1.0)],
            7,
        );
        ob
    }

    #[test]
    fn test_snapshot_matches_master() {
        let pool = Arc::new(LevelPool::new(64));
        let ob = loaded_book(&pool);

        let snapshot = ob.snapshot();
        assert_eq!(snapshot.symbol(), Some("BTCUSDT"));
        assert_eq!(snapshot.update_id(), 7);
        assert_eq!(snapshot.metrics(), ob.metrics());
        assert_eq!(snapshot.top_of_book(true).map(|l| l.price), Some(100.0));
        assert_eq!(
            snapshot.asks().map(|l| l.price).collect::<Vec<_>>(),
            vec![101.0, 102.0]
        );

        let mut cumulative = Vec::new();
        snapshot.cumulative_into(true, &mut cumulative);
        assert_eq!(cumulative, ob.bid_cumulative());
    }

    #[test]
    fn test_snapshot_is_independent() {
        let pool = Arc::new(LevelPool::new(64));
        let ob = loaded_book(&pool);
        let snapshot = ob.snapshot();

        ob.add_or_update_level(&LevelUpdate::bid(100.0, 0.0));
        ob.add_or_update_level(&LevelUpdate::ask(100.5, 1.0));

        assert_eq!(snapshot.best_bid(), Some(100.0));
        assert_eq!(snapshot.best_ask(), Some(101.0));
        assert_eq!(snapshot.mid_price(), 100.5);
        assert_ne!(ob.best_bid_ask(), (snapshot.best_bid(), snapshot.best_ask()));
    }

    #[test]
    fn test_reset_and_drop_return_levels() {
        let pool = Arc::new(LevelPool::new(64));
        let ob = loaded_book(&pool);
        assert_eq!(pool.in_use(), 4);

        let mut snapshot = ob.snapshot();
        assert_eq!(pool.in_use(), 8);

        snapshot.reset();
        snapshot.reset();
        assert_eq!(pool.in_use(), 4);
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.mid_price(), 0.0);

        snapshot.update_from(&ob);
        snapshot.update_from(&ob);
        assert_eq!(pool.in_use(), 8);

        drop(snapshot);
        assert_eq!(pool.in_use(), 4);
    }

    #[test]
    fn test_concurrent_snapshots() {
        let pool = Arc::new(LevelPool::new(1024));
        let ob = loaded_book(&pool);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let mut snapshot = BookSnapshot::new(pool.clone());
                    for _ in 0..1_000 {
                        snapshot.update_from(&ob);
                        assert_eq!(snapshot.bids().len(), 2);
                        assert_eq!(snapshot.asks().len(), 2);
                        assert_eq!(snapshot.mid_price(), 100.5);
                    }
                });
            }
        });

        assert_eq!(pool.in_use(), 4);
    }
}
