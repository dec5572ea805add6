use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{trace, warn};

use super::level::{BookLevel, CumulativeLevel, LevelPool, LevelUpdate, Price};
use super::metrics::{self, BookMetrics};
use super::snapshot::BookSnapshot;
use crate::notify::{BookUpdate, Notifier, Subscription, UpdateKind};
use crate::pool::Pooled;

pub type Ladder = Vec<Pooled<BookLevel>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BookStatus {
    /// Nothing loaded yet, or cleared
    Empty,
    Live,
    /// A sequence gap was detected; waiting for a fresh snapshot
    Stale,
}

#[derive(Debug, Clone, Copy)]
pub struct BookSettings {
    pub decimal_places: u32,
    pub notify_capacity: usize,
    pub slow_snapshot_us: u64,
    pub slow_delta_us: u64,
    pub slow_batch_us: u64,
}

impl Default for BookSettings {
    fn default() -> Self {
        Self {
            decimal_places: 2,
            notify_capacity: 1024,
            slow_snapshot_us: 100,
            slow_delta_us: 50,
            slow_batch_us: 500,
        }
    }
}

/// Everything guarded by the book's lock
pub(crate) struct BookState {
    pub(crate) bids: Ladder,
    pub(crate) asks: Ladder,
    pub(crate) bid_cumulative: Vec<CumulativeLevel>,
    pub(crate) ask_cumulative: Vec<CumulativeLevel>,
    pub(crate) bid_volume: f64,
    pub(crate) ask_volume: f64,
    pub(crate) mid_price: f64,
    pub(crate) spread: f64,
    pub(crate) imbalance: f64,
    pub(crate) last_applied_update_id: u64,
    pub(crate) status: BookStatus,
}

impl BookState {
    fn new() -> Self {
        Self {
            bids: Vec::new(),
            asks: Vec::new(),
            bid_cumulative: Vec::new(),
            ask_cumulative: Vec::new(),
            bid_volume: 0.0,
            ask_volume: 0.0,
            mid_price: 0.0,
            spread: 0.0,
            imbalance: 0.0,
            last_applied_update_id: 0,
            status: BookStatus::Empty,
        }
    }

    #[inline]
    fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|level| level.price)
    }

    #[inline]
    fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|level| level.price)
    }

    /// Bids descend, asks ascend
    #[inline]
    fn find(ladder: &Ladder, is_bid: bool, price: Price) -> Result<usize, usize> {
        if is_bid {
            ladder.binary_search_by(|level| price.cmp(&level.key()))
        } else {
            ladder.binary_search_by(|level| level.key().cmp(&price))
        }
    }

    fn release_all(&mut self, pool: &LevelPool) {
        pool.put_all(&mut self.bids);
        pool.put_all(&mut self.asks);
        self.bid_cumulative.clear();
        self.ask_cumulative.clear();
        self.bid_volume = 0.0;
        self.ask_volume = 0.0;
        self.recompute_scalars();
    }

    fn load(
        &mut self,
        pool: &LevelPool,
        identity: &Identity,
        asks: &[LevelUpdate],
        bids: &[LevelUpdate],
    ) {
        pool.put_all(&mut self.bids);
        pool.put_all(&mut self.asks);

        fill_ladder(&mut self.bids, pool, identity, bids, true);
        fill_ladder(&mut self.asks, pool, identity, asks, false);

        // Stable sorts, so among equal prices the later input stays later
        self.bids.sort_by(|a, b| b.key().cmp(&a.key()));
        self.asks.sort_by(|a, b| a.key().cmp(&b.key()));
        compact(&mut self.bids, pool);
        compact(&mut self.asks, pool);

        self.recompute_side(true, 0);
        self.recompute_side(false, 0);
        self.recompute_scalars();
        self.status = BookStatus::Live;
    }

    /// Insert, update or remove one level. Returns false if nothing changed.
    fn upsert(
        &mut self,
        pool: &LevelPool,
        identity: &Identity,
        update: &LevelUpdate,
        is_delete: bool,
    ) -> bool {
        let Some(price) = update.price.filter(|p| p.is_finite() && *p > 0.0) else {
            trace!(symbol = %identity.symbol, "Dropping level update without a valid price");
            return false;
        };

        let size = if is_delete {
            0.0
        } else {
            match update.validated() {
                Some((_, size)) => size,
                None => {
                    trace!(symbol = %identity.symbol, price, "Dropping level update without a valid size");
                    return false;
                }
            }
        };

        let is_bid = update.is_bid;
        let ladder = if is_bid { &mut self.bids } else { &mut self.asks };

        let index = match Self::find(ladder, is_bid, Price::from(price)) {
            Ok(index) if size == 0.0 => {
                pool.put(ladder.remove(index));
                index
            }
            Ok(index) => {
                ladder[index].apply(update, size);
                index
            }
            Err(_) if size == 0.0 => return false,
            Err(index) => {
                let mut level = pool.get();
                identity.fill(&mut level, price, size, is_bid, update);
                ladder.insert(index, level);
                index
            }
        };

        self.recompute_side(is_bid, index);
        self.recompute_scalars();
        true
    }

    fn recompute_side(&mut self, is_bid: bool, from: usize) {
        if is_bid {
            self.bid_volume = metrics::rebuild_cumulative(&self.bids, &mut self.bid_cumulative, from);
        } else {
            self.ask_volume = metrics::rebuild_cumulative(&self.asks, &mut self.ask_cumulative, from);
        }
    }

    fn recompute_scalars(&mut self) {
        let (bid, ask) = (self.best_bid(), self.best_ask());
        self.mid_price = metrics::mid_price(bid, ask);
        self.spread = metrics::spread(bid, ask);
        self.imbalance = metrics::imbalance(self.bid_volume, self.ask_volume);
    }

    /// Deep copy of `other`, drawing levels from `pool`.
    pub(crate) fn copy_from(&mut self, other: &BookState, pool: &LevelPool) {
        copy_ladder(&mut self.bids, &other.bids, pool);
        copy_ladder(&mut self.asks, &other.asks, pool);

        self.bid_cumulative.clear();
        self.bid_cumulative.extend_from_slice(&other.bid_cumulative);
        self.ask_cumulative.clear();
        self.ask_cumulative.extend_from_slice(&other.ask_cumulative);

        self.bid_volume = other.bid_volume;
        self.ask_volume = other.ask_volume;
        self.mid_price = other.mid_price;
        self.spread = other.spread;
        self.imbalance = other.imbalance;
        self.last_applied_update_id = other.last_applied_update_id;
        self.status = other.status;
    }
}

/// Return `target`'s levels and refill it with copies of `source`, in order.
pub(crate) fn copy_ladder(target: &mut Ladder, source: &Ladder, pool: &LevelPool) {
    pool.put_all(target);
    target.reserve(source.len());
    for level in source {
        let mut copy = pool.get();
        copy.copy_from(level);
        target.push(copy);
    }
}

fn fill_ladder(
    ladder: &mut Ladder,
    pool: &LevelPool,
    identity: &Identity,
    updates: &[LevelUpdate],
    is_bid: bool,
) {
    ladder.reserve(updates.len());
    for update in updates {
        match update.validated() {
            Some((price, size)) => {
                let mut level = pool.get();
                identity.fill(&mut level, price, size, is_bid, update);
                ladder.push(level);
            }
            None => trace!(symbol = %identity.symbol, "Dropping malformed snapshot level"),
        }
    }
}

/// Collapse runs of equal prices to their last entry, then drop zero sizes.
/// Expects a sorted ladder. Removed levels go back to the pool.
fn compact(ladder: &mut Ladder, pool: &LevelPool) {
    let mut write = 0;
    for read in 0..ladder.len() {
        if write > 0 && ladder[write - 1].price == ladder[read].price {
            ladder.swap(write - 1, read);
        } else {
            ladder.swap(write, read);
            write += 1;
        }
    }

    let mut keep = 0;
    for read in 0..write {
        if ladder[read].size > 0.0 {
            ladder.swap(keep, read);
            keep += 1;
        }
    }

    for level in ladder.drain(keep..) {
        pool.put(level);
    }
}

struct Identity {
    symbol: Arc<str>,
    provider_id: Arc<str>,
}

impl Identity {
    #[inline]
    fn fill(&self, level: &mut BookLevel, price: f64, size: f64, is_bid: bool, update: &LevelUpdate) {
        level.price = price;
        level.is_bid = is_bid;
        level.symbol = Some(self.symbol.clone());
        level.provider_id = Some(self.provider_id.clone());
        level.apply(update, size);
    }
}

/// Limit order book for one (symbol, venue).
///
/// All mutation and metric recomputation happens under one mutex, so readers
/// never observe a half-applied update. Levels come from a shared lock-free
/// pool and go back to it when removed, cleared, or when the book is dropped.
/// Notifications are published after the lock is released.
pub struct Orderbook {
    identity: Identity,
    settings: BookSettings,
    pool: Arc<LevelPool>,
    state: Mutex<BookState>,
    notifier: Notifier,

    // Metrics
    last_update_time: AtomicU64,
    /// Last snapshot or accepted delta id, changed or not
    last_feed_time: AtomicU64,
    update_count: AtomicU64,
}

impl Orderbook {
    pub fn new(symbol: impl Into<Arc<str>>, provider_id: impl Into<Arc<str>>, pool: Arc<LevelPool>) -> Self {
        Self::with_settings(symbol, provider_id, BookSettings::default(), pool)
    }

    pub fn with_settings(
        symbol: impl Into<Arc<str>>,
        provider_id: impl Into<Arc<str>>,
        settings: BookSettings,
        pool: Arc<LevelPool>,
    ) -> Self {
        Self {
            identity: Identity {
                symbol: symbol.into(),
                provider_id: provider_id.into(),
            },
            settings,
            pool,
            state: Mutex::new(BookState::new()),
            notifier: Notifier::new(settings.notify_capacity),
            last_update_time: AtomicU64::new(0),
            last_feed_time: AtomicU64::new(0),
            update_count: AtomicU64::new(0),
        }
    }

    pub fn symbol(&self) -> &Arc<str> {
        &self.identity.symbol
    }

    pub fn provider_id(&self) -> &Arc<str> {
        &self.identity.provider_id
    }

    pub fn decimal_places(&self) -> u32 {
        self.settings.decimal_places
    }

    pub fn pool(&self) -> &Arc<LevelPool> {
        &self.pool
    }

    /// Format a price with the book's decimal places
    pub fn format_price(&self, price: f64) -> String {
        format!("{:.*}", self.settings.decimal_places as usize, price)
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, BookState> {
        self.state.lock()
    }

    /// Replace both ladders (full rebuild)
    pub fn load_data(&self, asks: &[LevelUpdate], bids: &[LevelUpdate]) {
        let update_id = self.rebuild(asks, bids, None);
        self.publish(UpdateKind::Snapshot, update_id);
    }

    /// Replace both ladders and record `update_id` as the last applied id
    pub fn apply_snapshot(&self, asks: &[LevelUpdate], bids: &[LevelUpdate], update_id: u64) {
        self.rebuild(asks, bids, Some(update_id));
        self.publish(UpdateKind::Snapshot, update_id);
    }

    fn rebuild(&self, asks: &[LevelUpdate], bids: &[LevelUpdate], update_id: Option<u64>) -> u64 {
        let start = Instant::now();

        let updated_by_feed = update_id.is_some();
        let update_id = {
            let mut state = self.state.lock();
            state.load(&self.pool, &self.identity, asks, bids);
            if let Some(id) = update_id {
                state.last_applied_update_id = id;
            }
            state.last_applied_update_id
        };

        let elapsed = start.elapsed().as_micros();
        if elapsed > self.settings.slow_snapshot_us as u128 {
            warn!(symbol = %self.identity.symbol, "Slow snapshot processing: {}μs", elapsed);
        }

        self.touch();
        if updated_by_feed {
            self.feed_seen();
        }
        update_id
    }

    /// Insert a new level, update an existing one in place, or remove it when size is 0
    pub fn add_or_update_level(&self, update: &LevelUpdate) -> bool {
        self.mutate(update, false)
    }

    /// Remove the level at `update.price` on `update`'s side
    pub fn delete_level(&self, update: &LevelUpdate) -> bool {
        self.mutate(update, true)
    }

    fn mutate(&self, update: &LevelUpdate, is_delete: bool) -> bool {
        let start = Instant::now();

        let (changed, update_id) = {
            let mut state = self.state.lock();
            let changed = state.upsert(&self.pool, &self.identity, update, is_delete);
            (changed, state.last_applied_update_id)
        };

        self.after_delta(start, changed, update_id);
        changed
    }

    /// Apply one delta carrying `update_id`.
    ///
    /// Ids at or below the last applied id are ignored, so replaying an
    /// already-applied delta leaves the book untouched. Returns true if the
    /// delta was accepted (even when it did not change any level).
    pub fn apply_delta(&self, update: &LevelUpdate, update_id: u64, is_delete: bool) -> bool {
        let start = Instant::now();

        let (accepted, changed) = {
            let mut state = self.state.lock();
            if update_id <= state.last_applied_update_id {
                (false, false)
            } else {
                let changed = state.upsert(&self.pool, &self.identity, update, is_delete);
                state.last_applied_update_id = update_id;
                (true, changed)
            }
        };

        if accepted {
            self.feed_seen();
        }
        self.after_delta(start, changed, update_id);
        accepted
    }

    /// Apply a run of `(update, update_id, is_delete)` under one lock
    /// acquisition and publish a single notification. Returns how many were accepted.
    pub fn apply_delta_batch<'a, I>(&self, deltas: I) -> usize
    where
        I: IntoIterator<Item = (&'a LevelUpdate, u64, bool)>,
    {
        let start = Instant::now();

        let (accepted, update_id) = {
            let mut state = self.state.lock();
            let mut accepted = 0;
            for (update, update_id, is_delete) in deltas {
                if update_id <= state.last_applied_update_id {
                    continue;
                }
                state.upsert(&self.pool, &self.identity, update, is_delete);
                state.last_applied_update_id = update_id;
                accepted += 1;
            }
            (accepted, state.last_applied_update_id)
        };

        if accepted > 0 {
            self.touch();
            self.feed_seen();
            self.publish(UpdateKind::Batch, update_id);
        }

        let elapsed = start.elapsed().as_micros();
        if elapsed > self.settings.slow_batch_us as u128 {
            warn!(symbol = %self.identity.symbol, accepted, "Slow batch processing: {}μs", elapsed);
        }

        accepted
    }

    fn after_delta(&self, start: Instant, changed: bool, update_id: u64) {
        let elapsed = start.elapsed().as_micros();
        if elapsed > self.settings.slow_delta_us as u128 {
            warn!(symbol = %self.identity.symbol, "Slow delta processing: {}μs", elapsed);
        }

        if changed {
            self.touch();
            self.publish(UpdateKind::Delta, update_id);
        }
    }

    /// Return every level to the pool and reset all derived values
    pub fn clear(&self) {
        {
            let mut state = self.state.lock();
            state.release_all(&self.pool);
            state.last_applied_update_id = 0;
            state.status = BookStatus::Empty;
        }
        self.publish(UpdateKind::Cleared, 0);
    }

    /// Flag the book as out of sync until the next snapshot
    pub fn mark_stale(&self) {
        let update_id = {
            let mut state = self.state.lock();
            state.status = BookStatus::Stale;
            state.last_applied_update_id
        };
        self.publish(UpdateKind::Stale, update_id);
    }

    /// Deep-copy ladders and derived values into `target`.
    ///
    /// Both locks are taken in address order, so two books copying into
    /// each other concurrently cannot deadlock.
    pub fn copy_to(&self, target: &Orderbook) {
        if std::ptr::eq(self, target) {
            return;
        }

        let update_id = {
            let (source, mut dest) = if (self as *const Self) < (target as *const Self) {
                let source = self.state.lock();
                (source, target.state.lock())
            } else {
                let dest = target.state.lock();
                (self.state.lock(), dest)
            };
            dest.copy_from(&source, &target.pool);
            dest.last_applied_update_id
        };

        target.touch();
        target.publish(UpdateKind::Snapshot, update_id);
    }

    /// Pool-backed point-in-time copy, independent of this book's lock once returned
    pub fn snapshot(&self) -> BookSnapshot {
        let mut snapshot = BookSnapshot::new(self.pool.clone());
        snapshot.update_from(self);
        snapshot
    }

    pub fn subscribe(&self) -> Subscription {
        self.notifier.subscribe()
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Best level on one side, if that side has any
    pub fn top_of_book(&self, is_bid: bool) -> Option<BookLevel> {
        let state = self.state.lock();
        let ladder = if is_bid { &state.bids } else { &state.asks };
        ladder.first().map(|level| BookLevel::clone(level))
    }

    pub fn best_bid_ask(&self) -> (Option<f64>, Option<f64>) {
        let state = self.state.lock();
        (state.best_bid(), state.best_ask())
    }

    #[inline]
    pub fn mid_price(&self) -> f64 {
        self.state.lock().mid_price
    }

    #[inline]
    pub fn spread(&self) -> f64 {
        self.state.lock().spread
    }

    /// Whole-book imbalance in [-1, 1]
    #[inline]
    pub fn imbalance(&self) -> f64 {
        self.state.lock().imbalance
    }

    /// Imbalance over the best `depth` levels of each side
    pub fn depth_imbalance(&self, depth: usize) -> f64 {
        let state = self.state.lock();
        metrics::depth_imbalance(&state.bids, &state.asks, depth)
    }

    /// Total liquidity in top N levels
    pub fn liquidity_depth(&self, depth: usize) -> f64 {
        let state = self.state.lock();
        metrics::liquidity_depth(&state.bids, &state.asks, depth)
    }

    pub fn bid_cumulative(&self) -> Vec<CumulativeLevel> {
        self.state.lock().bid_cumulative.clone()
    }

    pub fn ask_cumulative(&self) -> Vec<CumulativeLevel> {
        self.state.lock().ask_cumulative.clone()
    }

    /// Best `depth` levels per side as `(price, size)`
    pub fn get_sorted_levels(&self, depth: usize) -> (Vec<(f64, f64)>, Vec<(f64, f64)>) {
        let state = self.state.lock();
        let take = |ladder: &Ladder| {
            ladder
                .iter()
                .take(depth)
                .map(|level| (level.price, level.size))
                .collect::<Vec<_>>()
        };
        (take(&state.bids), take(&state.asks))
    }

    /// Number of (bid, ask) levels
    pub fn depth(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.bids.len(), state.asks.len())
    }

    pub fn metrics(&self) -> BookMetrics {
        let state = self.state.lock();
        let (bid, ask) = (state.best_bid(), state.best_ask());
        BookMetrics {
            best_bid: bid,
            best_ask: ask,
            mid_price: state.mid_price,
            spread: state.spread,
            spread_bps: metrics::spread_bps(bid, ask),
            imbalance: state.imbalance,
            bid_volume: state.bid_volume,
            ask_volume: state.ask_volume,
            bid_levels: state.bids.len(),
            ask_levels: state.asks.len(),
            update_id: state.last_applied_update_id,
        }
    }

    pub fn last_applied_update_id(&self) -> u64 {
        self.state.lock().last_applied_update_id
    }

    pub fn status(&self) -> BookStatus {
        self.state.lock().status
    }

    /// Get latency since last update
    pub fn latency_ms(&self) -> u64 {
        let last_update = self.last_update_time.load(Ordering::Relaxed);
        let now = chrono::Utc::now().timestamp_millis() as u64;
        now.saturating_sub(last_update)
    }

    /// Milliseconds since the feed last delivered a snapshot or an accepted
    /// delta id, whether or not it changed a level
    pub fn feed_latency_ms(&self) -> u64 {
        let last_seen = self.last_feed_time.load(Ordering::Relaxed);
        let now = chrono::Utc::now().timestamp_millis() as u64;
        now.saturating_sub(last_seen)
    }

    /// Get update count
    pub fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::Relaxed)
    }

    fn feed_seen(&self) {
        self.last_feed_time.store(
            chrono::Utc::now().timestamp_millis() as u64,
            Ordering::Relaxed,
        );
    }

    fn touch(&self) {
        self.last_update_time.store(
            chrono::Utc::now().timestamp_millis() as u64,
            Ordering::Relaxed,
        );
        self.update_count.fetch_add(1, Ordering::Relaxed);
    }

    fn publish(&self, kind: UpdateKind, update_id: u64) {
        if self.notifier.subscriber_count() == 0 {
            return;
        }
        self.notifier.publish(&BookUpdate {
            symbol: self.identity.symbol.clone(),
            provider_id: self.identity.provider_id.clone(),
            update_id,
            kind,
        });
    }
}

impl Clone for Orderbook {
    /// Deep copy sharing the same pool. Subscribers are not carried over.
    fn clone(&self) -> Self {
        let copy = Orderbook::with_settings(
            self.identity.symbol.clone(),
            self.identity.provider_id.clone(),
            self.settings,
            self.pool.clone(),
        );

        {
            let source = self.state.lock();
            copy.state.lock().copy_from(&source, &self.pool);
        }

        copy.last_update_time.store(self.last_update_time.load(Ordering::Relaxed), Ordering::Relaxed);
        copy.last_feed_time.store(self.last_feed_time.load(Ordering::Relaxed), Ordering::Relaxed);
        copy.update_count.store(self.update_count(), Ordering::Relaxed);
        copy
    }
}

impl Drop for Orderbook {
    fn drop(&mut self) {
        self.state.get_mut().release_all(&self.pool);
    }
}

impl std::fmt::Debug for Orderbook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orderbook")
            .field("symbol", &self.identity.symbol)
            .field("provider_id", &self.identity.provider_id)
            .field("update_count", &self.update_count())
            .finish()
    }
}
