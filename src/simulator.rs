use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::FeedConfig;
use crate::error::{EngineError, Result};
use crate::orderbook::LevelUpdate;
use crate::sync::{DeltaEvent, SnapshotEvent, SnapshotSource};

const DELETE_PROBABILITY: f64 = 0.15;
const DRIFT_PROBABILITY: f64 = 0.05;

struct VenueState {
    rng: StdRng,
    /// Ticks of the price both ladders are quoted around
    anchor: i64,
    bids: BTreeMap<i64, f64>,
    asks: BTreeMap<i64, f64>,
    update_id: u64,
    emitted: u64,
    skipped: u64,
}

/// Seeded random-walk venue for one symbol.
///
/// Holds the authoritative ladder, streams deltas against it and serves full
/// snapshots through [`SnapshotSource`]. Every `gap_every` deltas one update is
/// applied to the venue but never emitted, so consumers see a sequence gap.
pub struct VenueSimulator {
    symbol: String,
    provider_id: String,
    tick: f64,
    levels: usize,
    gap_every: u64,
    state: Mutex<VenueState>,
}

impl VenueSimulator {
    pub fn new(symbol: &str, feed: &FeedConfig, seed: u64) -> Self {
        let tick = 10f64.powi(-(feed.decimal_places as i32));
        let levels = feed.levels.max(1);
        let anchor = (feed.start_price / tick).round() as i64;
        let mut rng = StdRng::seed_from_u64(seed);

        let mut bids = BTreeMap::new();
        let mut asks = BTreeMap::new();
        for k in 1..=levels as i64 {
            bids.insert(anchor - k, random_size(&mut rng));
            asks.insert(anchor + k, random_size(&mut rng));
        }

        Self {
            symbol: symbol.to_string(),
            provider_id: feed.venue.clone(),
            tick,
            levels,
            gap_every: feed.gap_every,
            state: Mutex::new(VenueState {
                rng,
                anchor,
                bids,
                asks,
                update_id: 1,
                emitted: 0,
                skipped: 0,
            }),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn last_update_id(&self) -> u64 {
        self.state.lock().update_id
    }

    /// Updates applied to the venue but withheld from the stream
    pub fn skipped(&self) -> u64 {
        self.state.lock().skipped
    }

    /// Best bid and ask of the authoritative ladder
    pub fn best_bid_ask(&self) -> (Option<f64>, Option<f64>) {
        let state = self.state.lock();
        (
            state.bids.keys().next_back().map(|&t| self.price(t)),
            state.asks.keys().next().map(|&t| self.price(t)),
        )
    }

    /// Advance the venue by `count` updates and return the ones that made it onto the wire.
    pub fn next_deltas(&self, count: usize) -> Vec<DeltaEvent> {
        let mut state = self.state.lock();
        let mut out = Vec::with_capacity(count);

        for _ in 0..count {
            let delta = self.step(&mut state);
            state.emitted += 1;
            if self.gap_every > 0 && state.emitted % self.gap_every == 0 {
                state.skipped += 1;
                debug!(symbol = %self.symbol, update_id = delta.update_id, "Withholding delta");
                continue;
            }
            out.push(delta);
        }
        out
    }

    fn step(&self, state: &mut VenueState) -> DeltaEvent {
        state.update_id += 1;
        let update_id = state.update_id;

        if state.rng.gen_bool(DRIFT_PROBABILITY) {
            // Move the anchor one tick and pull the level that would now cross
            let up = state.rng.gen_bool(0.5);
            state.anchor += if up { 1 } else { -1 };
            let anchor = state.anchor;
            let (crossed, is_bid) = if up {
                (state.asks.remove(&anchor).map(|_| anchor), false)
            } else {
                (state.bids.remove(&anchor).map(|_| anchor), true)
            };
            if let Some(ticks) = crossed {
                let level = LevelUpdate::new(self.price(ticks), 0.0, is_bid).with_server_timestamp(Utc::now());
                return DeltaEvent::delete(update_id, level);
            }
        }

        let is_bid = state.rng.gen_bool(0.5);
        let distance = state.rng.gen_range(1..=self.levels as i64);
        let ticks = if is_bid { state.anchor - distance } else { state.anchor + distance };
        let delete = state.rng.gen_bool(DELETE_PROBABILITY);
        let size = if delete { 0.0 } else { random_size(&mut state.rng) };

        let side = if is_bid { &mut state.bids } else { &mut state.asks };
        if delete {
            side.remove(&ticks);
        } else {
            side.insert(ticks, size);
        }

        let level = LevelUpdate::new(self.price(ticks), size, is_bid).with_server_timestamp(Utc::now());
        DeltaEvent::new(update_id, level)
    }

    fn price(&self, ticks: i64) -> f64 {
        ticks as f64 * self.tick
    }
}

impl SnapshotSource for VenueSimulator {
    fn fetch_snapshot(&self, symbol: &str, provider_id: &str) -> Result<SnapshotEvent> {
        if symbol != self.symbol || provider_id != self.provider_id {
            return Err(EngineError::SnapshotUnavailable {
                symbol: symbol.to_string(),
                provider_id: provider_id.to_string(),
                reason: format!("venue serves {}@{}", self.symbol, self.provider_id),
            });
        }

        let now = Utc::now();
        let state = self.state.lock();
        Ok(SnapshotEvent {
            update_id: state.update_id,
            asks: state
                .asks
                .iter()
                .map(|(&t, &size)| LevelUpdate::ask(self.price(t), size).with_server_timestamp(now))
                .collect(),
            bids: state
                .bids
                .iter()
                .rev()
                .map(|(&t, &size)| LevelUpdate::bid(self.price(t), size).with_server_timestamp(now))
                .collect(),
        })
    }
}

fn random_size(rng: &mut StdRng) -> f64 {
    (rng.gen_range(1..=5_000) as f64) / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::{LevelPool, Orderbook};
    use crate::sync::{Reconciler, SyncConfig, SyncOutcome};
    use std::sync::Arc;

    fn feed(gap_every: u64) -> FeedConfig {
        FeedConfig {
            venue: "sim".to_string(),
            levels: 10,
            start_price: 100.0,
            gap_every,
            ..Default::default()
        }
    }

    #[test]
    fn test_same_seed_same_stream() {
        let a = VenueSimulator::new("BTCUSDT", &feed(0), 42);
        let b = VenueSimulator::new("BTCUSDT", &feed(0), 42);
        // Timestamps differ between runs; ids and levels must not
        let key = |d: &DeltaEvent| (d.update_id, d.level.price, d.level.size, d.level.is_bid, d.is_delete);
        let first: Vec<_> = a.next_deltas(200).iter().map(key).collect();
        let second: Vec<_> = b.next_deltas(200).iter().map(key).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_deltas_carry_server_time() {
        let sim = VenueSimulator::new("BTCUSDT", &feed(0), 4);
        let before = Utc::now();
        for delta in sim.next_deltas(50) {
            assert!(delta.level.server_timestamp >= before);
        }
        let snapshot = sim.fetch_snapshot("BTCUSDT", "sim").unwrap();
        assert!(snapshot.bids.iter().all(|level| level.server_timestamp >= before));
    }

    #[test]
    fn test_gap_injection() {
        let sim = VenueSimulator::new("BTCUSDT", &feed(10), 1);
        let deltas = sim.next_deltas(100);
        assert_eq!(deltas.len(), 90);
        assert_eq!(sim.skipped(), 10);
        assert_eq!(sim.last_update_id(), 101);
    }

    #[test]
    fn test_snapshot_rejects_other_symbol() {
        let sim = VenueSimulator::new("BTCUSDT", &feed(0), 1);
        assert!(matches!(
            sim.fetch_snapshot("ETHUSDT", "sim"),
            Err(EngineError::SnapshotUnavailable { .. })
        ));
    }

    #[test]
    fn test_book_tracks_venue() {
        let sim = VenueSimulator::new("BTCUSDT", &feed(0), 9);
        let book = Arc::new(Orderbook::new("BTCUSDT", "sim", Arc::new(LevelPool::new(256))));
        let mut reconciler = Reconciler::new(book.clone(), SyncConfig::default());

        // Deltas that arrive before the snapshot are buffered and replayed
        for delta in sim.next_deltas(5) {
            reconciler.on_delta(delta);
        }
        reconciler.sync_with(&sim).unwrap();

        for delta in sim.next_deltas(2_000) {
            assert_ne!(reconciler.on_delta(delta), SyncOutcome::ResyncRequired);
        }

        assert_eq!(book.best_bid_ask(), sim.best_bid_ask());
        assert_eq!(book.last_applied_update_id(), sim.last_update_id());
    }

    #[test]
    fn test_book_recovers_from_gap() {
        let sim = VenueSimulator::new("BTCUSDT", &feed(100), 3);
        let book = Arc::new(Orderbook::new("BTCUSDT", "sim", Arc::new(LevelPool::new(256))));
        let mut reconciler = Reconciler::new(book.clone(), SyncConfig::default());
        reconciler.sync_with(&sim).unwrap();

        let mut resyncs = 0;
        for delta in sim.next_deltas(1_000) {
            if reconciler.on_delta(delta) == SyncOutcome::ResyncRequired {
                reconciler.sync_with(&sim).unwrap();
                resyncs += 1;
            }
        }

        assert!(resyncs >= 1);
        assert!(reconciler.is_live());
        assert_eq!(book.best_bid_ask(), sim.best_bid_ask());
    }
}
