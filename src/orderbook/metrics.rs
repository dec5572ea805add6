use serde::Serialize;
use std::ops::Deref;

use super::level::{BookLevel, CumulativeLevel};

/// Derived metrics for one book at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BookMetrics {
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub mid_price: f64,
    pub spread: f64,
    pub spread_bps: f64,
    pub imbalance: f64,
    pub bid_volume: f64,
    pub ask_volume: f64,
    pub bid_levels: usize,
    pub ask_levels: usize,
    pub update_id: u64,
}

/// Mid price, or 0 unless both sides are present.
#[inline]
pub fn mid_price(best_bid: Option<f64>, best_ask: Option<f64>) -> f64 {
    match (best_bid, best_ask) {
        (Some(bid), Some(ask)) => (bid + ask) / 2.0,
        _ => 0.0,
    }
}

/// Absolute spread, or 0 unless both sides are present.
#[inline]
pub fn spread(best_bid: Option<f64>, best_ask: Option<f64>) -> f64 {
    match (best_bid, best_ask) {
        (Some(bid), Some(ask)) => ask - bid,
        _ => 0.0,
    }
}

/// Spread in basis points of the mid price
#[inline]
pub fn spread_bps(best_bid: Option<f64>, best_ask: Option<f64>) -> f64 {
    let mid = mid_price(best_bid, best_ask);
    if mid <= 0.0 {
        return 0.0;
    }
    spread(best_bid, best_ask) / mid * 10_000.0
}

/// (bid - ask) / (bid + ask), clamped to [-1, 1]. Zero when either side is empty.
#[inline]
pub fn imbalance(bid_volume: f64, ask_volume: f64) -> f64 {
    if bid_volume <= 0.0 || ask_volume <= 0.0 {
        return 0.0;
    }

    let total = bid_volume + ask_volume;
    if !total.is_finite() {
        return 0.0;
    }

    ((bid_volume - ask_volume) / total).clamp(-1.0, 1.0)
}

/// Total size of the best `depth` levels
pub fn volume<L: Deref<Target = BookLevel>>(levels: &[L], depth: usize) -> f64 {
    levels.iter().take(depth).map(|level| level.size).sum()
}

/// Imbalance restricted to the best `depth` levels of each side
pub fn depth_imbalance<L: Deref<Target = BookLevel>>(bids: &[L], asks: &[L], depth: usize) -> f64 {
    imbalance(volume(bids, depth), volume(asks, depth))
}

/// Total liquidity in the best `depth` levels of both sides
pub fn liquidity_depth<L: Deref<Target = BookLevel>>(bids: &[L], asks: &[L], depth: usize) -> f64 {
    volume(bids, depth) + volume(asks, depth)
}

/// Rebuild `cumulative[from..]` as running sums over `levels[from..]`.
///
/// Entries before `from` are kept, so a change at index i only costs the
/// tail of the ladder. Returns the side's total size.
pub fn rebuild_cumulative<L: Deref<Target = BookLevel>>(
    levels: &[L],
    cumulative: &mut Vec<CumulativeLevel>,
    from: usize,
) -> f64 {
    let from = from.min(levels.len()).min(cumulative.len());
    cumulative.truncate(from);

    let mut running = if from == 0 { 0.0 } else { cumulative[from - 1].size };
    for level in &levels[from..] {
        running += level.size;
        cumulative.push(CumulativeLevel {
            price: level.price,
            size: running,
        });
    }

    running
}
