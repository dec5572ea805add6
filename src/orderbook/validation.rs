use serde::Deserialize;

use super::level::{BookLevel, CumulativeLevel};
use super::manager::{BookStatus, Orderbook};
use super::snapshot::BookSnapshot;

/// Result of orderbook validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Empty,              // No levels on either side
    PriceAnomaly,       // Bid >= Ask (crossed or locked book)
    LadderOrder,        // Unsorted or duplicate prices on a side
    CumulativeMismatch, // Running sums disagree with level sizes
    StaleData,          // Sequence gap pending resync, or no update within max age
    InsufficientDepth,  // Less than minimum required levels
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    /// Maximum data age in milliseconds (0 disables the age check)
    #[serde(default = "default_max_data_age_ms")]
    pub max_data_age_ms: u64,

    /// Minimum number of depth levels required per side
    #[serde(default = "default_min_depth_levels")]
    pub min_depth_levels: usize,

    /// Tolerance for comparing running sums
    #[serde(default = "default_cumulative_epsilon")]
    pub cumulative_epsilon: f64,

    /// Enable validation
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_max_data_age_ms() -> u64 { 5000 }
fn default_min_depth_levels() -> usize { 1 }
fn default_cumulative_epsilon() -> f64 { 1e-9 }
fn default_enabled() -> bool { true }

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_data_age_ms: default_max_data_age_ms(),
            min_depth_levels: default_min_depth_levels(),
            cumulative_epsilon: default_cumulative_epsilon(),
            enabled: default_enabled(),
        }
    }
}

/// Checks book invariants before a consumer acts on the data
pub struct OrderbookValidator {
    config: ValidationConfig,
    checked: u64,
    failed: u64,
}

impl OrderbookValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self {
            config,
            checked: 0,
            failed: 0,
        }
    }

    /// Validate a consumer's snapshot copy
    pub fn validate(&mut self, snapshot: &BookSnapshot) -> ValidationResult {
        if !self.config.enabled {
            return ValidationResult::Valid;
        }

        let result = self.check_status(snapshot.status())
            .or_else(|| self.check_ladders(snapshot.bids(), snapshot.asks()))
            .unwrap_or(ValidationResult::Valid);

        self.record(result)
    }

    /// Validate the live book, including its cumulative ladders and data age
    pub fn validate_book(&mut self, book: &Orderbook) -> ValidationResult {
        if !self.config.enabled {
            return ValidationResult::Valid;
        }

        let latency_ms = book.latency_ms();
        let state = book.lock_state();

        let result = self.check_status(state.status)
            .or_else(|| {
                (self.config.max_data_age_ms > 0 && latency_ms > self.config.max_data_age_ms)
                    .then_some(ValidationResult::StaleData)
            })
            .or_else(|| {
                self.check_ladders(
                    state.bids.iter().map(|l| &**l),
                    state.asks.iter().map(|l| &**l),
                )
            })
            .or_else(|| {
                let bids_ok = self.cumulative_matches(state.bids.iter().map(|l| &**l), &state.bid_cumulative);
                let asks_ok = self.cumulative_matches(state.asks.iter().map(|l| &**l), &state.ask_cumulative);
                (!bids_ok || !asks_ok).then_some(ValidationResult::CumulativeMismatch)
            })
            .unwrap_or(ValidationResult::Valid);

        drop(state);
        self.record(result)
    }

    fn check_status(&self, status: BookStatus) -> Option<ValidationResult> {
        match status {
            BookStatus::Stale => Some(ValidationResult::StaleData),
            BookStatus::Empty | BookStatus::Live => None,
        }
    }

    fn check_ladders<'a>(
        &self,
        bids: impl ExactSizeIterator<Item = &'a BookLevel>,
        asks: impl ExactSizeIterator<Item = &'a BookLevel>,
    ) -> Option<ValidationResult> {
        let (bid_count, ask_count) = (bids.len(), asks.len());
        if bid_count == 0 && ask_count == 0 {
            return Some(ValidationResult::Empty);
        }

        let mut best_bid = None;
        let mut previous: Option<f64> = None;
        for level in bids {
            if previous.is_some_and(|p| level.price >= p) || level.size <= 0.0 {
                return Some(ValidationResult::LadderOrder);
            }
            best_bid.get_or_insert(level.price);
            previous = Some(level.price);
        }

        let mut best_ask = None;
        previous = None;
        for level in asks {
            if previous.is_some_and(|p| level.price <= p) || level.size <= 0.0 {
                return Some(ValidationResult::LadderOrder);
            }
            best_ask.get_or_insert(level.price);
            previous = Some(level.price);
        }

        if let (Some(bid), Some(ask)) = (best_bid, best_ask) {
            if bid >= ask {
                return Some(ValidationResult::PriceAnomaly);
            }
        }

        if bid_count < self.config.min_depth_levels || ask_count < self.config.min_depth_levels {
            return Some(ValidationResult::InsufficientDepth);
        }

        None
    }

    fn cumulative_matches<'a>(
        &self,
        levels: impl ExactSizeIterator<Item = &'a BookLevel>,
        cumulative: &[CumulativeLevel],
    ) -> bool {
        if levels.len() != cumulative.len() {
            return false;
        }

        let mut running = 0.0;
        let mut previous = 0.0;
        for (level, entry) in levels.zip(cumulative) {
            running += level.size;
            if entry.price != level.price
                || (entry.size - running).abs() > self.config.cumulative_epsilon
                || entry.size < previous
            {
                return false;
            }
            previous = entry.size;
        }
        true
    }

    fn record(&mut self, result: ValidationResult) -> ValidationResult {
        self.checked += 1;
        if !result.is_valid() {
            self.failed += 1;
        }
        result
    }

    /// (checked, failed) counts
    pub fn counts(&self) -> (u64, u64) {
        (self.checked, self.failed)
    }
}

impl ValidationResult {
    /// Convert validation result to user-friendly message
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationResult::Valid => "Valid",
            ValidationResult::Empty => "Empty",
            ValidationResult::PriceAnomaly => "Price Anomaly",
            ValidationResult::LadderOrder => "Ladder Order",
            ValidationResult::CumulativeMismatch => "Cumulative Mismatch",
            ValidationResult::StaleData => "Stale Data",
            ValidationResult::InsufficientDepth => "Insufficient Depth",
        }
    }

    /// Check if consumers should act on the data
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }
}

impl std::fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::{LevelPool, LevelUpdate};
    use std::sync::Arc;

    fn create_test_orderbook() -> Orderbook {
        let ob = Orderbook::new("BTCUSDT", "sim", Arc::new(LevelPool::new(64)));

        let bids: Vec<_> = (0..5).map(|i| LevelUpdate::bid(50000.0 - i as f64, 1.0)).collect();
        let asks: Vec<_> = (0..5).map(|i| LevelUpdate::ask(50001.0 + i as f64, 1.0)).collect();

        ob.load_data(&asks, &bids);
        ob
    }

    #[test]
    fn test_valid_orderbook() {
        let mut validator = OrderbookValidator::new(ValidationConfig::default());
        let ob = create_test_orderbook();

        assert_eq!(validator.validate_book(&ob), ValidationResult::Valid);
        assert_eq!(validator.validate(&ob.snapshot()), ValidationResult::Valid);
        assert_eq!(validator.counts(), (2, 0));
    }

    #[test]
    fn test_crossed_book() {
        let mut validator = OrderbookValidator::new(ValidationConfig::default());
        let ob = Orderbook::new("BTCUSDT", "sim", Arc::new(LevelPool::new(64)));

        // Crossed book: bid > ask
        ob.load_data(&[LevelUpdate::ask(50001.0, 1.0)], &[LevelUpdate::bid(50002.0, 1.0)]);

        assert_eq!(validator.validate_book(&ob), ValidationResult::PriceAnomaly);
    }

    #[test]
    fn test_insufficient_depth() {
        let config = ValidationConfig {
            min_depth_levels: 5,
            ..Default::default()
        };
        let mut validator = OrderbookValidator::new(config);
        let ob = Orderbook::new("BTCUSDT", "sim", Arc::new(LevelPool::new(64)));

        // Only 2 levels
        ob.load_data(
            &[LevelUpdate::ask(50001.0, 1.0), LevelUpdate::ask(50002.0, 1.0)],
            &[LevelUpdate::bid(50000.0, 1.0), LevelUpdate::bid(49999.0, 1.0)],
        );

        assert_eq!(validator.validate_book(&ob), ValidationResult::InsufficientDepth);
    }

    #[test]
    fn test_empty_and_stale() {
        let mut validator = OrderbookValidator::new(ValidationConfig::default());
        let ob = Orderbook::new("BTCUSDT", "sim", Arc::new(LevelPool::new(64)));
        assert_eq!(validator.validate(&ob.snapshot()), ValidationResult::Empty);

        let ob = create_test_orderbook();
        ob.mark_stale();
        assert_eq!(validator.validate_book(&ob), ValidationResult::StaleData);
        assert_eq!(validator.counts(), (2, 2));
    }

    #[test]
    fn test_disabled_validator() {
        let config = ValidationConfig {
            enabled: false,
            ..Default::default()
        };
        let mut validator = OrderbookValidator::new(config);
        let ob = Orderbook::new("BTCUSDT", "sim", Arc::new(LevelPool::new(64)));
        assert!(validator.validate_book(&ob).is_valid());
    }

    #[test]
    fn test_cumulative_check() {
        let validator = OrderbookValidator::new(ValidationConfig::default());
        let levels = [
            BookLevel { price: 100.0, size: 1.0, ..Default::default() },
            BookLevel { price: 99.0, size: 2.0, ..Default::default() },
        ];
        let good = [
            CumulativeLevel { price: 100.0, size: 1.0 },
            CumulativeLevel { price: 99.0, size: 3.0 },
        ];
        let bad = [
            CumulativeLevel { price: 100.0, size: 1.0 },
            CumulativeLevel { price: 99.0, size: 2.0 },
        ];

        assert!(validator.cumulative_matches(levels.iter(), &good));
        assert!(!validator.cumulative_matches(levels.iter(), &bad));
        assert!(!validator.cumulative_matches(levels[..1].iter(), &good));
    }
}
