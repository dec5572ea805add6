use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::orderbook::{BookSettings, ValidationConfig};
use crate::sync::SyncConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub feed: FeedConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Requested level capacity (rounded up to a power of two)
    #[serde(default = "default_pool_capacity")]
    pub capacity: usize,
    /// Levels minted at startup
    #[serde(default = "default_pool_warmup")]
    pub warmup: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_pool_capacity(),
            warmup: default_pool_warmup(),
        }
    }
}

fn default_pool_capacity() -> usize { 800_000 }
fn default_pool_warmup() -> usize { 4096 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotifyConfig {
    /// Per-subscriber channel depth
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_channel_capacity() -> usize { 1024 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PerformanceConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
    #[serde(default = "default_slow_snapshot_us")]
    pub slow_snapshot_us: u64,
    #[serde(default = "default_slow_delta_us")]
    pub slow_delta_us: u64,
    #[serde(default = "default_slow_batch_us")]
    pub slow_batch_us: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            slow_snapshot_us: default_slow_snapshot_us(),
            slow_delta_us: default_slow_delta_us(),
            slow_batch_us: default_slow_batch_us(),
        }
    }
}

fn default_log_level() -> String { "info".to_string() }
fn default_slow_snapshot_us() -> u64 { 100 }
fn default_slow_delta_us() -> u64 { 50 }
fn default_slow_batch_us() -> u64 { 500 }

/// Simulated venue driven by the binary
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedConfig {
    #[serde(default = "default_venue")]
    pub venue: String,
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    #[serde(default = "default_decimal_places")]
    pub decimal_places: u32,
    #[serde(default = "default_start_price")]
    pub start_price: f64,
    /// Levels per side in the venue's book
    #[serde(default = "default_levels")]
    pub levels: usize,
    #[serde(default = "default_deltas_per_tick")]
    pub deltas_per_tick: usize,
    /// Skip one update id every N deltas to exercise resync (0 disables)
    #[serde(default = "default_gap_every")]
    pub gap_every: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_consumers")]
    pub consumers: usize,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            venue: default_venue(),
            symbols: default_symbols(),
            decimal_places: default_decimal_places(),
            start_price: default_start_price(),
            levels: default_levels(),
            deltas_per_tick: default_deltas_per_tick(),
            gap_every: default_gap_every(),
            tick_interval_ms: default_tick_interval_ms(),
            consumers: default_consumers(),
            stats_interval_secs: default_stats_interval_secs(),
            seed: default_seed(),
        }
    }
}

fn default_venue() -> String { "sim".to_string() }
fn default_symbols() -> Vec<String> { vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()] }
fn default_decimal_places() -> u32 { 2 }
fn default_start_price() -> f64 { 50_000.0 }
fn default_levels() -> usize { 50 }
fn default_deltas_per_tick() -> usize { 20 }
fn default_gap_every() -> u64 { 50_000 }
fn default_tick_interval_ms() -> u64 { 1 }
fn default_consumers() -> usize { 2 }
fn default_stats_interval_secs() -> u64 { 5 }
fn default_seed() -> u64 { 7 }

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            sync: SyncConfig::default(),
            notify: NotifyConfig::default(),
            performance: PerformanceConfig::default(),
            validation: ValidationConfig::default(),
            feed: FeedConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Arc<Self>> {
        dotenv::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(
                config::Environment::with_prefix("LOB")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("feed.symbols")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(Arc::new(config))
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.capacity == 0 {
            return Err(EngineError::InvalidConfig("pool.capacity must be > 0".into()));
        }
        if self.sync.max_resync_attempts == 0 {
            return Err(EngineError::InvalidConfig("sync.max_resync_attempts must be > 0".into()));
        }
        if self.sync.max_buffer_depth == 0 {
            return Err(EngineError::InvalidConfig("sync.max_buffer_depth must be > 0".into()));
        }
        if self.notify.channel_capacity == 0 {
            return Err(EngineError::InvalidConfig("notify.channel_capacity must be > 0".into()));
        }
        if self.feed.symbols.is_empty() {
            return Err(EngineError::InvalidConfig("feed.symbols must not be empty".into()));
        }
        if self.feed.levels == 0 || self.feed.start_price <= 0.0 {
            return Err(EngineError::InvalidConfig("feed.levels and feed.start_price must be positive".into()));
        }
        Ok(())
    }

    /// Settings applied to every book the registry creates
    pub fn book_settings(&self) -> BookSettings {
        BookSettings {
            decimal_places: self.feed.decimal_places,
            notify_capacity: self.notify.channel_capacity,
            slow_snapshot_us: self.performance.slow_snapshot_us,
            slow_delta_us: self.performance.slow_delta_us,
            slow_batch_us: self.performance.slow_batch_us,
        }
    }
}
