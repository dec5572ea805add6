use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use lob_engine::config::{Config, PerformanceConfig};
use lob_engine::orderbook::{BookSnapshot, LevelPool, Orderbook, OrderbookValidator};
use lob_engine::registry::BookRegistry;
use lob_engine::simulator::VenueSimulator;
use lob_engine::sync::Reconciler;
use lob_engine::Subscription;

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_logging(&config.performance);

    info!("🚀 Order book engine starting...");
    info!("   Venue: {}", config.feed.venue);
    info!("   Symbols: {}", config.feed.symbols.join(", "));
    info!("   Sequence policy: {:?}", config.sync.sequence_policy);

    let pool = Arc::new(LevelPool::with_warmup(config.pool.capacity, config.pool.warmup));
    info!("✅ Level pool ready (capacity: {})", pool.capacity());

    let registry = Arc::new(BookRegistry::new(pool.clone(), config.book_settings()));
    let running = Arc::new(AtomicBool::new(true));
    let validations = Arc::new(AtomicU64::new(0));
    let failures = Arc::new(AtomicU64::new(0));

    let mut producers = Vec::new();
    for (index, symbol) in config.feed.symbols.iter().enumerate() {
        let book = registry.subscribe(symbol, &config.feed.venue);
        let venue = VenueSimulator::new(symbol, &config.feed, config.feed.seed + index as u64);
        producers.push(tokio::spawn(run_producer(
            venue,
            Reconciler::new(book, config.sync.clone()),
            config.clone(),
            running.clone(),
        )));
    }
    info!("✅ {} feed(s) started", producers.len());

    let mut consumers = Vec::new();
    for id in 0..config.feed.consumers {
        let books = registry.books();
        let config = config.clone();
        let pool = pool.clone();
        let running = running.clone();
        let validations = validations.clone();
        let failures = failures.clone();
        consumers.push(thread::spawn(move || {
            run_consumer(id, books, pool, config, running, validations, failures)
        }));
    }
    info!("✅ {} consumer(s) started", consumers.len());

    let stats_task = tokio::spawn(report_stats(
        registry.clone(),
        config.feed.stats_interval_secs,
        validations.clone(),
        failures.clone(),
    ));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    running.store(false, Ordering::Relaxed);
    stats_task.abort();
    for producer in producers {
        if let Err(e) = producer.await {
            warn!("Feed task ended abnormally: {}", e);
        }
    }
    for consumer in consumers {
        if consumer.join().is_err() {
            warn!("Consumer thread panicked");
        }
    }

    let removed = registry.disconnect_venue(&config.feed.venue);
    let stats = pool.stats();
    info!(
        "📊 Final | books removed: {} | pool in use: {} | peak: {:.1}% | healthy: {}",
        removed, stats.in_use, stats.peak_utilization_pct, stats.healthy
    );
    info!("👋 Engine stopped");
    Ok(())
}

fn init_logging(performance: &PerformanceConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&performance.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if performance.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Drive one symbol: stream deltas into the reconciler, resync on gaps.
async fn run_producer(
    venue: VenueSimulator,
    mut reconciler: Reconciler,
    config: Arc<Config>,
    running: Arc<AtomicBool>,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(config.feed.tick_interval_ms.max(1)));

    // The first step buffers a few deltas, then performs the initial sync
    while running.load(Ordering::Relaxed) {
        interval.tick().await;

        let deltas = venue.next_deltas(config.feed.deltas_per_tick);
        if let Err(e) = reconciler.drive(deltas, &venue) {
            warn!("Resync failed for {}, retrying next tick: {}", venue.symbol(), e);
        }
    }

    let stats = reconciler.stats();
    info!(
        "{} | applied: {} | gaps: {} | resyncs: {} | withheld by venue: {}",
        venue.symbol(),
        stats.applied,
        stats.gaps,
        stats.resyncs,
        venue.skipped()
    );
}

/// Copy each book on change and validate the copy outside the book lock.
fn run_consumer(
    id: usize,
    books: Vec<Arc<Orderbook>>,
    pool: Arc<LevelPool>,
    config: Arc<Config>,
    running: Arc<AtomicBool>,
    validations: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
) {
    let mut validator = OrderbookValidator::new(config.validation.clone());
    let mut feeds: Vec<(Arc<Orderbook>, Subscription, BookSnapshot)> = books
        .into_iter()
        .map(|book| {
            let subscription = book.subscribe();
            (book, subscription, BookSnapshot::new(pool.clone()))
        })
        .collect();

    while running.load(Ordering::Relaxed) {
        let mut idle = true;
        for (book, subscription, snapshot) in feeds.iter_mut() {
            if subscription.latest().is_none() {
                continue;
            }
            idle = false;

            snapshot.update_from(book.as_ref());
            let result = validator.validate(snapshot);
            validations.fetch_add(1, Ordering::Relaxed);
            if !result.is_valid() {
                failures.fetch_add(1, Ordering::Relaxed);
                warn!(consumer = id, symbol = %book.symbol(), update_id = snapshot.update_id(), "Validation failed: {}", result);
            }
        }

        if idle {
            thread::sleep(Duration::from_millis(1));
        }
    }

    let (checked, failed) = validator.counts();
    info!(consumer = id, checked, failed, "Consumer stopped");
}

async fn report_stats(
    registry: Arc<BookRegistry>,
    interval_secs: u64,
    validations: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    interval.tick().await;

    loop {
        interval.tick().await;

        match serde_json::to_string(&registry.pool().stats()) {
            Ok(json) => info!("📊 Pool {}", json),
            Err(e) => warn!("Failed to encode pool stats: {}", e),
        }

        for book in registry.books() {
            let metrics = book.metrics();
            let notifier = book.notifier();
            info!(
                "{} | mid: {} | spread: {:.1} bps | imbalance: {:+.3} | levels: {}/{} | updates: {} | latency: {}ms | notified: {} (dropped {})",
                book.symbol(),
                book.format_price(metrics.mid_price),
                metrics.spread_bps,
                metrics.imbalance,
                metrics.bid_levels,
                metrics.ask_levels,
                book.update_count(),
                book.latency_ms(),
                notifier.delivered(),
                notifier.dropped()
            );
        }

        info!(
            "✔ Validations: {} | failures: {}",
            validations.load(Ordering::Relaxed),
            failures.load(Ordering::Relaxed)
        );
    }
}
