use lob_engine::orderbook::{BookLevel, LevelPool, LevelUpdate, Orderbook};
use lob_engine::pool::ObjectPool;
use lob_engine::sync::{DeltaEvent, Reconciler, SnapshotEvent, SyncConfig, SyncOutcome};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::thread;

fn book(capacity: usize) -> Orderbook {
    Orderbook::new("BTCUSDT", "sim", Arc::new(LevelPool::new(capacity)))
}

fn random_update(rng: &mut StdRng) -> LevelUpdate {
    let is_bid = rng.gen_bool(0.5);
    let base = if is_bid { 49_990 } else { 50_001 };
    let price = (base + rng.gen_range(0..10)) as f64;
    let size = if rng.gen_bool(0.2) {
        0.0
    } else {
        rng.gen_range(1..100) as f64 / 10.0
    };
    LevelUpdate::new(price, size, is_bid)
}

fn assert_invariants(ob: &Orderbook) {
    let (bids, asks) = ob.get_sorted_levels(usize::MAX);

    assert!(bids.windows(2).all(|w| w[0].0 > w[1].0), "bids not strictly descending: {:?}", bids);
    assert!(asks.windows(2).all(|w| w[0].0 < w[1].0), "asks not strictly ascending: {:?}", asks);
    assert!(bids.iter().chain(asks.iter()).all(|&(_, size)| size > 0.0));

    for (ladder, cumulative) in [(&bids, ob.bid_cumulative()), (&asks, ob.ask_cumulative())] {
        assert_eq!(ladder.len(), cumulative.len());
        let mut running = 0.0;
        for (level, cum) in ladder.iter().zip(cumulative.iter()) {
            running += level.1;
            assert_eq!(cum.price, level.0);
            assert!((cum.size - running).abs() < 1e-9);
        }
    }

    let mid = ob.mid_price();
    match (bids.first(), asks.first()) {
        (Some(bid), Some(ask)) => assert_eq!(mid, (bid.0 + ask.0) / 2.0),
        _ => {
            assert_eq!(mid, 0.0);
            assert_eq!(ob.imbalance(), 0.0);
        }
    }

    let imbalance = ob.imbalance();
    assert!((-1.0..=1.0).contains(&imbalance));
}

#[test]
fn test_invariants_hold_under_random_mutations() {
    let mut rng = StdRng::seed_from_u64(11);
    let ob = book(1024);

    for round in 0..5_000 {
        let update = random_update(&mut rng);
        if round % 7 == 0 {
            ob.delete_level(&update);
        } else {
            ob.add_or_update_level(&update);
        }
        assert_invariants(&ob);
    }
}

#[test]
fn test_snapshot_input_is_sorted_and_deduplicated() {
    let ob = book(64);
    let bids = vec![
        LevelUpdate::bid(99.0, 1.0),
        LevelUpdate::bid(100.0, 2.0),
        LevelUpdate::bid(99.0, 3.0),
        LevelUpdate::bid(98.0, 0.0),
    ];
    let asks = vec![LevelUpdate::ask(102.0, 1.0), LevelUpdate::ask(101.0, 1.0)];

    ob.load_data(&asks, &bids);
    assert_invariants(&ob);

    let (bid_levels, ask_levels) = ob.get_sorted_levels(10);
    assert_eq!(bid_levels, vec![(100.0, 2.0), (99.0, 3.0)]);
    assert_eq!(ask_levels, vec![(101.0, 1.0), (102.0, 1.0)]);
}

#[test]
fn test_empty_and_one_sided_books() {
    let ob = book(16);
    assert_invariants(&ob);

    ob.load_data(&[], &[LevelUpdate::bid(100.0, 5.0)]);
    assert_eq!(ob.mid_price(), 0.0);
    assert_eq!(ob.imbalance(), 0.0);
    assert_invariants(&ob);
}

#[test]
fn test_pool_round_trip() {
    let pool: ObjectPool<BookLevel> = ObjectPool::new(64);
    let mut warm: Vec<_> = (0..10).map(|_| pool.get()).collect();
    pool.put_all(&mut warm);

    let before = pool.available();
    let items: Vec<_> = (0..40).map(|_| pool.get()).collect();
    assert_eq!(pool.available(), before - 40);
    for item in items {
        pool.put(item);
    }
    assert_eq!(pool.available(), before);
}

#[test]
fn test_replayed_delta_is_ignored() {
    let ob = book(64);
    ob.apply_snapshot(&[LevelUpdate::ask(101.0, 5.0)], &[LevelUpdate::bid(100.0, 5.0)], 10);
    assert!(ob.apply_delta(&LevelUpdate::bid(100.0, 7.0), 11, false));

    let before = ob.get_sorted_levels(usize::MAX);
    assert!(!ob.apply_delta(&LevelUpdate::bid(100.0, 1.0), 11, false));
    assert!(!ob.apply_delta(&LevelUpdate::ask(101.0, 0.0), 9, false));
    assert_eq!(ob.get_sorted_levels(usize::MAX), before);
    assert_eq!(ob.last_applied_update_id(), 11);
}

#[test]
fn test_buffered_and_live_paths_converge() {
    let mut rng = StdRng::seed_from_u64(5);
    let snapshot = SnapshotEvent {
        update_id: 100,
        asks: (0..10).map(|i| LevelUpdate::ask(50_001.0 + i as f64, 1.0)).collect(),
        bids: (0..10).map(|i| LevelUpdate::bid(50_000.0 - i as f64, 1.0)).collect(),
    };
    let deltas: Vec<DeltaEvent> = (101..=400).map(|id| DeltaEvent::new(id, random_update(&mut rng))).collect();

    // Deltas arrive before the snapshot and are replayed
    let buffered = Arc::new(book(512));
    let mut reconciler = Reconciler::new(buffered.clone(), SyncConfig::default());
    for delta in &deltas {
        assert_eq!(reconciler.on_delta(delta.clone()), SyncOutcome::Buffered);
    }
    assert_eq!(reconciler.on_snapshot(snapshot.clone()), SyncOutcome::Applied);

    // Snapshot first, deltas applied live
    let live = Arc::new(book(512));
    let mut reconciler = Reconciler::new(live.clone(), SyncConfig::default());
    assert_eq!(reconciler.on_snapshot(snapshot), SyncOutcome::Applied);
    for delta in &deltas {
        assert_eq!(reconciler.on_delta(delta.clone()), SyncOutcome::Applied);
    }

    assert_eq!(buffered.last_applied_update_id(), 400);
    assert_eq!(live.last_applied_update_id(), 400);
    assert_eq!(buffered.get_sorted_levels(usize::MAX), live.get_sorted_levels(usize::MAX));
    assert_eq!(buffered.bid_cumulative(), live.bid_cumulative());
    assert_eq!(buffered.ask_cumulative(), live.ask_cumulative());
    assert_eq!(buffered.mid_price(), live.mid_price());
    assert_eq!(buffered.imbalance(), live.imbalance());
}

#[test]
fn test_buffered_delta_empties_bid_side() {
    let ob = Arc::new(book(16));
    let mut reconciler = Reconciler::new(ob.clone(), SyncConfig::default());

    assert_eq!(
        reconciler.on_delta(DeltaEvent::new(11, LevelUpdate::bid(100.0, 0.0))),
        SyncOutcome::Buffered
    );
    let outcome = reconciler.on_snapshot(SnapshotEvent {
        update_id: 10,
        asks: vec![LevelUpdate::ask(101.0, 5.0)],
        bids: vec![LevelUpdate::bid(100.0, 5.0)],
    });

    assert_eq!(outcome, SyncOutcome::Applied);
    let (bids, asks) = ob.get_sorted_levels(usize::MAX);
    assert!(bids.is_empty());
    assert_eq!(asks, vec![(101.0, 5.0)]);
    assert_eq!(ob.mid_price(), 0.0);
    assert_eq!(ob.imbalance(), 0.0);
}

#[test]
fn test_identical_reloads_are_bit_identical() {
    let ob = book(256);
    let asks: Vec<_> = (0..50).map(|i| LevelUpdate::ask(100.1 + i as f64 * 0.1, 0.1 * (i + 1) as f64)).collect();
    let bids: Vec<_> = (0..50).map(|i| LevelUpdate::bid(100.0 - i as f64 * 0.1, 0.3 * (i + 1) as f64)).collect();

    ob.load_data(&asks, &bids);
    let first = (ob.bid_cumulative(), ob.ask_cumulative());
    ob.load_data(&asks, &bids);
    let second = (ob.bid_cumulative(), ob.ask_cumulative());

    let bits = |levels: &[lob_engine::orderbook::CumulativeLevel]| {
        levels.iter().map(|l| (l.price.to_bits(), l.size.to_bits())).collect::<Vec<_>>()
    };
    assert_eq!(bits(&first.0), bits(&second.0));
    assert_eq!(bits(&first.1), bits(&second.1));
}

#[test]
fn test_pool_stress_million_operations() {
    let pool: Arc<ObjectPool<BookLevel>> = Arc::new(ObjectPool::new(800_000));
    let capacity = pool.capacity();
    let threads = 8;
    // Half the calls are gets, the rest puts
    let iterations = 1_000_000 / 2 / threads;

    let handles: Vec<_> = (0..threads)
        .map(|seed| {
            let pool = pool.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed as u64);
                let mut held = Vec::with_capacity(8);
                for _ in 0..iterations {
                    held.push(pool.get());
                    if held.len() == 8 || rng.gen_bool(0.5) {
                        let index = rng.gen_range(0..held.len());
                        pool.put(held.swap_remove(index));
                    }
                    let available = pool.available();
                    assert!(available <= capacity);
                }
                for item in held {
                    pool.put(item);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(pool.in_use(), 0);
    assert_eq!(pool.available(), capacity);
    assert!(pool.is_healthy());
}
