use crossbeam::queue::ArrayQueue;
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, warn};

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// Contract for types that can be recycled by an [`ObjectPool`].
pub trait Poolable: Default + Send {
    /// Restore the instance to its default state before it re-enters the pool.
    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// An instance handed out by an [`ObjectPool`].
///
/// Move-only: an instance can live in exactly one place at a time. The
/// origin tag records which pool minted it, or `None` for transient
/// instances allocated while the pool was exhausted.
#[derive(Debug)]
pub struct Pooled<T> {
    value: Box<T>,
    origin: Option<u32>,
}

impl<T> Pooled<T> {
    /// True if this instance was allocated outside the pool's capacity.
    #[inline]
    pub fn is_transient(&self) -> bool {
        self.origin.is_none()
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Pooled<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub in_use: usize,
    pub utilization_pct: f64,
    pub peak_utilization_pct: f64,
    pub total_gets: u64,
    pub total_returns: u64,
    pub created: u64,
    pub transient_created: u64,
    pub discarded: u64,
    pub healthy: bool,
}

/// Lock-free, fixed-capacity recycler.
///
/// Released instances sit in a crossbeam `ArrayQueue` (CAS over head/tail
/// stamps in a fixed slot array). Capacity is rounded up to the next power
/// of two. Instances are minted lazily up to capacity; past that, `get`
/// falls back to transient allocations which `put` never admits.
pub struct ObjectPool<T: Poolable> {
    id: u32,
    slots: ArrayQueue<Box<T>>,
    capacity: usize,

    // Number of pooled (non-transient) instances ever minted and still owned
    minted: AtomicUsize,
    peak_in_use: AtomicUsize,

    total_gets: AtomicU64,
    total_returns: AtomicU64,
    created: AtomicU64,
    transient_created: AtomicU64,
    discarded: AtomicU64,
}

impl<T: Poolable> ObjectPool<T> {
    pub fn new(requested_capacity: usize) -> Self {
        let capacity = requested_capacity.max(1).next_power_of_two();
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);

        debug!(pool_id = id, requested_capacity, capacity, "Object pool created");

        Self {
            id,
            slots: ArrayQueue::new(capacity),
            capacity,
            minted: AtomicUsize::new(0),
            peak_in_use: AtomicUsize::new(0),
            total_gets: AtomicU64::new(0),
            total_returns: AtomicU64::new(0),
            created: AtomicU64::new(0),
            transient_created: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Pool with `count` instances minted up front to avoid first-use jitter.
    pub fn with_warmup(requested_capacity: usize, count: usize) -> Self {
        let pool = Self::new(requested_capacity);
        let count = count.min(pool.capacity);

        for _ in 0..count {
            if pool.try_mint() {
                pool.created.fetch_add(1, Ordering::Relaxed);
                if pool.slots.push(Box::default()).is_err() {
                    pool.minted.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }

        pool
    }

    /// Acquire an instance. Never blocks and never fails.
    #[inline]
    pub fn get(&self) -> Pooled<T> {
        self.total_gets.fetch_add(1, Ordering::Relaxed);

        let pooled = match self.slots.pop() {
            Some(value) => Pooled { value, origin: Some(self.id) },
            None if self.try_mint() => {
                self.created.fetch_add(1, Ordering::Relaxed);
                Pooled { value: Box::default(), origin: Some(self.id) }
            }
            None => return self.transient(),
        };

        self.record_peak();
        pooled
    }

    /// Release an instance back to the pool.
    ///
    /// Transient instances and instances minted by a different pool are
    /// dropped instead of being admitted.
    #[inline]
    pub fn put(&self, mut item: Pooled<T>) {
        self.total_returns.fetch_add(1, Ordering::Relaxed);

        if item.origin != Some(self.id) {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        item.value.reset();
        if self.slots.push(item.value).is_err() {
            // Queue full: drop the instance and free its mint slot
            self.minted.fetch_sub(1, Ordering::AcqRel);
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Release every instance in `items`, leaving the vector empty with its capacity intact.
    pub fn put_all(&self, items: &mut Vec<Pooled<T>>) {
        for item in items.drain(..) {
            self.put(item);
        }
    }

    /// Instances that can be handed out without a transient allocation.
    #[inline]
    pub fn available(&self) -> usize {
        let minted = self.minted.load(Ordering::Acquire).min(self.capacity);
        (self.slots.len() + (self.capacity - minted)).min(self.capacity)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.capacity - self.available()
    }

    pub fn utilization_pct(&self) -> f64 {
        self.in_use() as f64 / self.capacity as f64 * 100.0
    }

    pub fn peak_utilization_pct(&self) -> f64 {
        self.peak_in_use.load(Ordering::Relaxed) as f64 / self.capacity as f64 * 100.0
    }

    pub fn total_gets(&self) -> u64 {
        self.total_gets.load(Ordering::Relaxed)
    }

    pub fn total_returns(&self) -> u64 {
        self.total_returns.load(Ordering::Relaxed)
    }

    /// False once total allocations exceed twice the capacity (undersized pool or a leak).
    pub fn is_healthy(&self) -> bool {
        self.created.load(Ordering::Relaxed) <= 2 * self.capacity as u64
    }

    pub fn stats(&self) -> PoolStats {
        let available = self.available();
        PoolStats {
            capacity: self.capacity,
            available,
            in_use: self.capacity - available,
            utilization_pct: (self.capacity - available) as f64 / self.capacity as f64 * 100.0,
            peak_utilization_pct: self.peak_utilization_pct(),
            total_gets: self.total_gets(),
            total_returns: self.total_returns(),
            created: self.created.load(Ordering::Relaxed),
            transient_created: self.transient_created.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            healthy: self.is_healthy(),
        }
    }

    fn try_mint(&self) -> bool {
        self.minted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |minted| {
                (minted < self.capacity).then_some(minted + 1)
            })
            .is_ok()
    }

    fn transient(&self) -> Pooled<T> {
        self.created.fetch_add(1, Ordering::Relaxed);
        let misses = self.transient_created.fetch_add(1, Ordering::Relaxed) + 1;

        // Log the 1st, 2nd, 4th, 8th... miss so a sustained shortage does not flood the log
        if misses.is_power_of_two() {
            warn!(
                pool_id = self.id,
                capacity = self.capacity,
                transient = misses,
                "Object pool exhausted, allocating transient instance"
            );
        }

        self.record_peak();
        Pooled { value: Box::default(), origin: None }
    }

    #[inline]
    fn record_peak(&self) {
        self.peak_in_use.fetch_max(self.in_use(), Ordering::Relaxed);
    }
}
