use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::orderbook::{LevelUpdate, Orderbook};

/// One incremental level change from a venue
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaEvent {
    /// Final (or only) update id carried by the event
    pub update_id: u64,
    /// First id covered, for venues that send id ranges
    pub first_update_id: Option<u64>,
    pub level: LevelUpdate,
    pub is_delete: bool,
}

impl DeltaEvent {
    pub fn new(update_id: u64, level: LevelUpdate) -> Self {
        Self {
            update_id,
            first_update_id: None,
            level,
            is_delete: false,
        }
    }

    pub fn delete(update_id: u64, level: LevelUpdate) -> Self {
        Self {
            is_delete: true,
            ..Self::new(update_id, level)
        }
    }

    pub fn with_first_update_id(mut self, first: u64) -> Self {
        self.first_update_id = Some(first);
        self
    }
}

/// Full book image from a venue
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotEvent {
    pub update_id: u64,
    pub asks: Vec<LevelUpdate>,
    pub bids: Vec<LevelUpdate>,
}

/// Something that can fetch a full book image, e.g. a venue's REST endpoint
pub trait SnapshotSource {
    fn fetch_snapshot(&self, symbol: &str, provider_id: &str) -> Result<SnapshotEvent>;
}

/// How the next update id must relate to the last applied one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequencePolicy {
    /// Next event must cover `last + 1`
    #[default]
    Strict,
    /// Any id above the last applied one is accepted
    Monotonic,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Deltas held while waiting for a snapshot before forcing a resync
    #[serde(default = "default_max_buffer_depth")]
    pub max_buffer_depth: usize,
    #[serde(default)]
    pub sequence_policy: SequencePolicy,
    /// Force a resync when a live book sees no update for this long (0 disables)
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    #[serde(default = "default_max_resync_attempts")]
    pub max_resync_attempts: u32,
}

fn default_max_buffer_depth() -> usize { 10_000 }
fn default_stale_after_ms() -> u64 { 30_000 }
fn default_max_resync_attempts() -> u32 { 5 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_buffer_depth: default_max_buffer_depth(),
            sequence_policy: SequencePolicy::default(),
            stale_after_ms: default_stale_after_ms(),
            max_resync_attempts: default_max_resync_attempts(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncState {
    /// Waiting for a snapshot; deltas are queued
    Buffering,
    /// Deltas are applied as they arrive
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied,
    Buffered,
    /// Update id at or below the last applied id; nothing changed
    Duplicate,
    /// The caller must fetch a new snapshot and pass it to `on_snapshot`
    ResyncRequired,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub applied: u64,
    pub buffered: u64,
    pub discarded: u64,
    pub gaps: u64,
    pub resyncs: u64,
    pub snapshots: u64,
    pub overflows: u64,
}

enum Sequence {
    Stale,
    Next,
    Gap { expected: u64 },
}

/// Merges a one-shot snapshot with a continuous delta stream into one book.
///
/// Driven by the venue adapter's single producer thread. Starts out
/// buffering: deltas that arrive before the snapshot are queued, the
/// snapshot is applied, queued deltas newer than it are replayed, and from
/// then on deltas are applied directly. A sequence gap marks the book stale
/// and drops back to buffering until the adapter supplies a new snapshot.
pub struct Reconciler {
    book: Arc<Orderbook>,
    config: SyncConfig,
    state: SyncState,
    buffer: VecDeque<DeltaEvent>,
    last_applied: u64,
    stats: ReconcileStats,
}

impl Reconciler {
    pub fn new(book: Arc<Orderbook>, config: SyncConfig) -> Self {
        let capacity = config.max_buffer_depth.min(1024);
        Self {
            book,
            config,
            state: SyncState::Buffering,
            buffer: VecDeque::with_capacity(capacity),
            last_applied: 0,
            stats: ReconcileStats::default(),
        }
    }

    pub fn book(&self) -> &Arc<Orderbook> {
        &self.book
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state == SyncState::Live
    }

    pub fn stats(&self) -> ReconcileStats {
        self.stats
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn last_applied_update_id(&self) -> u64 {
        self.last_applied
    }

    /// Start (or restart) buffering ahead of a snapshot request.
    ///
    /// Deltas already queued are kept, so calling this during an in-flight
    /// resync loses nothing.
    pub fn begin_resync(&mut self) {
        if self.state == SyncState::Live {
            self.stats.resyncs += 1;
            self.state = SyncState::Buffering;
            self.book.mark_stale();
            info!(symbol = %self.book.symbol(), last_applied = self.last_applied, "Resync requested");
        }
    }

    /// Feed one delta from the stream.
    pub fn on_delta(&mut self, delta: DeltaEvent) -> SyncOutcome {
        match self.state {
            SyncState::Buffering => self.buffer_delta(delta),
            SyncState::Live => match self.classify(&delta, self.last_applied) {
                Sequence::Stale => {
                    self.stats.discarded += 1;
                    SyncOutcome::Duplicate
                }
                Sequence::Next => {
                    self.book.apply_delta(&delta.level, delta.update_id, delta.is_delete);
                    self.last_applied = delta.update_id;
                    self.stats.applied += 1;
                    SyncOutcome::Applied
                }
                Sequence::Gap { expected } => {
                    let received = delta.update_id;
                    self.buffer.push_back(delta);
                    self.stats.buffered += 1;
                    self.on_gap(expected, received);
                    SyncOutcome::ResyncRequired
                }
            },
        }
    }

    /// Apply a snapshot and replay whatever was buffered after it.
    ///
    /// Returns `Applied` once the book is live, or `ResyncRequired` if the
    /// buffered stream does not connect to the snapshot.
    pub fn on_snapshot(&mut self, snapshot: SnapshotEvent) -> SyncOutcome {
        let baseline = snapshot.update_id;
        self.book.apply_snapshot(&snapshot.asks, &snapshot.bids, baseline);
        self.last_applied = baseline;
        self.stats.snapshots += 1;

        // Find the replayable prefix: stale ids are skipped, a gap stops the scan
        let mut last = baseline;
        let mut end = self.buffer.len();
        let mut discarded = 0;
        let mut gap = None;
        for (index, delta) in self.buffer.iter().enumerate() {
            match self.classify(delta, last) {
                Sequence::Stale => discarded += 1,
                Sequence::Next => last = delta.update_id,
                Sequence::Gap { expected } => {
                    end = index;
                    gap = Some((expected, delta.update_id));
                    break;
                }
            }
        }

        let replayed = self.book.apply_delta_batch(
            self.buffer
                .iter()
                .take(end)
                .map(|d| (&d.level, d.update_id, d.is_delete)),
        );
        self.buffer.drain(..end);
        self.last_applied = last;
        self.stats.applied += replayed as u64;
        self.stats.discarded += discarded;

        if let Some((expected, received)) = gap {
            self.on_gap(expected, received);
            return SyncOutcome::ResyncRequired;
        }

        self.state = SyncState::Live;
        info!(
            symbol = %self.book.symbol(),
            snapshot_id = baseline,
            replayed,
            discarded,
            last_applied = self.last_applied,
            "Book synchronized"
        );
        SyncOutcome::Applied
    }

    /// Run the whole protocol synchronously against `source`.
    pub fn sync_with<S: SnapshotSource + ?Sized>(&mut self, source: &S) -> Result<()> {
        self.begin_resync();

        for attempt in 1..=self.config.max_resync_attempts {
            let snapshot = source.fetch_snapshot(self.book.symbol(), self.book.provider_id())?;
            if self.on_snapshot(snapshot) == SyncOutcome::Applied {
                return Ok(());
            }
            debug!(symbol = %self.book.symbol(), attempt, "Snapshot did not connect to buffered deltas");
        }

        Err(EngineError::ResyncExhausted {
            symbol: self.book.symbol().to_string(),
            attempts: self.config.max_resync_attempts,
        })
    }

    /// One producer step: check the feed timeout, feed `deltas`, then resync
    /// against `source` whenever the book is not live.
    ///
    /// A failed resync leaves the reconciler buffering, so the next call
    /// retries it. The first call on a new reconciler performs the initial sync.
    pub fn drive<I, S>(&mut self, deltas: I, source: &S) -> Result<()>
    where
        I: IntoIterator<Item = DeltaEvent>,
        S: SnapshotSource + ?Sized,
    {
        self.check_feed_timeout();
        for delta in deltas {
            self.on_delta(delta);
        }

        if self.is_live() {
            return Ok(());
        }
        self.sync_with(source)
    }

    /// Drop back to buffering if a live book has gone quiet for too long.
    /// Returns true if a resync was started.
    pub fn check_feed_timeout(&mut self) -> bool {
        if self.state != SyncState::Live || self.config.stale_after_ms == 0 {
            return false;
        }

        let latency_ms = self.book.feed_latency_ms();
        if latency_ms <= self.config.stale_after_ms {
            return false;
        }

        warn!(symbol = %self.book.symbol(), latency_ms, "No update within feed timeout, resyncing");
        self.begin_resync();
        true
    }

    fn buffer_delta(&mut self, delta: DeltaEvent) -> SyncOutcome {
        if self.buffer.len() >= self.config.max_buffer_depth {
            self.stats.overflows += 1;
            self.stats.resyncs += 1;
            warn!(
                symbol = %self.book.symbol(),
                depth = self.buffer.len(),
                "Delta buffer overflow, discarding buffer and forcing resync"
            );
            self.buffer.clear();
            self.buffer.push_back(delta);
            self.stats.buffered += 1;
            return SyncOutcome::ResyncRequired;
        }

        self.buffer.push_back(delta);
        self.stats.buffered += 1;
        SyncOutcome::Buffered
    }

    fn on_gap(&mut self, expected: u64, received: u64) {
        self.stats.gaps += 1;
        self.stats.resyncs += 1;
        self.state = SyncState::Buffering;
        self.book.mark_stale();

        warn!(
            symbol = %self.book.symbol(),
            provider = %self.book.provider_id(),
            expected,
            received,
            lost = received.saturating_sub(expected),
            "Sequence gap detected, book stale until resync"
        );
    }

    fn classify(&self, delta: &DeltaEvent, last: u64) -> Sequence {
        if delta.update_id <= last {
            return Sequence::Stale;
        }

        match self.config.sequence_policy {
            SequencePolicy::Monotonic => Sequence::Next,
            SequencePolicy::Strict => {
                let first = delta.first_update_id.unwrap_or(delta.update_id);
                if first <= last + 1 {
                    Sequence::Next
                } else {
                    Sequence::Gap { expected: last + 1 }
                }
            }
        }
    }
}
