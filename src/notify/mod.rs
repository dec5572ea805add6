use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// What changed in a book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpdateKind {
    Snapshot,
    Delta,
    Batch,
    Cleared,
    Stale,
}

/// Change notification pushed to every subscriber of a book
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookUpdate {
    pub symbol: Arc<str>,
    pub provider_id: Arc<str>,
    pub update_id: u64,
    pub kind: UpdateKind,
}

struct Subscriber {
    id: u64,
    tx: Sender<BookUpdate>,
}

/// Ordered subscriber list with one bounded channel per subscriber.
///
/// Delivery happens in subscription order. A full channel drops that
/// subscriber's copy of the notification (the subscriber reads current
/// state on its next wakeup anyway); a closed channel is pruned. Neither
/// affects delivery to anyone else.
pub struct Notifier {
    subscribers: RwLock<Vec<Subscriber>>,
    capacity: usize,
    next_id: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = channel::bounded(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push(Subscriber { id, tx });
        Subscription { id, rx }
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Deliver `update` to every subscriber. Returns how many received it.
    pub fn publish(&self, update: &BookUpdate) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        {
            let subscribers = self.subscribers.read();
            for subscriber in subscribers.iter() {
                match subscriber.tx.try_send(update.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Disconnected(_)) => closed.push(subscriber.id),
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write();
            subscribers.retain(|s| !closed.contains(&s.id));
            debug!(
                symbol = %update.symbol,
                remaining = subscribers.len(),
                "Pruned disconnected subscribers"
            );
        }

        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Notifications dropped because a subscriber's channel was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Receiving end of a book's change notifications
pub struct Subscription {
    id: u64,
    rx: Receiver<BookUpdate>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until the next notification. `None` once the book is gone.
    pub fn recv(&self) -> Option<BookUpdate> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<BookUpdate, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<BookUpdate, TryRecvError> {
        self.rx.try_recv()
    }

    /// Drain everything queued and return the most recent notification.
    pub fn latest(&self) -> Option<BookUpdate> {
        self.rx.try_iter().last()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(update_id: u64) -> BookUpdate {
        BookUpdate {
            symbol: Arc::from("BTCUSDT"),
            provider_id: Arc::from("sim"),
            update_id,
            kind: UpdateKind::Delta,
        }
    }

    #[test]
    fn test_delivery_in_order() {
        let notifier = Notifier::new(8);
        let first = notifier.subscribe();
        let second = notifier.subscribe();

        assert_eq!(notifier.publish(&update(1)), 2);
        assert_eq!(notifier.publish(&update(2)), 2);

        assert_eq!(first.recv().map(|u| u.update_id), Some(1));
        assert_eq!(first.recv().map(|u| u.update_id), Some(2));
        assert_eq!(second.latest().map(|u| u.update_id), Some(2));
        assert_eq!(second.pending(), 0);
    }

    #[test]
    fn test_slow_subscriber_isolated() {
        let notifier = Notifier::new(1);
        let slow = notifier.subscribe();
        let fast = notifier.subscribe();

        notifier.publish(&update(1));
        assert_eq!(fast.try_recv().map(|u| u.update_id), Ok(1));

        // slow's channel is still full; fast keeps receiving
        assert_eq!(notifier.publish(&update(2)), 1);
        assert_eq!(fast.try_recv().map(|u| u.update_id), Ok(2));
        assert_eq!(slow.try_recv().map(|u| u.update_id), Ok(1));
        assert_eq!(notifier.dropped(), 1);
    }

    #[test]
    fn test_dropped_subscriber_pruned() {
        let notifier = Notifier::new(4);
        let gone = notifier.subscribe();
        let kept = notifier.subscribe();
        drop(gone);

        assert_eq!(notifier.publish(&update(1)), 1);
        assert_eq!(notifier.subscriber_count(), 1);
        assert_eq!(kept.recv().map(|u| u.update_id), Some(1));
    }

    #[test]
    fn test_unsubscribe() {
        let notifier = Notifier::new(4);
        let sub = notifier.subscribe();

        assert!(notifier.unsubscribe(sub.id()));
        assert!(!notifier.unsubscribe(sub.id()));
        assert_eq!(notifier.publish(&update(1)), 0);
        assert!(sub.recv().is_none());
    }
}
