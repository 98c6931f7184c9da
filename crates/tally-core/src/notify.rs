//! Change notification
//!
//! The storage engine calls every registered [`TransactionObserver`] after each
//! write transaction finishes. [`ChangeBus`] turns successful commits into a
//! broadcast wake-up signal. The signal carries no data: subscribers re-query
//! the store with their token to find out what changed.

use tokio::sync::broadcast;
use tracing::trace;

/// Wake-up signal sent once per committed write transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDidChange;

/// Hook run by the writer after each write transaction
pub trait TransactionObserver: Send + Sync {
    /// The transaction committed
    fn did_commit(&self);

    /// The transaction was rolled back
    fn did_rollback(&self) {}
}

/// Process-wide broadcast of commit signals
#[derive(Debug, Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<DataDidChange>,
}

impl ChangeBus {
    /// Create a bus buffering up to `capacity` unread signals per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to commit signals
    ///
    /// A lagging subscriber sees `RecvError::Lagged`, which should be handled
    /// the same as a signal.
    pub fn subscribe(&self) -> broadcast::Receiver<DataDidChange> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl TransactionObserver for ChangeBus {
    fn did_commit(&self) {
        // Err only means nobody is listening
        let delivered = self.tx.send(DataDidChange).unwrap_or(0);
        trace!(subscribers = delivered, "Posted change notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn test_commit_reaches_every_subscriber() {
        let bus = ChangeBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.did_commit();

        assert_eq!(a.try_recv().unwrap(), DataDidChange);
        assert_eq!(b.try_recv().unwrap(), DataDidChange);
        assert_eq!(a.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_rollback_is_silent() {
        let bus = ChangeBus::new(8);
        let mut rx = bus.subscribe();
        bus.did_rollback();
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_commit_without_subscribers_is_harmless() {
        let bus = ChangeBus::new(0);
        bus.did_commit();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_lagging_subscriber_is_told() {
        let bus = ChangeBus::new(1);
        let mut rx = bus.subscribe();
        bus.did_commit();
        bus.did_commit();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Lagged(_))));
    }
}
