//! Document-change events.
//!
//! Applied remote merges are announced over bounded channels, the same
//! discipline as queue notifications: a subscriber that cannot keep up is
//! dropped rather than waited on, so event delivery can never block the merge
//! path or re-enter it.

use crate::types::SyncMetadata;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

/// Default event buffer per subscriber.
const DEFAULT_BUFFER_SIZE: usize = 64;

/// Identifier for a change subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChangeSubscriptionId(pub u64);

/// A document changed by an applied remote merge.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentChange {
    pub key: String,

    /// New body, or `None` when the change was a removal.
    pub body: Option<Vec<u8>>,

    /// Metadata of the winning version.
    pub meta: SyncMetadata,
}

struct ChangeSubscriber {
    id: ChangeSubscriptionId,
    sender: Sender<DocumentChange>,
}

/// Receiving side of a change subscription.
pub struct ChangeSubscription {
    pub id: ChangeSubscriptionId,
    receiver: Receiver<DocumentChange>,
}

impl ChangeSubscription {
    /// Wait for the next change.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<DocumentChange, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Non-blocking poll.
    pub fn try_recv(&self) -> std::result::Result<DocumentChange, TryRecvError> {
        self.receiver.try_recv()
    }
}

/// Fan-out of document changes to bounded subscriber channels.
#[derive(Default)]
pub struct ChangeBroadcaster {
    subscribers: RwLock<Vec<ChangeSubscriber>>,
    next_id: AtomicU64,
}

impl ChangeBroadcaster {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe with the default buffer.
    pub fn subscribe(&self) -> ChangeSubscription {
        self.subscribe_with_buffer(DEFAULT_BUFFER_SIZE)
    }

    /// Subscribe with an explicit buffer size.
    pub fn subscribe_with_buffer(&self, buffer: usize) -> ChangeSubscription {
        let id = ChangeSubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(buffer.max(1));
        self.subscribers
            .write()
            .push(ChangeSubscriber { id, sender });
        ChangeSubscription { id, receiver }
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, id: ChangeSubscriptionId) {
        self.subscribers.write().retain(|s| s.id != id);
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Broadcast one change. Subscribers whose buffers are full or whose
    /// receivers are gone get dropped.
    pub fn broadcast(&self, change: &DocumentChange) {
        let mut dropped = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for subscriber in subscribers.iter() {
                if subscriber.sender.try_send(change.clone()).is_err() {
                    dropped.push(subscriber.id);
                }
            }
        }

        if !dropped.is_empty() {
            warn!(count = dropped.len(), "dropping slow change subscribers");
            self.subscribers
                .write()
                .retain(|s| !dropped.contains(&s.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(key: &str) -> DocumentChange {
        DocumentChange {
            key: key.to_string(),
            body: Some(b"body".to_vec()),
            meta: SyncMetadata::new("client-b", 1),
        }
    }

    #[test]
    fn test_broadcast_reaches_all_subscribers() {
        let broadcaster = ChangeBroadcaster::new();
        let first = broadcaster.subscribe();
        let second = broadcaster.subscribe();

        broadcaster.broadcast(&change("k"));

        assert_eq!(first.try_recv().unwrap().key, "k");
        assert_eq!(second.try_recv().unwrap().key, "k");
    }

    #[test]
    fn test_removal_carries_no_body() {
        let broadcaster = ChangeBroadcaster::new();
        let subscription = broadcaster.subscribe();

        broadcaster.broadcast(&DocumentChange {
            key: "gone".to_string(),
            body: None,
            meta: SyncMetadata::new("client-b", 2),
        });

        assert!(subscription.try_recv().unwrap().body.is_none());
    }

    #[test]
    fn test_full_buffer_drops_subscriber() {
        let broadcaster = ChangeBroadcaster::new();
        let _subscription = broadcaster.subscribe_with_buffer(1);

        broadcaster.broadcast(&change("a"));
        broadcaster.broadcast(&change("b"));

        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let broadcaster = ChangeBroadcaster::new();
        let subscription = broadcaster.subscribe();
        broadcaster.unsubscribe(subscription.id);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}
