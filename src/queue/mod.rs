//! Durable mutation queue.
//!
//! The queue is the outbound half of sync: every local write appends a
//! [`Mutation`] here in the same storage transaction as the document write,
//! so a crash can never leave an un-synced document or an orphaned queue
//! entry. Entries leave the queue only when [`MutationQueue::acknowledge`]
//! confirms delivery.
//!
//! Enqueue notifications travel over bounded channels rather than a
//! synchronous callback, so a subscriber can never block the writing thread
//! or re-enter the write path; a subscriber that falls behind its buffer is
//! dropped, not waited on.

use crate::engine::{LogOp, StorageEngine};
use crate::error::Result;
use crate::types::{Mutation, SequenceId};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default notification buffer per subscriber.
const DEFAULT_BUFFER_SIZE: usize = 64;

/// Identifier for a queue subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Notification sent after a successful durable enqueue.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueEvent {
    pub sequence: SequenceId,
    pub key: String,
}

struct Subscriber {
    id: SubscriptionId,
    sender: Sender<QueueEvent>,
}

/// Receiving side of a queue subscription.
pub struct QueueSubscription {
    pub id: SubscriptionId,
    receiver: Receiver<QueueEvent>,
}

impl QueueSubscription {
    /// Wait for the next enqueue notification.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<QueueEvent, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Non-blocking poll.
    pub fn try_recv(&self) -> std::result::Result<QueueEvent, TryRecvError> {
        self.receiver.try_recv()
    }
}

/// Append-only durable log of not-yet-synchronized local writes.
pub struct MutationQueue {
    engine: Arc<StorageEngine>,
    subscribers: RwLock<Vec<Subscriber>>,
    next_subscription_id: AtomicU64,
}

impl MutationQueue {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self {
            engine,
            subscribers: RwLock::new(Vec::new()),
            next_subscription_id: AtomicU64::new(1),
        }
    }

    /// Durably append a mutation on its own.
    ///
    /// The document-store facade normally persists the mutation inside the
    /// same transaction as its document write and then calls
    /// [`MutationQueue::notify`]; this entry point exists for callers that
    /// only need the queue. A failed append leaves nothing behind.
    pub fn enqueue(&self, mutation: Mutation) -> Result<()> {
        let assigned = self.engine.commit(vec![LogOp::AppendMutation(mutation)])?;
        self.notify(&assigned);
        Ok(())
    }

    /// All unacknowledged mutations, by sequence ascending.
    pub fn all_pending(&self) -> Vec<Mutation> {
        self.engine.pending()
    }

    /// Number of unacknowledged mutations.
    pub fn pending_count(&self) -> usize {
        self.engine.pending_count()
    }

    /// Durably remove a delivered mutation.
    ///
    /// Called only after the transport confirms receipt; a crash before the
    /// acknowledgment leaves the mutation pending for the next replay.
    pub fn acknowledge(&self, sequence: SequenceId) -> Result<()> {
        self.engine.commit(vec![LogOp::AckMutation(sequence)])?;
        debug!(%sequence, "acknowledged mutation");
        Ok(())
    }

    /// Subscribe to enqueue notifications with the default buffer.
    pub fn subscribe(&self) -> QueueSubscription {
        self.subscribe_with_buffer(DEFAULT_BUFFER_SIZE)
    }

    /// Subscribe with an explicit buffer size.
    pub fn subscribe_with_buffer(&self, buffer: usize) -> QueueSubscription {
        let id = SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(buffer.max(1));
        self.subscribers.write().push(Subscriber { id, sender });
        QueueSubscription { id, receiver }
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.write().retain(|s| s.id != id);
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Broadcast enqueue notifications. Subscribers whose buffers are full
    /// or whose receivers are gone get dropped.
    ///
    /// Events are wake-up hints, not an ordered stream: notification happens
    /// outside the commit lock, so concurrent commits may notify out of
    /// sequence order. Consumers read [`MutationQueue::all_pending`] for the
    /// ordered truth.
    pub(crate) fn notify(&self, mutations: &[Mutation]) {
        if mutations.is_empty() {
            return;
        }

        let mut dropped = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for subscriber in subscribers.iter() {
                for mutation in mutations {
                    let event = QueueEvent {
                        sequence: mutation.sequence,
                        key: mutation.key.clone(),
                    };
                    if subscriber.sender.try_send(event).is_err() {
                        dropped.push(subscriber.id);
                        break;
                    }
                }
            }
        }

        if !dropped.is_empty() {
            warn!(count = dropped.len(), "dropping slow queue subscribers");
            self.subscribers
                .write()
                .retain(|s| !dropped.contains(&s.id));
        }
    }
}
