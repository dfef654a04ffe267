//! Outbound replay and inbound merge.
//!
//! The reconciler drains the durable mutation queue through a [`Transport`]
//! and feeds remote versions into the store's merge path. It holds no sync
//! state of its own: progress is the queue contents, and merge decisions are
//! a pure function of version metadata, so replay and merge are both safe to
//! repeat after a crash.

use crate::error::Result;
use crate::store::{DocumentStore, MergeOutcome};
use crate::sync::events::{ChangeBroadcaster, ChangeSubscription, DocumentChange};
use crate::types::{Mutation, MutationKind, SyncMetadata};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Delivery failure reported by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint cannot be reached right now; the mutation stays queued.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// The endpoint refused the mutation.
    #[error("mutation rejected by remote: {0}")]
    Rejected(String),
}

/// Delivers one mutation to the remote end.
///
/// Delivery is at-least-once: a confirmed mutation may still be re-delivered
/// after a crash between confirmation and acknowledgment, and remote peers
/// deduplicate on `(origin, counter)`.
pub trait Transport: Send + Sync {
    fn deliver(&self, mutation: &Mutation) -> std::result::Result<(), TransportError>;
}

/// What one replay pass accomplished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Mutations confirmed and acknowledged this pass.
    pub delivered: usize,

    /// Mutations still queued when the pass ended.
    pub remaining: usize,
}

/// Drives sync for one store over one transport.
pub struct SyncReconciler {
    store: Arc<DocumentStore>,
    transport: Arc<dyn Transport>,
    changes: ChangeBroadcaster,
}

impl SyncReconciler {
    pub fn new(store: Arc<DocumentStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            store,
            transport,
            changes: ChangeBroadcaster::new(),
        }
    }

    /// Replay pending mutations in sequence order.
    ///
    /// Each confirmed delivery is acknowledged before the next is attempted,
    /// so a crash mid-pass loses no progress. The pass stops at the first
    /// delivery failure; the failed mutation and everything after it stay
    /// queued for the next pass.
    pub fn replay_mutations(&self) -> Result<ReplaySummary> {
        let pending = self.store.mutation_queue().all_pending();
        let total = pending.len();
        let mut delivered = 0;

        for mutation in pending {
            match self.transport.deliver(&mutation) {
                Ok(()) => {
                    self.store.mutation_queue().acknowledge(mutation.sequence)?;
                    delivered += 1;
                }
                Err(err) => {
                    warn!(
                        sequence = %mutation.sequence,
                        key = %mutation.key,
                        %err,
                        "replay stopped on delivery failure"
                    );
                    break;
                }
            }
        }

        let summary = ReplaySummary {
            delivered,
            remaining: total - delivered,
        };
        info!(
            delivered = summary.delivered,
            remaining = summary.remaining,
            "replay pass finished"
        );
        Ok(summary)
    }

    /// Merge a remote document write, announcing it to change subscribers if
    /// it wins.
    pub fn on_remote_update(
        &self,
        key: &str,
        body: Vec<u8>,
        meta: SyncMetadata,
    ) -> Result<MergeOutcome> {
        let outcome = self
            .store
            .apply_remote_update(key, body.clone(), meta.clone())?;
        match outcome {
            MergeOutcome::Applied => self.changes.broadcast(&DocumentChange {
                key: key.to_string(),
                body: Some(body),
                meta,
            }),
            MergeOutcome::Rejected => {
                debug!(%key, "remote update lost to stored version");
            }
        }
        Ok(outcome)
    }

    /// Merge a remote removal.
    pub fn on_remote_removal(&self, key: &str, meta: SyncMetadata) -> Result<MergeOutcome> {
        let outcome = self.store.apply_remote_removal(key, meta.clone())?;
        if outcome == MergeOutcome::Applied {
            self.changes.broadcast(&DocumentChange {
                key: key.to_string(),
                body: None,
                meta,
            });
        }
        Ok(outcome)
    }

    /// Merge a mutation as received from a peer's replay.
    pub fn on_remote_mutation(&self, mutation: &Mutation) -> Result<MergeOutcome> {
        match &mutation.kind {
            MutationKind::Put(body) | MutationKind::BatchPut(body) => {
                self.on_remote_update(&mutation.key, body.clone(), mutation.meta.clone())
            }
            MutationKind::Delete => self.on_remote_removal(&mutation.key, mutation.meta.clone()),
        }
    }

    /// Subscribe to applied remote changes.
    pub fn subscribe_changes(&self) -> ChangeSubscription {
        self.changes.subscribe()
    }

    /// The store this reconciler drives.
    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }
}
