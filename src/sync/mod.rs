//! Synchronization: outbound mutation replay and inbound version merging.

pub mod events;
pub mod reconciler;

pub use events::{ChangeBroadcaster, ChangeSubscription, ChangeSubscriptionId, DocumentChange};
pub use reconciler::{ReplaySummary, SyncReconciler, Transport, TransportError};
