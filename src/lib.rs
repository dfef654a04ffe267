//! # Satchel
//!
//! A local-first, offline-capable document store. Writes land on local disk
//! immediately and synchronize later; conflicting versions are resolved
//! deterministically so every replica converges to the same winner.
//!
//! ## Core Concepts
//!
//! - **Documents**: Keyed, versioned payloads in durable, optionally
//!   encrypted storage
//! - **Mutation Queue**: Every local write is durably queued for outbound
//!   sync in the same transaction
//! - **Reconciler**: Replays the queue over a transport and merges remote
//!   versions by `(counter, origin)` last-writer-wins
//! - **Queries**: Stateless filter/sort/limit evaluation over snapshots
//!
//! ## Example
//!
//! ```ignore
//! use satchel::{DocumentStore, StoreConfig, Query, FilterOp};
//! use serde_json::json;
//!
//! let store = DocumentStore::open(StoreConfig::new("./my-store", "client-a"))?;
//!
//! // Write locally; the mutation is queued for sync atomically.
//! store.put("txn-1", serde_json::to_vec(&json!({
//!     "status": "open", "amount": 12.5,
//! }))?)?;
//!
//! // Query the local snapshot.
//! let open = store.query(&Query::new().filter("status", FilterOp::Eq, json!("open")));
//! ```

pub mod clock;
pub mod engine;
pub mod error;
pub mod query;
pub mod queue;
pub mod store;
pub mod sync;
pub mod types;

// Re-exports
pub use clock::LamportClock;
pub use engine::{AttachmentStore, CommitLog, FrameCipher, LogOp, StorageEngine};
pub use error::{Result, StoreError};
pub use query::{evaluate, FilterOp, Query, QueryFilter};
pub use queue::{MutationQueue, QueueEvent, QueueSubscription, SubscriptionId};
pub use store::{DocumentStore, MergeOutcome, StoreConfig};
pub use sync::{
    ChangeSubscription, DocumentChange, ReplaySummary, SyncReconciler, Transport, TransportError,
};
pub use types::*;
