//! Document store facade.
//!
//! A [`DocumentStore`] ties together the storage engine, the Lamport clock,
//! and the mutation queue behind the local read/write API. Every local write
//! persists the document and its outbound mutation in one storage
//! transaction; remote merges go through [`DocumentStore::apply_remote_update`]
//! and never enqueue anything, so synchronized writes cannot echo back out.
//!
//! Stores are explicit handles: open as many as needed, each rooted at its
//! own directory. Cross-process exclusivity per directory is enforced by the
//! engine's lock file.

use crate::clock::LamportClock;
use crate::engine::{LogOp, StorageEngine};
use crate::error::Result;
use crate::query::{self, Query};
use crate::queue::MutationQueue;
use crate::types::{Document, Mutation, MutationKind, SyncMetadata};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Outcome of merging one remote version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The remote version won and was persisted.
    Applied,

    /// The stored version is causally newer or equal; nothing changed.
    /// Duplicate deliveries land here, which is what makes at-least-once
    /// transports safe.
    Rejected,
}

/// Configuration for opening a store.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Directory holding the store files.
    pub path: PathBuf,

    /// Stable identifier of this client, used as the origin of every local
    /// write. Must be unique across all replicas of the data set.
    pub client_id: String,

    /// Encryption key phrase; empty disables encryption. The key is not
    /// stored, only derived at open.
    pub encryption_key: String,

    /// Attachment read-cache capacity in entries.
    pub attachment_cache_size: usize,

    /// Create the store directory if it does not exist.
    pub create_if_missing: bool,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>, client_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            client_id: client_id.into(),
            encryption_key: String::new(),
            attachment_cache_size: 256,
            create_if_missing: true,
        }
    }

    pub fn encryption_key(mut self, key: impl Into<String>) -> Self {
        self.encryption_key = key.into();
        self
    }

    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }
}

/// Local-first document store handle.
pub struct DocumentStore {
    engine: Arc<StorageEngine>,

    queue: Arc<MutationQueue>,

    /// Also serializes every mutating operation, local or remote, so a merge
    /// decision and its commit are atomic with respect to local writes.
    clock: Mutex<LamportClock>,
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore").finish_non_exhaustive()
    }
}

impl DocumentStore {
    /// Open a store, replaying persisted state and resuming the clock from
    /// the highest counter found in it.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let engine = Arc::new(StorageEngine::open(
            &config.path,
            &config.encryption_key,
            config.attachment_cache_size,
            config.create_if_missing,
        )?);

        let clock = LamportClock::resume(config.client_id, engine.max_counter());
        let queue = Arc::new(MutationQueue::new(Arc::clone(&engine)));

        Ok(Self {
            engine,
            queue,
            clock: Mutex::new(clock),
        })
    }

    /// Write a document and enqueue it for sync, atomically.
    pub fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        let enqueued = {
            let mut clock = self.clock.lock();
            let meta = clock.tick();
            self.engine.commit(vec![
                LogOp::WriteDocument(Document::put(key, body.clone(), meta.clone())),
                LogOp::AppendMutation(Mutation::unsequenced(
                    key,
                    MutationKind::Put(body),
                    meta,
                )),
            ])?
        };
        self.queue.notify(&enqueued);
        Ok(())
    }

    /// Write several documents in one transaction. Either every document and
    /// its queue entry land, or none do.
    pub fn put_batch(&self, items: Vec<(String, Vec<u8>)>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let enqueued = {
            let mut clock = self.clock.lock();
            let mut ops = Vec::with_capacity(items.len() * 2);
            for (key, body) in items {
                let meta = clock.tick();
                ops.push(LogOp::WriteDocument(Document::put(
                    &key,
                    body.clone(),
                    meta.clone(),
                )));
                ops.push(LogOp::AppendMutation(Mutation::unsequenced(
                    key,
                    MutationKind::BatchPut(body),
                    meta,
                )));
            }
            self.engine.commit(ops)?
        };
        self.queue.notify(&enqueued);
        Ok(())
    }

    /// Delete a document, leaving a tombstone, and enqueue the removal.
    pub fn del(&self, key: &str) -> Result<()> {
        let enqueued = {
            let mut clock = self.clock.lock();
            let meta = clock.tick();
            self.engine.commit(vec![
                LogOp::WriteDocument(Document::tombstone(key, meta.clone())),
                LogOp::AppendMutation(Mutation::unsequenced(key, MutationKind::Delete, meta)),
            ])?
        };
        self.queue.notify(&enqueued);
        Ok(())
    }

    /// Read a document body. Tombstoned and absent documents are both `None`.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.engine
            .get(key)
            .filter(Document::is_visible)
            .map(|doc| doc.body)
    }

    /// Evaluate a query over the current snapshot.
    pub fn query(&self, query: &Query) -> Vec<Vec<u8>> {
        query::evaluate(query, &self.engine.scan_snapshot())
    }

    /// Merge a remote document write. Wins and persists only if its metadata
    /// supersedes what is stored; never enqueues.
    pub fn apply_remote_update(
        &self,
        key: &str,
        body: Vec<u8>,
        meta: SyncMetadata,
    ) -> Result<MergeOutcome> {
        self.merge_remote(Document::put(key, body, meta))
    }

    /// Merge a remote removal. Same rules as an update; the winner is a
    /// tombstone.
    pub fn apply_remote_removal(&self, key: &str, meta: SyncMetadata) -> Result<MergeOutcome> {
        self.merge_remote(Document::tombstone(key, meta))
    }

    fn merge_remote(&self, incoming: Document) -> Result<MergeOutcome> {
        // The clock lock is held across compare and commit, so a concurrent
        // local put cannot slip between the decision and the write.
        let mut clock = self.clock.lock();
        clock.observe(&incoming.meta);

        if let Some(existing) = self.engine.get(&incoming.key) {
            if !incoming.meta.supersedes(&existing.meta) {
                debug!(
                    key = %incoming.key,
                    incoming = incoming.meta.counter,
                    stored = existing.meta.counter,
                    "rejected stale remote version"
                );
                return Ok(MergeOutcome::Rejected);
            }
        }

        self.engine.commit(vec![LogOp::WriteDocument(incoming)])?;
        Ok(MergeOutcome::Applied)
    }

    /// Store an attachment for a document id. The document itself need not
    /// exist.
    pub fn put_attachment(&self, doc_id: &str, bytes: &[u8]) -> Result<()> {
        self.engine.put_attachment(doc_id, bytes)
    }

    /// Read an attachment.
    pub fn get_attachment(&self, doc_id: &str) -> Result<Option<Vec<u8>>> {
        self.engine.get_attachment(doc_id)
    }

    /// Number of local writes not yet acknowledged by sync.
    pub fn pending_mutation_count(&self) -> usize {
        self.queue.pending_count()
    }

    /// The outbound mutation queue.
    pub fn mutation_queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    /// This store's client id.
    pub fn client_id(&self) -> String {
        self.clock.lock().origin().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir, client_id: &str) -> DocumentStore {
        DocumentStore::open(StoreConfig::new(dir.path().join("store"), client_id)).unwrap()
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "client-a");

        store.put("k", b"v".to_vec()).unwrap();
        assert_eq!(store.get("k").unwrap(), b"v");
    }

    #[test]
    fn test_put_enqueues_mutation() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "client-a");

        store.put("k", b"v".to_vec()).unwrap();
        assert_eq!(store.pending_mutation_count(), 1);

        let pending = store.mutation_queue().all_pending();
        assert_eq!(pending[0].key, "k");
        assert!(matches!(pending[0].kind, MutationKind::Put(_)));
        assert_eq!(pending[0].meta.origin, "client-a");
    }

    #[test]
    fn test_del_tombstones_and_enqueues() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "client-a");

        store.put("k", b"v".to_vec()).unwrap();
        store.del("k").unwrap();

        assert!(store.get("k").is_none());
        assert_eq!(store.pending_mutation_count(), 2);
        assert!(matches!(
            store.mutation_queue().all_pending()[1].kind,
            MutationKind::Delete
        ));
    }

    #[test]
    fn test_batch_is_atomic_and_ordered() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "client-a");

        store
            .put_batch(vec![
                ("a".to_string(), b"1".to_vec()),
                ("b".to_string(), b"2".to_vec()),
            ])
            .unwrap();

        assert_eq!(store.get("a").unwrap(), b"1");
        assert_eq!(store.get("b").unwrap(), b"2");

        let pending = store.mutation_queue().all_pending();
        assert_eq!(pending.len(), 2);
        assert!(matches!(pending[0].kind, MutationKind::BatchPut(_)));
        // Each batch member carries its own counter.
        assert!(pending[1].meta.counter > pending[0].meta.counter);
    }

    #[test]
    fn test_remote_update_wins_when_newer() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "client-a");

        store.put("k", b"local".to_vec()).unwrap();
        let outcome = store
            .apply_remote_update("k", b"remote".to_vec(), SyncMetadata::new("client-b", 50))
            .unwrap();

        assert_eq!(outcome, MergeOutcome::Applied);
        assert_eq!(store.get("k").unwrap(), b"remote");
    }

    #[test]
    fn test_remote_update_rejected_when_stale() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "client-a");

        store
            .apply_remote_update("k", b"new".to_vec(), SyncMetadata::new("client-b", 50))
            .unwrap();
        let outcome = store
            .apply_remote_update("k", b"old".to_vec(), SyncMetadata::new("client-c", 3))
            .unwrap();

        assert_eq!(outcome, MergeOutcome::Rejected);
        assert_eq!(store.get("k").unwrap(), b"new");
    }

    #[test]
    fn test_remote_merge_never_enqueues() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "client-a");

        store
            .apply_remote_update("k", b"remote".to_vec(), SyncMetadata::new("client-b", 1))
            .unwrap();
        store
            .apply_remote_removal("k", SyncMetadata::new("client-b", 2))
            .unwrap();

        assert_eq!(store.pending_mutation_count(), 0);
    }

    #[test]
    fn test_local_write_after_remote_observation_supersedes() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "client-a");

        store
            .apply_remote_update("k", b"remote".to_vec(), SyncMetadata::new("client-z", 40))
            .unwrap();

        // The clock observed counter 40, so this local write stamps 41.
        store.put("k", b"local".to_vec()).unwrap();
        assert_eq!(store.get("k").unwrap(), b"local");
        assert_eq!(store.mutation_queue().all_pending()[0].meta.counter, 41);
    }

    #[test]
    fn test_remote_put_can_override_local_delete() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "client-a");

        store.put("k", b"v".to_vec()).unwrap();
        store.del("k").unwrap();
        assert!(store.get("k").is_none());

        let outcome = store
            .apply_remote_update("k", b"revived".to_vec(), SyncMetadata::new("client-b", 99))
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Applied);
        assert_eq!(store.get("k").unwrap(), b"revived");
    }

    #[test]
    fn test_clock_resumes_after_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store");

        {
            let store = DocumentStore::open(StoreConfig::new(&path, "client-a")).unwrap();
            store.put("a", b"1".to_vec()).unwrap();
            store.put("b", b"2".to_vec()).unwrap();
        }

        let store = DocumentStore::open(StoreConfig::new(&path, "client-a")).unwrap();
        store.put("c", b"3".to_vec()).unwrap();

        // Counters never regress across restart.
        let counters: Vec<u64> = store
            .mutation_queue()
            .all_pending()
            .iter()
            .map(|m| m.meta.counter)
            .collect();
        assert_eq!(counters, vec![1, 2, 3]);
    }

    #[test]
    fn test_attachments_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "client-a");

        store.put_attachment("doc-1", b"bytes").unwrap();
        assert_eq!(store.get_attachment("doc-1").unwrap().unwrap(), b"bytes");
        assert!(store.get_attachment("doc-2").unwrap().is_none());
    }
}
