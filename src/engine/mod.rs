//! Durable storage engine.
//!
//! The engine owns all persisted state: the document table and the mutation
//! log live in one append-only commit log (replayed into memory on open),
//! attachments live in their own file namespace. A [`StorageEngine::commit`]
//! is all-or-nothing: every operation in the frame becomes visible together
//! or the whole frame fails.

pub mod attachments;
pub mod cipher;
pub mod log;

pub use attachments::AttachmentStore;
pub use cipher::FrameCipher;
pub use log::{CommitLog, LogOp};

use crate::error::{Result, StoreError};
use crate::types::{Document, Mutation, SequenceId};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, info};

/// Magic bytes for the store manifest.
const STORE_MAGIC: &[u8; 4] = b"SAT\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// In-memory image of the commit log.
#[derive(Default)]
struct EngineState {
    /// Latest version of every document, tombstones included.
    documents: HashMap<String, Document>,

    /// Unacknowledged outbound mutations, ordered by sequence.
    pending: BTreeMap<SequenceId, Mutation>,

    /// Next queue position to hand out.
    next_sequence: SequenceId,
}

impl EngineState {
    fn apply(&mut self, op: LogOp) {
        match op {
            LogOp::WriteDocument(doc) => {
                self.documents.insert(doc.key.clone(), doc);
            }
            LogOp::AppendMutation(mutation) => {
                if mutation.sequence.next() > self.next_sequence {
                    self.next_sequence = mutation.sequence.next();
                }
                self.pending.insert(mutation.sequence, mutation);
            }
            LogOp::AckMutation(sequence) => {
                self.pending.remove(&sequence);
            }
        }
    }
}

/// Durable, optionally encrypted document and mutation-log persistence.
///
/// Writers serialize on an internal lock; readers clone snapshots under a
/// read lock and never observe a half-committed transaction.
pub struct StorageEngine {
    /// Lock file for exclusive access.
    _lock_file: File,

    log: CommitLog,

    attachments: AttachmentStore,

    state: RwLock<EngineState>,

    /// Serializes commits so sequence assignment and log order agree.
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine").finish_non_exhaustive()
    }
}

impl StorageEngine {
    /// Open an existing engine or create a new one.
    ///
    /// Fails atomically: bad path, foreign manifest, another live process,
    /// or a wrong/missing encryption key all leave nothing standing up.
    pub fn open(
        path: &Path,
        encryption_key: &str,
        attachment_cache_size: usize,
        create_if_missing: bool,
    ) -> Result<Self> {
        let manifest_path = path.join("MANIFEST");
        if manifest_path.exists() {
            Self::verify_manifest(path)?;
        } else if create_if_missing {
            fs::create_dir_all(path)?;
            Self::write_manifest(path)?;
        } else {
            return Err(StoreError::NotInitialized);
        }

        let lock_file = Self::acquire_lock(path)?;

        let cipher = FrameCipher::from_key(encryption_key);
        let (log, commits) = CommitLog::open(path.join("commits.log"), cipher.clone())?;

        let mut state = EngineState {
            next_sequence: SequenceId(1),
            ..Default::default()
        };
        for ops in commits {
            for op in ops {
                state.apply(op);
            }
        }

        let attachments =
            AttachmentStore::new(path.join("attachments"), attachment_cache_size, cipher)?;

        info!(
            documents = state.documents.len(),
            pending = state.pending.len(),
            encrypted = !encryption_key.is_empty(),
            "opened storage engine"
        );

        Ok(Self {
            _lock_file: lock_file,
            log,
            attachments,
            state: RwLock::new(state),
            write_lock: Mutex::new(()),
        })
    }

    /// Durably commit one transaction.
    ///
    /// Queue positions for `AppendMutation` ops are assigned here, under the
    /// writer lock, so persisted sequence ids are strictly increasing.
    /// Returns the enqueued mutations with their assigned sequences. If the
    /// log append fails nothing becomes visible, queued or otherwise.
    pub fn commit(&self, mut ops: Vec<LogOp>) -> Result<Vec<Mutation>> {
        let _guard = self.write_lock.lock();

        let mut next = self.state.read().next_sequence;
        let mut enqueued = Vec::new();
        for op in &mut ops {
            if let LogOp::AppendMutation(mutation) = op {
                mutation.sequence = next;
                next = next.next();
                enqueued.push(mutation.clone());
            }
        }

        // Durable before visible.
        self.log.append(&ops)?;

        let mut state = self.state.write();
        let count = ops.len();
        for op in ops {
            state.apply(op);
        }
        debug!(ops = count, enqueued = enqueued.len(), "committed transaction");

        Ok(enqueued)
    }

    /// Get the stored version of a document, tombstones included.
    pub fn get(&self, key: &str) -> Option<Document> {
        self.state.read().documents.get(key).cloned()
    }

    /// Point-in-time snapshot of every stored document.
    ///
    /// The clone is taken under the read lock, so a concurrent commit is
    /// either fully present or fully absent.
    pub fn scan_snapshot(&self) -> Vec<Document> {
        self.state.read().documents.values().cloned().collect()
    }

    /// Unacknowledged mutations in sequence order.
    pub fn pending(&self) -> Vec<Mutation> {
        self.state.read().pending.values().cloned().collect()
    }

    /// Number of unacknowledged mutations.
    pub fn pending_count(&self) -> usize {
        self.state.read().pending.len()
    }

    /// Highest Lamport counter present in persisted state, across documents
    /// and pending mutations. Used to resume the local clock on open.
    pub fn max_counter(&self) -> u64 {
        let state = self.state.read();
        let docs = state.documents.values().map(|d| d.meta.counter);
        let pending = state.pending.values().map(|m| m.meta.counter);
        docs.chain(pending).max().unwrap_or(0)
    }

    /// Store an attachment.
    pub fn put_attachment(&self, doc_id: &str, bytes: &[u8]) -> Result<()> {
        self.attachments.put(doc_id, bytes)
    }

    /// Get an attachment.
    pub fn get_attachment(&self, doc_id: &str) -> Result<Option<Vec<u8>>> {
        self.attachments.get(doc_id)
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;
        Ok(lock_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MutationKind, SyncMetadata};
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> StorageEngine {
        StorageEngine::open(&dir.path().join("store"), "", 100, true).unwrap()
    }

    fn meta(counter: u64) -> SyncMetadata {
        SyncMetadata::new("client-a", counter)
    }

    #[test]
    fn test_commit_is_visible_together() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);

        engine
            .commit(vec![
                LogOp::WriteDocument(Document::put("a", b"1".to_vec(), meta(1))),
                LogOp::WriteDocument(Document::put("b", b"2".to_vec(), meta(2))),
            ])
            .unwrap();

        assert_eq!(engine.get("a").unwrap().body, b"1");
        assert_eq!(engine.get("b").unwrap().body, b"2");
    }

    #[test]
    fn test_sequences_assigned_in_order() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);

        let first = engine
            .commit(vec![LogOp::AppendMutation(Mutation::unsequenced(
                "a",
                MutationKind::Put(b"1".to_vec()),
                meta(1),
            ))])
            .unwrap();
        let second = engine
            .commit(vec![LogOp::AppendMutation(Mutation::unsequenced(
                "b",
                MutationKind::Put(b"2".to_vec()),
                meta(2),
            ))])
            .unwrap();

        assert_eq!(first[0].sequence, SequenceId(1));
        assert_eq!(second[0].sequence, SequenceId(2));
        assert_eq!(engine.pending_count(), 2);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store");

        {
            let engine = StorageEngine::open(&path, "", 100, true).unwrap();
            engine
                .commit(vec![
                    LogOp::WriteDocument(Document::put("a", b"1".to_vec(), meta(1))),
                    LogOp::AppendMutation(Mutation::unsequenced(
                        "a",
                        MutationKind::Put(b"1".to_vec()),
                        meta(1),
                    )),
                ])
                .unwrap();
        }

        let engine = StorageEngine::open(&path, "", 100, true).unwrap();
        assert_eq!(engine.get("a").unwrap().body, b"1");
        assert_eq!(engine.pending_count(), 1);

        // Sequence numbering continues where it left off.
        let assigned = engine
            .commit(vec![LogOp::AppendMutation(Mutation::unsequenced(
                "b",
                MutationKind::Put(b"2".to_vec()),
                meta(2),
            ))])
            .unwrap();
        assert_eq!(assigned[0].sequence, SequenceId(2));
    }

    #[test]
    fn test_ack_removes_pending_durably() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store");

        {
            let engine = StorageEngine::open(&path, "", 100, true).unwrap();
            let assigned = engine
                .commit(vec![LogOp::AppendMutation(Mutation::unsequenced(
                    "a",
                    MutationKind::Put(b"1".to_vec()),
                    meta(1),
                ))])
                .unwrap();
            engine
                .commit(vec![LogOp::AckMutation(assigned[0].sequence)])
                .unwrap();
            assert_eq!(engine.pending_count(), 0);
        }

        let engine = StorageEngine::open(&path, "", 100, true).unwrap();
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn test_snapshot_isolation() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);

        engine
            .commit(vec![LogOp::WriteDocument(Document::put(
                "a",
                b"1".to_vec(),
                meta(1),
            ))])
            .unwrap();

        let snapshot = engine.scan_snapshot();
        engine
            .commit(vec![LogOp::WriteDocument(Document::put(
                "b",
                b"2".to_vec(),
                meta(2),
            ))])
            .unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(engine.scan_snapshot().len(), 2);
    }

    #[test]
    fn test_second_open_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store");

        let _engine = StorageEngine::open(&path, "", 100, true).unwrap();
        let err = StorageEngine::open(&path, "", 100, true).unwrap_err();
        assert!(matches!(err, StoreError::Locked));
    }

    #[test]
    fn test_missing_store_without_create() {
        let dir = TempDir::new().unwrap();
        let err = StorageEngine::open(&dir.path().join("absent"), "", 100, false).unwrap_err();
        assert!(matches!(err, StoreError::NotInitialized));
    }

    #[test]
    fn test_max_counter_recovery() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);

        engine
            .commit(vec![
                LogOp::WriteDocument(Document::put("a", b"1".to_vec(), meta(3))),
                LogOp::WriteDocument(Document::put(
                    "b",
                    b"2".to_vec(),
                    SyncMetadata::new("client-b", 9),
                )),
            ])
            .unwrap();

        assert_eq!(engine.max_counter(), 9);
    }
}
