//! Append-only commit log.
//!
//! Every transaction is one frame: `len | sealed bytes | crc32`. The frame is
//! written, flushed, and fsynced before the commit is acknowledged, so a
//! commit is either fully on disk or absent. A torn final frame (crash mid
//! write) is detected by the length/checksum and truncated on open; earlier
//! frames are unaffected.

use crate::engine::cipher::FrameCipher;
use crate::error::{Result, StoreError};
use crate::types::{Document, Mutation, SequenceId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Magic bytes for the commit log.
const LOG_MAGIC: &[u8; 4] = b"SLG\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Header flag bit: payloads are encrypted.
const FLAG_ENCRYPTED: u8 = 0b0000_0001;

/// Header size: magic + version + flags.
const HEADER_SIZE: u64 = 6;

/// Sanity cap on a single frame (64 MB).
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// One durable operation inside a commit frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LogOp {
    /// Full or tombstoning document write.
    WriteDocument(Document),

    /// Append a mutation to the outbound queue.
    AppendMutation(Mutation),

    /// Remove a delivered mutation from the outbound queue.
    AckMutation(SequenceId),
}

/// Append-only transaction log with checksummed, optionally encrypted frames.
pub struct CommitLog {
    writer: Mutex<BufWriter<File>>,
    cipher: FrameCipher,
}

impl std::fmt::Debug for CommitLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitLog").finish_non_exhaustive()
    }
}

impl CommitLog {
    /// Open or create the log, replaying all committed frames.
    ///
    /// Returns the log handle and the committed transactions in append order.
    /// A torn final frame is truncated with a warning; a frame that fails to
    /// decrypt or decode after passing its checksum is a hard error.
    pub fn open(path: impl AsRef<Path>, cipher: FrameCipher) -> Result<(Self, Vec<Vec<LogOp>>)> {
        let path = path.as_ref().to_path_buf();

        let commits = if path.exists() {
            Self::replay(&path, &cipher)?
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;

            let flags = if cipher.is_encrypting() {
                FLAG_ENCRYPTED
            } else {
                0
            };
            file.write_all(LOG_MAGIC)?;
            file.write_all(&[LOG_VERSION, flags])?;
            file.sync_all()?;

            Vec::new()
        };

        let file = OpenOptions::new().append(true).open(&path)?;

        Ok((
            Self {
                writer: Mutex::new(BufWriter::new(file)),
                cipher,
            },
            commits,
        ))
    }

    /// Durably append one transaction frame. Returns only after fsync.
    pub fn append(&self, ops: &[LogOp]) -> Result<()> {
        let encoded = rmp_serde::to_vec(ops)?;
        let sealed = self.cipher.seal(&encoded)?;

        if sealed.len() > MAX_FRAME_SIZE {
            return Err(StoreError::InvalidFormat("commit frame too large".into()));
        }

        let mut writer = self.writer.lock();
        writer.write_all(&(sealed.len() as u32).to_le_bytes())?;
        writer.write_all(&sealed)?;
        writer.write_all(&crc32fast::hash(&sealed).to_le_bytes())?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        Ok(())
    }

    /// Read all committed frames, truncating a torn tail.
    fn replay(path: &Path, cipher: &FrameCipher) -> Result<Vec<Vec<LogOp>>> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(StoreError::InvalidFormat("invalid commit log magic".into()));
        }

        let mut meta = [0u8; 2];
        reader.read_exact(&mut meta)?;
        if meta[0] != LOG_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "unsupported commit log version: {}",
                meta[0]
            )));
        }
        let encrypted = meta[1] & FLAG_ENCRYPTED != 0;
        if encrypted != cipher.is_encrypting() {
            return Err(StoreError::Encryption(if encrypted {
                "store is encrypted but no key is configured".into()
            } else {
                "store was written without encryption but a key is configured".into()
            }));
        }

        let mut commits = Vec::new();
        let mut good_end = HEADER_SIZE;

        loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                // Clean end of log.
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_bytes) as usize;

            if len > MAX_FRAME_SIZE {
                Self::truncate_tail(path, good_end)?;
                break;
            }

            let mut sealed = vec![0u8; len];
            if reader.read_exact(&mut sealed).is_err() {
                Self::truncate_tail(path, good_end)?;
                break;
            }

            let mut crc_bytes = [0u8; 4];
            if reader.read_exact(&mut crc_bytes).is_err() {
                Self::truncate_tail(path, good_end)?;
                break;
            }
            if u32::from_le_bytes(crc_bytes) != crc32fast::hash(&sealed) {
                Self::truncate_tail(path, good_end)?;
                break;
            }

            // Checksum passed: decrypt/decode failures here are real
            // corruption or a wrong key, never a torn write.
            let encoded = cipher.open(&sealed)?;
            let ops: Vec<LogOp> = rmp_serde::from_slice(&encoded)?;

            good_end += 4 + len as u64 + 4;
            commits.push(ops);
        }

        Ok(commits)
    }

    fn truncate_tail(path: &Path, good_end: u64) -> Result<()> {
        warn!(?path, good_end, "truncating torn commit log tail");
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(good_end)?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MutationKind, SyncMetadata};
    use tempfile::TempDir;

    fn put_op(key: &str, counter: u64) -> LogOp {
        LogOp::WriteDocument(Document::put(
            key,
            b"body".to_vec(),
            SyncMetadata::new("client-a", counter),
        ))
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commits.log");

        {
            let (log, commits) = CommitLog::open(&path, FrameCipher::from_key("")).unwrap();
            assert!(commits.is_empty());

            log.append(&[put_op("a", 1)]).unwrap();
            log.append(&[
                put_op("b", 2),
                LogOp::AppendMutation(Mutation::unsequenced(
                    "b",
                    MutationKind::Put(b"body".to_vec()),
                    SyncMetadata::new("client-a", 2),
                )),
            ])
            .unwrap();
        }

        let (_log, commits) = CommitLog::open(&path, FrameCipher::from_key("")).unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].len(), 1);
        assert_eq!(commits[1].len(), 2);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commits.log");

        {
            let (log, _) = CommitLog::open(&path, FrameCipher::from_key("")).unwrap();
            log.append(&[put_op("a", 1)]).unwrap();
        }

        // Simulate a crash mid-frame: a length prefix with no payload.
        {
            use std::io::Write;
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&100u32.to_le_bytes()).unwrap();
            file.write_all(b"partial").unwrap();
        }

        let (log, commits) = CommitLog::open(&path, FrameCipher::from_key("")).unwrap();
        assert_eq!(commits.len(), 1);

        // The log accepts new appends after truncation.
        log.append(&[put_op("b", 2)]).unwrap();
        drop(log);

        let (_log, commits) = CommitLog::open(&path, FrameCipher::from_key("")).unwrap();
        assert_eq!(commits.len(), 2);
    }

    #[test]
    fn test_encrypted_replay_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commits.log");

        {
            let (log, _) = CommitLog::open(&path, FrameCipher::from_key("secret")).unwrap();
            log.append(&[put_op("a", 1)]).unwrap();
        }

        let (_log, commits) = CommitLog::open(&path, FrameCipher::from_key("secret")).unwrap();
        assert_eq!(commits.len(), 1);
    }

    #[test]
    fn test_wrong_key_fails_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commits.log");

        {
            let (log, _) = CommitLog::open(&path, FrameCipher::from_key("secret")).unwrap();
            log.append(&[put_op("a", 1)]).unwrap();
        }

        let err = CommitLog::open(&path, FrameCipher::from_key("wrong")).unwrap_err();
        assert!(matches!(err, StoreError::Encryption(_)));
    }

    #[test]
    fn test_mode_mismatch_fails_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commits.log");

        {
            let (_log, _) = CommitLog::open(&path, FrameCipher::from_key("secret")).unwrap();
        }

        let err = CommitLog::open(&path, FrameCipher::from_key("")).unwrap_err();
        assert!(matches!(err, StoreError::Encryption(_)));
    }

    #[test]
    fn test_plaintext_absent_from_encrypted_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commits.log");

        let (log, _) = CommitLog::open(&path, FrameCipher::from_key("secret")).unwrap();
        log.append(&[LogOp::WriteDocument(Document::put(
            "k",
            b"super secret body".to_vec(),
            SyncMetadata::new("client-a", 1),
        ))])
        .unwrap();
        drop(log);

        let raw = std::fs::read(&path).unwrap();
        assert!(!raw
            .windows(b"super secret body".len())
            .any(|w| w == b"super secret body"));
    }
}
