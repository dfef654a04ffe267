//! Attachment storage.
//!
//! Attachments live in their own namespace, one file per document id, so
//! their size never affects document scans. The owning document does not
//! have to exist yet. File names are the SHA-256 of the document id, sharded
//! by the first hash byte.

use crate::engine::cipher::FrameCipher;
use crate::error::{Result, StoreError};
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// Magic bytes for attachment files.
const ATTACHMENT_MAGIC: &[u8; 4] = b"ATC\0";

/// Current attachment format version.
const ATTACHMENT_VERSION: u8 = 1;

/// Per-document attachment storage with an LRU read cache.
pub struct AttachmentStore {
    /// Base directory for attachments.
    path: PathBuf,

    /// Recently read attachment bodies, keyed by document id.
    cache: Mutex<LruCache<String, Vec<u8>>>,

    cipher: FrameCipher,
}

impl AttachmentStore {
    /// Create attachment storage at the given path.
    pub fn new(path: impl AsRef<Path>, cache_size: usize, cipher: FrameCipher) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap();

        Ok(Self {
            path,
            cache: Mutex::new(LruCache::new(cache_size)),
            cipher,
        })
    }

    /// Store an attachment, replacing any previous one for the same id.
    ///
    /// The file is written to a temporary path and renamed into place, so a
    /// crash mid-write leaves the previous attachment intact.
    pub fn put(&self, doc_id: &str, bytes: &[u8]) -> Result<()> {
        let sealed = self.cipher.seal(bytes)?;

        let final_path = self.attachment_path(doc_id);
        fs::create_dir_all(final_path.parent().expect("sharded path has a parent"))?;

        let tmp_path = final_path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(ATTACHMENT_MAGIC)?;
            file.write_all(&[ATTACHMENT_VERSION])?;
            file.write_all(&(sealed.len() as u64).to_le_bytes())?;
            file.write_all(&sealed)?;
            file.write_all(&crc32fast::hash(&sealed).to_le_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;

        self.cache.lock().put(doc_id.to_string(), bytes.to_vec());
        Ok(())
    }

    /// Get an attachment by document id.
    pub fn get(&self, doc_id: &str) -> Result<Option<Vec<u8>>> {
        if let Some(cached) = self.cache.lock().get(doc_id).cloned() {
            return Ok(Some(cached));
        }

        let path = self.attachment_path(doc_id);
        if !path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != ATTACHMENT_MAGIC {
            return Err(StoreError::InvalidFormat("invalid attachment magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != ATTACHMENT_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "unsupported attachment version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;

        let mut sealed = vec![0u8; len];
        file.read_exact(&mut sealed)?;

        let mut crc_bytes = [0u8; 4];
        file.read_exact(&mut crc_bytes)?;
        let stored = u32::from_le_bytes(crc_bytes);
        let computed = crc32fast::hash(&sealed);
        if stored != computed {
            return Err(StoreError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        let bytes = self.cipher.open(&sealed)?;

        self.cache.lock().put(doc_id.to_string(), bytes.clone());
        Ok(Some(bytes))
    }

    /// Check if an attachment exists.
    pub fn exists(&self, doc_id: &str) -> bool {
        if self.cache.lock().contains(doc_id) {
            return true;
        }
        self.attachment_path(doc_id).exists()
    }

    fn attachment_path(&self, doc_id: &str) -> PathBuf {
        let digest = Sha256::digest(doc_id.as_bytes());
        let name = hex::encode(digest);
        self.path.join(&name[..2]).join(name)
    }
}
