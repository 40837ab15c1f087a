//! Durable workload cache keyed by workload identity.
//!
//! Each entry is a pair of files named after the SHA-256 of the identity:
//! `<hash>.bin` holding the verified bytes and `<hash>.meta.json` describing
//! them. Both are written through a temp file and renamed into place, and
//! access to one identity is serialized by a per-identity lock.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::digest::{digest_bytes, hex_sha256};
use crate::error::{NexError, Result};
use crate::verify::VerifiedWorkload;

const BIN_EXT: &str = "bin";
const META_EXT: &str = "meta.json";
const TMP_PREFIX: &str = ".tmp-";

/// Metadata stored alongside each cached binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub identity: String,
    pub digest: String,
    pub size: u64,
    pub stored_at: DateTime<Utc>,
}

/// A cache hit: previously verified bytes and their metadata.
#[derive(Debug, Clone)]
pub struct CachedWorkload {
    pub meta: EntryMeta,
    bytes: Arc<[u8]>,
}

impl CachedWorkload {
    pub fn bytes(&self) -> &Arc<[u8]> {
        &self.bytes
    }

    pub fn digest(&self) -> &str {
        &self.meta.digest
    }
}

#[derive(Debug)]
pub struct WorkloadCache {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl WorkloadCache {
    /// Open (creating if needed) a cache rooted at `root`, removing temp files
    /// left by interrupted writes.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let mut entries = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with(TMP_PREFIX) {
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    tracing::warn!(path = %entry.path().display(), error = %e, "Failed to remove interrupted cache write");
                }
            }
        }

        tracing::info!(root = %root.display(), "Opened workload cache");
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    async fn lock_for(&self, identity: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Drop the identity's lock from the map once no other task holds or waits on it.
    async fn release(&self, identity: &str, lock: Arc<RwLock<()>>) {
        let mut locks = self.locks.lock().await;
        // One reference lives in the map, one is `lock`
        let unused = Arc::strong_count(&lock) == 2
            && locks
                .get(identity)
                .is_some_and(|held| Arc::ptr_eq(held, &lock));
        if unused {
            locks.remove(identity);
        }
    }

    fn entry_paths(&self, identity: &str) -> (PathBuf, PathBuf) {
        let stem = hex_sha256(identity.as_bytes());
        (
            self.root.join(format!("{}.{}", stem, BIN_EXT)),
            self.root.join(format!("{}.{}", stem, META_EXT)),
        )
    }

    /// Store verified bytes for `identity`, replacing any previous entry.
    ///
    /// Failures are reported as [`NexError::CacheWrite`] and leave any
    /// previous entry readable.
    pub async fn put(&self, identity: &str, workload: &VerifiedWorkload) -> Result<CachedWorkload> {
        let lock = self.lock_for(identity).await;
        let result = {
            let _guard = lock.write().await;
            self.write_entry(identity, workload).await
        };
        self.release(identity, lock).await;
        result
    }

    async fn write_entry(&self, identity: &str, workload: &VerifiedWorkload) -> Result<CachedWorkload> {
        let meta = EntryMeta {
            identity: identity.to_string(),
            digest: workload.digest().to_string(),
            size: workload.len() as u64,
            stored_at: Utc::now(),
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta)?;
        let (bin_path, meta_path) = self.entry_paths(identity);

        let root = self.root.clone();
        let bytes = workload.bytes().clone();
        let written = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            write_atomic(&root, &bin_path, &bytes)?;
            write_atomic(&root, &meta_path, &meta_bytes)
        })
        .await
        .map_err(|e| NexError::Internal(e.to_string()))?;

        if let Err(e) = written {
            tracing::error!(identity, error = %e, "Failed to write workload to cache");
            return Err(NexError::CacheWrite {
                identity: identity.to_string(),
                reason: e.to_string(),
            });
        }

        tracing::info!(identity, digest = %meta.digest, size = meta.size, "Cached verified workload");
        Ok(CachedWorkload {
            meta,
            bytes: workload.bytes().clone(),
        })
    }

    /// Fetch the cached entry for `identity`.
    ///
    /// An entry whose bytes no longer match the recorded digest is reported
    /// as not found.
    pub async fn get(&self, identity: &str) -> Result<CachedWorkload> {
        let lock = self.lock_for(identity).await;
        let result = {
            let _guard = lock.read().await;
            self.read_entry(identity).await
        };
        self.release(identity, lock).await;
        result
    }

    async fn read_entry(&self, identity: &str) -> Result<CachedWorkload> {
        let meta = self.read_meta(identity).await?;
        let (bin_path, _) = self.entry_paths(identity);
        let bytes = read_or_not_found(&bin_path, identity).await?;

        if digest_bytes(&bytes) != meta.digest {
            tracing::warn!(identity, expected = %meta.digest, "Cached workload failed digest check");
            return Err(NexError::NotFound(format!(
                "cached workload {} (digest mismatch)",
                identity
            )));
        }

        Ok(CachedWorkload {
            meta,
            bytes: Arc::from(bytes),
        })
    }

    /// Recorded digest for `identity`, without reading the binary.
    pub async fn digest_of(&self, identity: &str) -> Result<Option<String>> {
        let lock = self.lock_for(identity).await;
        let result = {
            let _guard = lock.read().await;
            self.read_meta(identity).await
        };
        self.release(identity, lock).await;

        match result {
            Ok(meta) => Ok(Some(meta.digest)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn contains(&self, identity: &str) -> bool {
        matches!(self.digest_of(identity).await, Ok(Some(_)))
    }

    /// Remove the entry for `identity`. Returns whether anything was removed.
    pub async fn evict(&self, identity: &str) -> Result<bool> {
        let lock = self.lock_for(identity).await;
        let result = {
            let _guard = lock.write().await;
            self.remove_entry(identity).await
        };
        self.release(identity, lock).await;
        result
    }

    async fn remove_entry(&self, identity: &str) -> Result<bool> {
        let (bin_path, meta_path) = self.entry_paths(identity);
        let mut removed = false;
        for path in [meta_path, bin_path] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(NexError::Io(e)),
            }
        }

        if removed {
            tracing::info!(identity, "Evicted cached workload");
        }
        Ok(removed)
    }

    /// Metadata of every entry, sorted by identity.
    pub async fn entries(&self) -> Result<Vec<EntryMeta>> {
        let mut metas = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(TMP_PREFIX) || !name.ends_with(META_EXT) {
                continue;
            }
            match tokio::fs::read(entry.path()).await {
                Ok(raw) => match serde_json::from_slice::<EntryMeta>(&raw) {
                    Ok(meta) => metas.push(meta),
                    Err(e) => tracing::warn!(file = %name, error = %e, "Skipping unreadable cache metadata"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(NexError::Io(e)),
            }
        }
        metas.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(metas)
    }

    async fn read_meta(&self, identity: &str) -> Result<EntryMeta> {
        let (_, meta_path) = self.entry_paths(identity);
        let raw = read_or_not_found(&meta_path, identity).await?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

async fn read_or_not_found(path: &Path, identity: &str) -> Result<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(NexError::NotFound(format!("cached workload {}", identity)))
        }
        Err(e) => Err(NexError::Io(e)),
    }
}

/// Write `bytes` to `dest` via a temp file in `dir` and an atomic rename.
fn write_atomic(dir: &Path, dest: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = tempfile::Builder::new().prefix(TMP_PREFIX).tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}
