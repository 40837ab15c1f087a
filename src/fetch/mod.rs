//! Payload fetcher: pulls workload bytes out of the remote object store.
//!
//! Each fetch lands in its own uniquely named staging file under the staging
//! directory. The file is owned by the returned [`StagedPayload`] and is
//! deleted when that value is dropped, whichever way the request ends.

pub mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempPath;
use tokio::io::AsyncWriteExt;

use crate::control::Location;
use crate::digest::DigestWriter;
use crate::error::{NexError, Result};

pub use store::{DirObjectStore, ObjectBucket, ObjectInfo, ObjectStore};

const STAGING_PREFIX: &str = "payload-";
const STAGING_SUFFIX: &str = ".stage";

/// A downloaded, not yet verified workload binary.
#[derive(Debug)]
pub struct StagedPayload {
    path: TempPath,
    info: ObjectInfo,
    digest: String,
}

impl StagedPayload {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remote metadata observed before the download.
    pub fn info(&self) -> &ObjectInfo {
        &self.info
    }

    /// Digest of the bytes actually written to the staging file.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

/// Remote object resolved but not yet downloaded.
pub struct ResolvedObject {
    pub bucket: Arc<dyn ObjectBucket>,
    pub info: ObjectInfo,
}

#[derive(Debug, Clone)]
pub struct PayloadFetcher {
    staging_dir: PathBuf,
}

impl PayloadFetcher {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Create the staging directory and sweep files left by a previous process.
    pub async fn prepare(&self) -> Result<usize> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;

        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.staging_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(STAGING_PREFIX) && name.ends_with(STAGING_SUFFIX) {
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    tracing::warn!(path = %entry.path().display(), error = %e, "Failed to remove stale staging file");
                } else {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            tracing::info!(removed, dir = %self.staging_dir.display(), "Removed stale staging files");
        }
        Ok(removed)
    }

    /// Resolve the bucket (scoped to `js_domain` when given) and look up the object's metadata.
    pub async fn resolve(
        &self,
        store: &dyn ObjectStore,
        location: &Location,
        js_domain: Option<&str>,
    ) -> Result<ResolvedObject> {
        let js_domain = js_domain.map(str::trim).filter(|d| !d.is_empty());
        let bucket = store.bucket(js_domain, location.bucket()).await?;
        let info = bucket.info(location.key()).await?;

        tracing::debug!(
            bucket = %info.bucket,
            key = %info.name,
            size = info.size,
            digest = %info.digest,
            "Resolved workload object"
        );
        Ok(ResolvedObject { bucket, info })
    }

    /// Download a resolved object into a fresh staging file.
    ///
    /// Short transfers and digest mismatches against the object's metadata
    /// are download failures; the staging file is gone by the time an error
    /// is returned.
    pub async fn download(&self, resolved: ResolvedObject) -> Result<StagedPayload> {
        let ResolvedObject { bucket, info } = resolved;

        let dir = self.staging_dir.clone();
        let named = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(STAGING_PREFIX)
                .suffix(STAGING_SUFFIX)
                .tempfile_in(dir)
        })
        .await
        .map_err(|e| NexError::Internal(e.to_string()))?
        .map_err(|e| NexError::Download(format!("failed to create staging file: {}", e)))?;

        let (file, path) = named.into_parts();
        let mut writer = DigestWriter::new(tokio::fs::File::from_std(file));

        let written = bucket.download(&info.name, &mut writer).await?;
        writer
            .flush()
            .await
            .map_err(|e| NexError::Download(e.to_string()))?;
        if written != info.size || writer.written() != info.size {
            return Err(NexError::Download(format!(
                "short transfer for {}/{}: got {} of {} bytes",
                info.bucket, info.name, written, info.size
            )));
        }

        let (file, digest) = writer.finish();
        file.sync_all()
            .await
            .map_err(|e| NexError::Download(e.to_string()))?;
        drop(file);

        if !info.digest.is_empty() && info.digest != digest {
            return Err(NexError::Download(format!(
                "digest mismatch for {}/{}: expected {}, got {}",
                info.bucket, info.name, info.digest, digest
            )));
        }

        tracing::info!(
            bucket = %info.bucket,
            key = %info.name,
            staging = %path.display(),
            "Downloaded workload bytes from bucket"
        );

        Ok(StagedPayload { path, info, digest })
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, DirObjectStore, PayloadFetcher) {
        let dir = TempDir::new().unwrap();
        let store = DirObjectStore::new(dir.path().join("store"));
        let fetcher = PayloadFetcher::new(dir.path().join("staging"));
        fetcher.prepare().await.unwrap();
        (dir, store, fetcher)
    }

    async fn fetch(
        fetcher: &PayloadFetcher,
        store: &DirObjectStore,
        location: &Location,
        js_domain: Option<&str>,
    ) -> Result<StagedPayload> {
        let resolved = fetcher.resolve(store, location, js_domain).await?;
        fetcher.download(resolved).await
    }

    fn staged_count(fetcher: &PayloadFetcher) -> usize {
        std::fs::read_dir(fetcher.staging_dir()).unwrap().count()
    }

    #[tokio::test]
    async fn fetch_stages_bytes_and_cleans_up_on_drop() {
        let (_dir, store, fetcher) = setup().await;
        store.put_object(None, "workloads", "echo", b"binary").await.unwrap();

        let staged = fetch(&fetcher, &store, &Location::new("workloads", "/echo/"), None)
            .await
            .unwrap();
        assert_eq!(std::fs::read(staged.path()).unwrap(), b"binary");
        assert_eq!(staged.digest(), staged.info().digest);
        assert_eq!(staged_count(&fetcher), 1);

        drop(staged);
        assert_eq!(staged_count(&fetcher), 0);
    }

    #[tokio::test]
    async fn concurrent_fetches_use_distinct_paths() {
        let (_dir, store, fetcher) = setup().await;
        store.put_object(None, "workloads", "echo", b"binary").await.unwrap();
        let loc = Location::new("workloads", "echo");

        let a = fetch(&fetcher, &store, &loc, None).await.unwrap();
        let b = fetch(&fetcher, &store, &loc, None).await.unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[tokio::test]
    async fn missing_key_leaves_no_staging_file() {
        let (_dir, store, fetcher) = setup().await;
        store.put_object(None, "workloads", "echo", b"binary").await.unwrap();

        let err = fetch(&fetcher, &store, &Location::new("workloads", "nope"), None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(staged_count(&fetcher), 0);
    }

    #[tokio::test]
    async fn blank_domain_is_ignored() {
        let (_dir, store, fetcher) = setup().await;
        store.put_object(None, "workloads", "echo", b"binary").await.unwrap();

        let staged = fetch(&fetcher, &store, &Location::new("workloads", "echo"), Some("  "))
            .await;
        assert!(staged.is_ok());
    }

    #[tokio::test]
    async fn prepare_sweeps_stale_files() {
        let (_dir, _store, fetcher) = setup().await;
        std::fs::write(fetcher.staging_dir().join("payload-old.stage"), b"x").unwrap();
        std::fs::write(fetcher.staging_dir().join("keep.txt"), b"x").unwrap();

        assert_eq!(fetcher.prepare().await.unwrap(), 1);
        assert_eq!(staged_count(&fetcher), 1);
    }
}
