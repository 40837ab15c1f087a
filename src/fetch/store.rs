use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::digest::digest_bytes;
use crate::error::{NexError, Result};

/// Directory used when a request does not name a store domain.
pub const DEFAULT_DOMAIN_DIR: &str = "default";

/// Metadata of one object in a remote bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub bucket: String,
    pub name: String,
    pub size: u64,
    /// `SHA-256=<base64url>`; empty when the store does not publish digests
    pub digest: String,
    pub modified: Option<DateTime<Utc>>,
}

/// Remote content store holding submitted workload bytes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Resolve a bucket handle, optionally scoped to a store domain.
    async fn bucket(&self, domain: Option<&str>, name: &str) -> Result<Arc<dyn ObjectBucket>>;
}

#[async_trait]
pub trait ObjectBucket: Send + Sync {
    async fn info(&self, key: &str) -> Result<ObjectInfo>;

    /// Stream the object into `dest`, returning the number of bytes written.
    async fn download(&self, key: &str, dest: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<u64>;
}

/// Object store laid out on a local filesystem as `<root>/<domain>/<bucket>/<key>`.
///
/// Requests without a domain read from the `default` domain directory.
#[derive(Debug, Clone)]
pub struct DirObjectStore {
    root: PathBuf,
}

impl DirObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path an object would occupy; used to publish workloads into the store.
    pub fn object_path(&self, domain: Option<&str>, bucket: &str, key: &str) -> PathBuf {
        self.root
            .join(domain.unwrap_or(DEFAULT_DOMAIN_DIR))
            .join(bucket)
            .join(key.trim_matches('/'))
    }

    /// Write an object, creating its bucket as needed.
    pub async fn put_object(
        &self,
        domain: Option<&str>,
        bucket: &str,
        key: &str,
        bytes: &[u8],
    ) -> Result<ObjectInfo> {
        let path = self.object_path(domain, bucket, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(ObjectInfo {
            bucket: bucket.to_string(),
            name: key.trim_matches('/').to_string(),
            size: bytes.len() as u64,
            digest: digest_bytes(bytes),
            modified: Some(Utc::now()),
        })
    }
}

#[async_trait]
impl ObjectStore for DirObjectStore {
    async fn bucket(&self, domain: Option<&str>, name: &str) -> Result<Arc<dyn ObjectBucket>> {
        let domain_dir = self.root.join(domain.unwrap_or(DEFAULT_DOMAIN_DIR));
        if !tokio::fs::try_exists(&domain_dir).await.unwrap_or(false) {
            return Err(NexError::Connection(format!(
                "store domain {} is unreachable at {}",
                domain.unwrap_or(DEFAULT_DOMAIN_DIR),
                domain_dir.display()
            )));
        }

        let dir = domain_dir.join(name);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(NexError::NotFound(format!("bucket {}", name)));
        }

        Ok(Arc::new(DirBucket {
            name: name.to_string(),
            dir,
        }))
    }
}

struct DirBucket {
    name: String,
    dir: PathBuf,
}

impl DirBucket {
    fn path_of(&self, key: &str) -> Result<PathBuf> {
        if key.split('/').any(|part| part == "..") {
            return Err(NexError::InvalidRequest(format!(
                "object key escapes bucket: {}",
                key
            )));
        }
        Ok(self.dir.join(key))
    }

    async fn read_object(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_of(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(NexError::NotFound(format!("{}/{}", self.name, key)))
            }
            Err(e) => Err(NexError::Io(e)),
        }
    }
}

#[async_trait]
impl ObjectBucket for DirBucket {
    async fn info(&self, key: &str) -> Result<ObjectInfo> {
        let bytes = self.read_object(key).await?;
        let modified = tokio::fs::metadata(self.path_of(key)?)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);

        Ok(ObjectInfo {
            bucket: self.name.clone(),
            name: key.to_string(),
            size: bytes.len() as u64,
            digest: digest_bytes(&bytes),
            modified,
        })
    }

    async fn download(&self, key: &str, dest: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<u64> {
        let mut file = match tokio::fs::File::open(self.path_of(key)?).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(NexError::NotFound(format!("{}/{}", self.name, key)));
            }
            Err(e) => return Err(NexError::Download(e.to_string())),
        };

        let written = tokio::io::copy(&mut file, dest)
            .await
            .map_err(|e| NexError::Download(e.to_string()))?;
        dest.flush()
            .await
            .map_err(|e| NexError::Download(e.to_string()))?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn put_then_info_and_download() {
        let dir = TempDir::new().unwrap();
        let store = DirObjectStore::new(dir.path());
        let published = store
            .put_object(None, "workloads", "/echo", b"payload")
            .await
            .unwrap();

        let bucket = store.bucket(None, "workloads").await.unwrap();
        let info = bucket.info("echo").await.unwrap();
        assert_eq!(info.size, 7);
        assert_eq!(info.digest, published.digest);

        let mut out = Vec::new();
        let n = bucket.download("echo", &mut out).await.unwrap();
        assert_eq!(n, 7);
        assert_eq!(out, b"payload");
    }

    #[tokio::test]
    async fn domain_scopes_lookup() {
        let dir = TempDir::new().unwrap();
        let store = DirObjectStore::new(dir.path());
        store
            .put_object(Some("hub"), "workloads", "echo", b"x")
            .await
            .unwrap();

        assert!(store.bucket(Some("hub"), "workloads").await.is_ok());
        assert!(matches!(
            store.bucket(Some("leaf"), "workloads").await,
            Err(NexError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn missing_bucket_and_key_are_not_found() {
        let dir = TempDir::new().unwrap();
        let store = DirObjectStore::new(dir.path());
        store.put_object(None, "workloads", "echo", b"x").await.unwrap();

        let err = store.bucket(None, "other").await.err().unwrap();
        assert!(err.is_not_found());

        let bucket = store.bucket(None, "workloads").await.unwrap();
        assert!(bucket.info("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn keys_cannot_escape_bucket() {
        let dir = TempDir::new().unwrap();
        let store = DirObjectStore::new(dir.path());
        store.put_object(None, "workloads", "echo", b"x").await.unwrap();
        store.put_object(None, "secrets", "key", b"y").await.unwrap();

        let bucket = store.bucket(None, "workloads").await.unwrap();
        assert!(matches!(
            bucket.info("../secrets/key").await,
            Err(NexError::InvalidRequest(_))
        ));
    }
}
