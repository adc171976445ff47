//! Blob storage for payloads too large to inline into the broker. The cache
//! stores a URI and the executor materializes the bytes here.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

#[derive(Debug)]
pub enum BlobError {
    Io(String),
    BadUri(String),
}

impl std::fmt::Display for BlobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobError::Io(msg) => write!(f, "blob I/O error: {msg}"),
            BlobError::BadUri(uri) => write!(f, "unusable blob uri: {uri}"),
        }
    }
}

impl std::error::Error for BlobError {}

#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Writes bytes under a store-relative path and returns the URI the
    /// cache should record.
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<String, BlobError>;
    async fn get(&self, uri: &str) -> Result<Vec<u8>, BlobError>;
    async fn delete(&self, uri: &str) -> Result<(), BlobError>;
}

pub type SharedBlobStore = Arc<dyn BlobStore>;

/// Local-directory backend. URIs are `file://` paths under the root.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalBlobStore { root: root.into() }
    }

    fn path_from_uri(&self, uri: &str) -> Result<PathBuf, BlobError> {
        let path = uri
            .strip_prefix("file://")
            .ok_or_else(|| BlobError::BadUri(uri.to_string()))?;
        let path = PathBuf::from(path);
        if !path.starts_with(&self.root) {
            return Err(BlobError::BadUri(uri.to_string()));
        }
        Ok(path)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<String, BlobError> {
        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BlobError::Io(e.to_string()))?;
        }
        tokio::fs::write(&full, bytes)
            .await
            .map_err(|e| BlobError::Io(e.to_string()))?;
        Ok(format!("file://{}", full.display()))
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.path_from_uri(uri)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| BlobError::Io(e.to_string()))
    }

    async fn delete(&self, uri: &str) -> Result<(), BlobError> {
        let path = self.path_from_uri(uri)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobError::Io(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        let uri = store.put("abc/0.json", b"payload").await.unwrap();
        assert!(uri.starts_with("file://"));
        assert_eq!(store.get(&uri).await.unwrap(), b"payload");
        store.delete(&uri).await.unwrap();
        assert!(store.get(&uri).await.is_err());
        // deleting again is fine
        store.delete(&uri).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_uris_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        assert!(store.get("file:///etc/passwd").await.is_err());
        assert!(store.get("s3://bucket/key").await.is_err());
    }
}
