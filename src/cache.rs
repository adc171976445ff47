//! Content-addressed result cache. Streams of values are keyed by node
//! fingerprint with single-producer semantics: the first builder takes an
//! auto-expiring lock, appends values in yield order, and seals; everyone
//! else either reads the sealed stream or waits for the seal.
//!
//! Values live in the broker; payloads over the inline limit are written to
//! a blob store and referenced by URI. A moka layer in front of the broker
//! memoizes sealed streams locally, weighed by serialized size.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::blob::{BlobError, SharedBlobStore};
use crate::broker::{keys, Broker, BrokerError, SharedBroker};
use crate::fingerprint::Fingerprint;

#[derive(Debug)]
pub enum CacheError {
    Broker(BrokerError),
    Blob(BlobError),
    /// An append was attempted out of order.
    NonContiguous { expected: usize, got: usize },
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Broker(e) => write!(f, "cache broker error: {e}"),
            CacheError::Blob(e) => write!(f, "cache blob error: {e}"),
            CacheError::NonContiguous { expected, got } => {
                write!(f, "cache append out of order: expected index {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for CacheError {}

impl From<BrokerError> for CacheError {
    fn from(e: BrokerError) -> Self {
        CacheError::Broker(e)
    }
}

impl From<BlobError> for CacheError {
    fn from(e: BlobError) -> Self {
        CacheError::Blob(e)
    }
}

/// Outcome of a cache lookup for one fingerprint.
pub enum Lookup {
    /// The sealed stream, in yield order.
    Sealed(Vec<Value>),
    /// Nobody has produced this stream; the caller now holds the builder
    /// lock and must produce it.
    Build(BuildHandle),
    /// Another producer holds the builder lock; wait for its seal.
    Pending,
}

#[derive(Clone)]
pub struct ValueCache {
    broker: SharedBroker,
    blobs: Option<SharedBlobStore>,
    local: moka::future::Cache<Fingerprint, Arc<Vec<Value>>>,
    byte_budget: u64,
    inline_limit: usize,
    lock_ttl: Duration,
}

impl ValueCache {
    /// `lock_ttl` must exceed the longest expected adapter runtime so a live
    /// builder never loses its lock.
    #[must_use]
    pub fn new(
        broker: SharedBroker,
        blobs: Option<SharedBlobStore>,
        byte_budget: u64,
        inline_limit: usize,
        lock_ttl: Duration,
    ) -> Self {
        let local = moka::future::Cache::builder()
            .max_capacity(byte_budget)
            .weigher(|_fp: &Fingerprint, values: &Arc<Vec<Value>>| {
                values
                    .iter()
                    .map(|v| v.to_string().len() as u32)
                    .sum::<u32>()
                    .max(1)
            })
            .build();
        ValueCache {
            broker,
            blobs,
            local,
            byte_budget,
            inline_limit,
            lock_ttl,
        }
    }

    /// Looks the fingerprint up and, on a miss, races for the builder lock.
    pub async fn begin(&self, fp: &Fingerprint) -> Result<Lookup, CacheError> {
        if let Some(values) = self.read_sealed(fp).await? {
            return Ok(Lookup::Sealed(values));
        }
        let claimed = self
            .broker
            .set_nx_ex(&keys::cache_lock(fp), "builder".to_string(), self.lock_ttl)
            .await?;
        if !claimed {
            return Ok(Lookup::Pending);
        }
        // Re-check: a builder may have sealed between our read and the claim.
        if let Some(values) = self.read_sealed(fp).await? {
            self.broker.del(&keys::cache_lock(fp)).await?;
            return Ok(Lookup::Sealed(values));
        }
        // Clear leftovers from a builder that died mid-stream.
        self.broker.list_clear(&keys::cache(fp)).await?;
        Ok(Lookup::Build(BuildHandle {
            cache: self.clone(),
            fp: fp.clone(),
            next_index: 0,
            bytes: 0,
            finished: false,
        }))
    }

    /// Waits until the stream is sealed, or returns None when the builder
    /// disappeared without sealing (its lock expired) or the timeout passed.
    pub async fn wait_sealed(
        &self,
        fp: &Fingerprint,
        timeout: Duration,
    ) -> Result<Option<Vec<Value>>, CacheError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(values) = self.read_sealed(fp).await? {
                return Ok(Some(values));
            }
            if !self.broker.exists(&keys::cache_lock(fp)).await? {
                // Builder is gone; one final look in case it sealed last.
                return self.read_sealed(fp).await;
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub async fn invalidate(&self, fp: &Fingerprint) -> Result<(), CacheError> {
        self.local.invalidate(fp).await;
        self.delete_entry(fp).await
    }

    async fn delete_entry(&self, fp: &Fingerprint) -> Result<(), CacheError> {
        if let Some(blobs) = &self.blobs {
            for raw in self.broker.list_all(&keys::cache(fp)).await? {
                if let Some(uri) = blob_uri(&raw) {
                    if let Err(e) = blobs.delete(&uri).await {
                        warn!(%fp, "could not delete evicted blob {uri}: {e}");
                    }
                }
            }
        }
        self.broker.list_clear(&keys::cache(fp)).await?;
        self.broker.del(&keys::cache_sealed(fp)).await?;
        self.broker.hash_del(keys::CACHE_INDEX, fp).await?;
        Ok(())
    }

    /// A sealed read: either the complete stream or nothing. Partial state
    /// (no sealed count, or fewer entries than sealed) reads as absent.
    async fn read_sealed(&self, fp: &Fingerprint) -> Result<Option<Vec<Value>>, CacheError> {
        if let Some(values) = self.local.get(fp).await {
            self.touch(fp, None).await?;
            return Ok(Some(values.as_ref().clone()));
        }
        let Some(sealed) = self.broker.get(&keys::cache_sealed(fp)).await? else {
            return Ok(None);
        };
        let count: usize = sealed.parse().map_err(|_| {
            CacheError::Broker(BrokerError::Corrupt(format!("bad sealed count {sealed:?}")))
        })?;
        let raw = self.broker.list_all(&keys::cache(fp)).await?;
        if raw.len() != count {
            warn!(%fp, "sealed count {count} disagrees with {} entries, treating as miss", raw.len());
            return Ok(None);
        }
        let mut values = Vec::with_capacity(raw.len());
        for entry in raw {
            values.push(self.resolve(&entry).await?);
        }
        self.local.insert(fp.clone(), Arc::new(values.clone())).await;
        self.touch(fp, None).await?;
        Ok(Some(values))
    }

    async fn resolve(&self, raw: &str) -> Result<Value, CacheError> {
        if let Some(uri) = blob_uri(raw) {
            let blobs = self.blobs.as_ref().ok_or_else(|| {
                CacheError::Broker(BrokerError::Corrupt(
                    "blob-backed cache entry but no blob store configured".to_string(),
                ))
            })?;
            let bytes = blobs.get(&uri).await?;
            return serde_json::from_slice(&bytes).map_err(|e| {
                CacheError::Broker(BrokerError::Corrupt(format!("bad blob payload: {e}")))
            });
        }
        serde_json::from_str(raw)
            .map_err(|e| CacheError::Broker(BrokerError::Corrupt(format!("bad cache entry: {e}"))))
    }

    /// Records size and last-read time for eviction ordering.
    async fn touch(&self, fp: &Fingerprint, bytes: Option<u64>) -> Result<(), CacheError> {
        let previous = match bytes {
            Some(_) => None,
            None => self.broker.hash_get(keys::CACHE_INDEX, fp).await?,
        };
        let bytes = bytes.unwrap_or_else(|| {
            previous
                .as_deref()
                .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                .and_then(|v| v["bytes"].as_u64())
                .unwrap_or(0)
        });
        let entry = json!({
            "bytes": bytes,
            "last_read_ms": chrono::Utc::now().timestamp_millis(),
        });
        self.broker
            .hash_set(keys::CACHE_INDEX, fp, entry.to_string())
            .await?;
        Ok(())
    }

    /// Drops least-recently-read sealed entries until under budget. Unsealed
    /// streams are not in the index and so are never considered.
    async fn evict_to_budget(&self) -> Result<(), CacheError> {
        let index = self.broker.hash_get_all(keys::CACHE_INDEX).await?;
        let mut entries: Vec<(Fingerprint, u64, i64)> = index
            .into_iter()
            .filter_map(|(fp, raw)| {
                let v: Value = serde_json::from_str(&raw).ok()?;
                Some((fp, v["bytes"].as_u64()?, v["last_read_ms"].as_i64()?))
            })
            .collect();
        let mut total: u64 = entries.iter().map(|(_, bytes, _)| bytes).sum();
        if total <= self.byte_budget {
            return Ok(());
        }
        entries.sort_by_key(|(_, _, last_read)| *last_read);
        for (fp, bytes, _) in entries {
            if total <= self.byte_budget {
                break;
            }
            debug!(%fp, bytes, "evicting cache entry");
            self.local.invalidate(&fp).await;
            self.delete_entry(&fp).await?;
            total = total.saturating_sub(bytes);
        }
        Ok(())
    }
}

fn blob_uri(raw: &str) -> Option<String> {
    let v: Value = serde_json::from_str(raw).ok()?;
    let obj = v.as_object()?;
    if obj.len() == 1 {
        return obj.get("$blob")?.as_str().map(str::to_string);
    }
    None
}

/// Write side of one cache stream. Owned by the single producer that holds
/// the builder lock; must end in `seal` or `abandon`.
pub struct BuildHandle {
    cache: ValueCache,
    fp: Fingerprint,
    next_index: usize,
    bytes: u64,
    finished: bool,
}

impl BuildHandle {
    /// Appends the value at `index`. Indices must be contiguous from 0.
    pub async fn put(&mut self, index: usize, value: &Value) -> Result<(), CacheError> {
        if index != self.next_index {
            return Err(CacheError::NonContiguous {
                expected: self.next_index,
                got: index,
            });
        }
        let serialized = value.to_string();
        self.bytes += serialized.len() as u64;
        let entry = if serialized.len() > self.cache.inline_limit {
            match &self.cache.blobs {
                Some(blobs) => {
                    let uri = blobs
                        .put(&format!("{}/{index}.json", self.fp), serialized.as_bytes())
                        .await?;
                    json!({ "$blob": uri }).to_string()
                }
                None => serialized,
            }
        } else {
            serialized
        };
        self.cache
            .broker
            .push_back(&keys::cache(&self.fp), entry)
            .await?;
        self.next_index += 1;
        Ok(())
    }

    /// Marks the stream complete. The sealed flag is the single write that
    /// makes the stream visible to readers.
    pub async fn seal(mut self) -> Result<(), CacheError> {
        self.cache
            .broker
            .set(&keys::cache_sealed(&self.fp), self.next_index.to_string())
            .await?;
        self.cache.touch(&self.fp, Some(self.bytes)).await?;
        self.cache.broker.del(&keys::cache_lock(&self.fp)).await?;
        self.finished = true;
        self.cache.evict_to_budget().await?;
        Ok(())
    }

    /// Discards the partial stream and releases the lock, leaving a clean
    /// miss behind.
    pub async fn abandon(mut self) -> Result<(), CacheError> {
        self.cache.broker.list_clear(&keys::cache(&self.fp)).await?;
        self.cache.broker.del(&keys::cache_lock(&self.fp)).await?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for BuildHandle {
    fn drop(&mut self) {
        if !self.finished {
            // The lock self-expires, so a dropped handle delays reuse of the
            // fingerprint rather than wedging it.
            warn!(fp = %self.fp, "cache build dropped without seal or abandon");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn cache_with(broker: SharedBroker) -> ValueCache {
        ValueCache::new(broker, None, 10_000, 1 << 20, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn miss_then_build_then_sealed_hit() {
        let broker = MemoryBroker::shared();
        let cache = cache_with(broker);
        let fp = "f".repeat(64);

        let Lookup::Build(mut build) = cache.begin(&fp).await.unwrap() else {
            panic!("expected build");
        };
        build.put(0, &json!(1)).await.unwrap();
        build.put(1, &json!(2)).await.unwrap();
        build.seal().await.unwrap();

        match cache.begin(&fp).await.unwrap() {
            Lookup::Sealed(values) => assert_eq!(values, vec![json!(1), json!(2)]),
            _ => panic!("expected sealed"),
        }
    }

    #[tokio::test]
    async fn second_caller_sees_pending_until_sealed() {
        let broker = MemoryBroker::shared();
        let cache = cache_with(broker);
        let fp = "a".repeat(64);

        let Lookup::Build(mut build) = cache.begin(&fp).await.unwrap() else {
            panic!("expected build");
        };
        assert!(matches!(cache.begin(&fp).await.unwrap(), Lookup::Pending));

        build.put(0, &json!("v")).await.unwrap();
        let waiter = {
            let cache = cache.clone();
            let fp = fp.clone();
            tokio::spawn(async move { cache.wait_sealed(&fp, Duration::from_secs(2)).await })
        };
        build.seal().await.unwrap();
        let sealed = waiter.await.unwrap().unwrap();
        assert_eq!(sealed, Some(vec![json!("v")]));
    }

    #[tokio::test]
    async fn appends_must_be_contiguous() {
        let broker = MemoryBroker::shared();
        let cache = cache_with(broker);
        let fp = "b".repeat(64);
        let Lookup::Build(mut build) = cache.begin(&fp).await.unwrap() else {
            panic!("expected build");
        };
        assert!(matches!(
            build.put(1, &json!(0)).await,
            Err(CacheError::NonContiguous { expected: 0, got: 1 })
        ));
        build.abandon().await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_build_reads_as_miss() {
        let broker = MemoryBroker::shared();
        let cache = cache_with(broker);
        let fp = "c".repeat(64);
        let Lookup::Build(mut build) = cache.begin(&fp).await.unwrap() else {
            panic!("expected build");
        };
        build.put(0, &json!(1)).await.unwrap();
        build.abandon().await.unwrap();
        assert!(matches!(cache.begin(&fp).await.unwrap(), Lookup::Build(_)));
    }

    #[tokio::test]
    async fn eviction_prefers_least_recently_read() {
        let broker = MemoryBroker::shared();
        // Budget fits roughly one entry.
        let cache = ValueCache::new(broker, None, 40, 1 << 20, Duration::from_secs(60));
        let old = "d".repeat(64);
        let new = "e".repeat(64);

        let Lookup::Build(mut build) = cache.begin(&old).await.unwrap() else {
            panic!();
        };
        build.put(0, &json!("x".repeat(30))).await.unwrap();
        build.seal().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let Lookup::Build(mut build) = cache.begin(&new).await.unwrap() else {
            panic!();
        };
        build.put(0, &json!("y".repeat(30))).await.unwrap();
        build.seal().await.unwrap();

        // Older entry is gone; a fresh lookup has to rebuild it.
        assert!(matches!(cache.begin(&old).await.unwrap(), Lookup::Build(_)));
    }

    #[tokio::test]
    async fn blob_backed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let blobs: SharedBlobStore = Arc::new(crate::blob::LocalBlobStore::new(dir.path()));
        let broker = MemoryBroker::shared();
        // Tiny inline limit so the payload goes through the blob store.
        let cache = ValueCache::new(broker.clone(), Some(blobs), 10_000, 8, Duration::from_secs(60));
        let fp = "f0".repeat(32);

        let Lookup::Build(mut build) = cache.begin(&fp).await.unwrap() else {
            panic!();
        };
        let big = json!({"image": "px".repeat(64)});
        build.put(0, &big).await.unwrap();
        build.seal().await.unwrap();

        // The broker entry is a reference, not the payload.
        let raw = broker.list_all(&keys::cache(&fp)).await.unwrap();
        assert!(raw[0].contains("$blob"));

        match cache.begin(&fp).await.unwrap() {
            Lookup::Sealed(values) => assert_eq!(values, vec![big]),
            _ => panic!("expected sealed"),
        }
    }
}
