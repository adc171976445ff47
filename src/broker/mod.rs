//! The broker is the only shared mutable state between services: a durable
//! key/value store with list, hash, sorted-set, pub/sub, and blocking-pop
//! primitives. Everything the services exchange goes through here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

mod memory;
mod redis;

pub use memory::MemoryBroker;
pub use redis::RedisBroker;

#[derive(Debug)]
pub enum BrokerError {
    /// The broker could not be reached or an operation failed transiently.
    Unavailable(String),
    /// Data in the broker was not in the expected shape.
    Corrupt(String),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Unavailable(msg) => write!(f, "broker unavailable: {msg}"),
            BrokerError::Corrupt(msg) => write!(f, "broker data corrupt: {msg}"),
        }
    }
}

impl std::error::Error for BrokerError {}

/// A pub/sub subscription. Messages published after subscription time are
/// delivered in order; the channel closes when the broker goes away.
pub struct Subscription {
    rx: tokio::sync::mpsc::Receiver<String>,
}

impl Subscription {
    pub(crate) fn new(rx: tokio::sync::mpsc::Receiver<String>) -> Self {
        Subscription { rx }
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    // Lists (FIFO queues).
    async fn push_back(&self, key: &str, value: String) -> Result<(), BrokerError>;
    /// Blocking pop from the front. Returns None when the timeout elapses
    /// with the list still empty.
    async fn pop_front(&self, key: &str, timeout: Duration)
        -> Result<Option<String>, BrokerError>;
    /// Drains up to `max` entries, blocking until at least one is available
    /// or the timeout elapses.
    async fn pop_front_many(
        &self,
        key: &str,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<String>, BrokerError>;
    async fn list_len(&self, key: &str) -> Result<usize, BrokerError>;
    /// The whole list, front to back, without consuming it.
    async fn list_all(&self, key: &str) -> Result<Vec<String>, BrokerError>;
    async fn list_clear(&self, key: &str) -> Result<(), BrokerError>;

    // Hashes.
    async fn hash_set(&self, key: &str, field: &str, value: String) -> Result<(), BrokerError>;
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, BrokerError>;
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, BrokerError>;
    async fn hash_del(&self, key: &str, field: &str) -> Result<(), BrokerError>;
    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64, BrokerError>;

    // Sorted sets keyed by an integer score (wall-clock milliseconds here).
    async fn zadd(&self, key: &str, score: i64, member: String) -> Result<(), BrokerError>;
    async fn zpeek_min(&self, key: &str) -> Result<Option<(i64, String)>, BrokerError>;
    /// Pops the lowest-scored member if its score is <= `max_score`.
    async fn zpop_due(&self, key: &str, max_score: i64) -> Result<Option<String>, BrokerError>;

    // Plain keys.
    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError>;
    async fn set(&self, key: &str, value: String) -> Result<(), BrokerError>;
    /// Set-if-absent with expiry. Returns true when this call claimed the
    /// key. The claim idiom behind scheduler dedup, cache builder locks, and
    /// heartbeat singletons.
    async fn set_nx_ex(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, BrokerError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError>;
    async fn del(&self, key: &str) -> Result<(), BrokerError>;
    async fn exists(&self, key: &str) -> Result<bool, BrokerError>;

    // Pub/sub.
    async fn publish(&self, channel: &str, message: String) -> Result<(), BrokerError>;
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError>;
}

pub type SharedBroker = Arc<dyn Broker>;

/// The normative keyspace. Services agree on these shapes and nothing else.
pub mod keys {
    use crate::api::{NodeId, RequestId};
    use crate::fingerprint::Fingerprint;

    /// FIFO of `WorkItem` JSON for the executor pool.
    pub const EXEC_QUEUE: &str = "exec:queue";
    /// Sorted set of `WorkItem` JSON scored by due wall-clock ms.
    pub const SCHED_DELAYED: &str = "sched:delayed";
    /// Pub/sub channel poked whenever a delayed entry is added.
    pub const SCHED_WAKE: &str = "sched:wake";

    #[must_use]
    pub fn request(request_id: &RequestId) -> String {
        format!("request:{request_id}")
    }

    #[must_use]
    pub fn response(request_id: &RequestId) -> String {
        format!("response:{request_id}")
    }

    /// Per-port input buffer feeding one downstream node.
    #[must_use]
    pub fn input(request_id: &RequestId, node_id: &NodeId, port: usize) -> String {
        format!("input:{request_id}:{node_id}:{port}")
    }

    #[must_use]
    pub fn cache(fp: &Fingerprint) -> String {
        format!("cache:{fp}")
    }

    #[must_use]
    pub fn cache_sealed(fp: &Fingerprint) -> String {
        format!("cache:{fp}:sealed")
    }

    #[must_use]
    pub fn cache_lock(fp: &Fingerprint) -> String {
        format!("cache:lock:{fp}")
    }

    /// LRU/size bookkeeping for eviction, fields keyed by fingerprint.
    pub const CACHE_INDEX: &str = "cache:index";

    /// One-shot guard so event-driven enqueueing is idempotent.
    #[must_use]
    pub fn queued(request_id: &RequestId, node_id: &NodeId) -> String {
        format!("queued:{request_id}:{node_id}")
    }

    /// Claim for the single in-flight execution of a node.
    #[must_use]
    pub fn exec_claim(request_id: &RequestId, node_id: &NodeId) -> String {
        format!("exec:claim:{request_id}:{node_id}")
    }

    /// Claim for the cluster-wide heartbeat singleton of a request.
    #[must_use]
    pub fn heartbeat_claim(request_id: &RequestId) -> String {
        format!("hb:claim:{request_id}")
    }

    /// Claim making delayed-queue moves idempotent.
    #[must_use]
    pub fn sched_claim(run_id: &str) -> String {
        format!("sched:claim:{run_id}")
    }

    /// Request-scoped mailbox slot.
    #[must_use]
    pub fn mailbox(request_id: &RequestId, mailbox: &str) -> String {
        format!("mailbox:{request_id}:{mailbox}")
    }
}

/// An entry on the execution or delayed queue.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorkItem {
    pub request_id: crate::api::RequestId,
    pub node_id: crate::api::NodeId,
    /// Distinguishes re-schedules of the same node for claim purposes.
    #[serde(default)]
    pub run_id: String,
}

impl WorkItem {
    #[must_use]
    pub fn new(request_id: crate::api::RequestId, node_id: crate::api::NodeId) -> Self {
        let run_id = format!("{request_id}:{node_id}:{}", uuid::Uuid::new_v4());
        WorkItem {
            request_id,
            node_id,
            run_id,
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("work item serialization")
    }

    pub fn decode(raw: &str) -> Result<Self, BrokerError> {
        serde_json::from_str(raw)
            .map_err(|e| BrokerError::Corrupt(format!("bad work item {raw:?}: {e}")))
    }
}
