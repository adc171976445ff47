//! Handle to one submitted request's broker-side record. Everything the
//! services know about a request (its pipeline, per-node state, responses,
//! fingerprints, continuations, the cancellation flag) lives behind this
//! handle; the services themselves keep no request state in memory.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::api::response::{ErrorKind, Response, ResponseBody};
use crate::api::{NodeId, NodeState, Pipeline, RequestId};
use crate::broker::{keys, Broker, BrokerError, SharedBroker, WorkItem};
use crate::fingerprint::Fingerprint;

impl FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(NodeState::Pending),
            "READY" => Ok(NodeState::Ready),
            "RUNNING" => Ok(NodeState::Running),
            "COMPLETED" => Ok(NodeState::Completed),
            "FAILED" => Ok(NodeState::Failed),
            "CANCELLED" => Ok(NodeState::Cancelled),
            other => Err(format!("unknown node state {other:?}")),
        }
    }
}

#[derive(Clone)]
pub struct RequestHandle {
    broker: SharedBroker,
    request_id: RequestId,
}

impl RequestHandle {
    #[must_use]
    pub fn new(broker: SharedBroker, request_id: RequestId) -> Self {
        RequestHandle { broker, request_id }
    }

    /// Persists a fresh request record for an already-optimized pipeline.
    /// Every node starts PENDING.
    pub async fn create(
        broker: SharedBroker,
        request_id: RequestId,
        pipeline: &Pipeline,
    ) -> Result<Self, BrokerError> {
        let handle = RequestHandle::new(broker, request_id);
        let key = handle.key();
        let encoded = serde_json::to_string(pipeline).expect("pipeline serialization");
        handle.broker.hash_set(&key, "pipeline", encoded).await?;
        handle
            .broker
            .hash_set(&key, "created_at", Utc::now().timestamp_millis().to_string())
            .await?;
        for node in &pipeline.nodes {
            handle
                .broker
                .hash_set(&key, &state_field(&node.node_id), NodeState::Pending.to_string())
                .await?;
        }
        Ok(handle)
    }

    /// Loads an existing request, or None when the id is unknown.
    pub async fn load(
        broker: SharedBroker,
        request_id: &RequestId,
    ) -> Result<Option<Self>, BrokerError> {
        let handle = RequestHandle::new(broker, request_id.clone());
        if handle.broker.hash_get(&handle.key(), "pipeline").await?.is_none() {
            return Ok(None);
        }
        Ok(Some(handle))
    }

    #[must_use]
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    fn key(&self) -> String {
        keys::request(&self.request_id)
    }

    pub async fn pipeline(&self) -> Result<Pipeline, BrokerError> {
        let raw = self
            .broker
            .hash_get(&self.key(), "pipeline")
            .await?
            .ok_or_else(|| {
                BrokerError::Corrupt(format!("request {} has no pipeline", self.request_id))
            })?;
        serde_json::from_str(&raw)
            .map_err(|e| BrokerError::Corrupt(format!("bad pipeline record: {e}")))
    }

    // ---- node state ----

    pub async fn state(&self, node_id: &NodeId) -> Result<Option<NodeState>, BrokerError> {
        let raw = self.broker.hash_get(&self.key(), &state_field(node_id)).await?;
        raw.map(|s| s.parse().map_err(BrokerError::Corrupt)).transpose()
    }

    pub async fn states(&self) -> Result<HashMap<NodeId, NodeState>, BrokerError> {
        let all = self.broker.hash_get_all(&self.key()).await?;
        let mut states = HashMap::new();
        for (field, value) in all {
            if let Some(node_id) = field.strip_prefix("state:") {
                states.insert(
                    node_id.to_string(),
                    value.parse().map_err(BrokerError::Corrupt)?,
                );
            }
        }
        Ok(states)
    }

    pub async fn set_state(&self, node_id: &NodeId, state: NodeState) -> Result<(), BrokerError> {
        debug!(request_id = %self.request_id, %node_id, %state, "node state");
        self.broker
            .hash_set(&self.key(), &state_field(node_id), state.to_string())
            .await
    }

    /// State change plus the status response the client sees for it.
    pub async fn transition(
        &self,
        node_id: &NodeId,
        state: NodeState,
        message: impl Into<String>,
    ) -> Result<(), BrokerError> {
        self.set_state(node_id, state).await?;
        self.push_response(
            Some(node_id),
            ResponseBody::Status {
                state,
                message: message.into(),
            },
        )
        .await
    }

    pub async fn all_terminal(&self) -> Result<bool, BrokerError> {
        Ok(self.states().await?.values().all(|s| s.is_terminal()))
    }

    // ---- responses ----

    pub async fn push_response(
        &self,
        node_id: Option<&NodeId>,
        body: ResponseBody,
    ) -> Result<(), BrokerError> {
        let response = Response::new(self.request_id.clone(), node_id.cloned(), body);
        let encoded = serde_json::to_string(&response).expect("response serialization");
        self.broker
            .push_back(&keys::response(&self.request_id), encoded)
            .await
    }

    pub async fn send_value(&self, node_id: &NodeId, value: Value) -> Result<(), BrokerError> {
        self.push_response(Some(node_id), ResponseBody::Value { value }).await
    }

    pub async fn send_error(
        &self,
        node_id: &NodeId,
        error_kind: ErrorKind,
        message: impl Into<String>,
        origin: Option<NodeId>,
    ) -> Result<(), BrokerError> {
        self.push_response(
            Some(node_id),
            ResponseBody::Error {
                error_kind,
                message: message.into(),
                origin,
            },
        )
        .await
    }

    pub async fn send_heartbeat(&self) -> Result<(), BrokerError> {
        self.push_response(None, ResponseBody::Heartbeat {}).await
    }

    // ---- fingerprints and continuations ----

    pub async fn fingerprint(&self, node_id: &NodeId) -> Result<Option<Fingerprint>, BrokerError> {
        self.broker.hash_get(&self.key(), &format!("fp:{node_id}")).await
    }

    pub async fn set_fingerprint(
        &self,
        node_id: &NodeId,
        fp: &Fingerprint,
    ) -> Result<(), BrokerError> {
        self.broker
            .hash_set(&self.key(), &format!("fp:{node_id}"), fp.clone())
            .await
    }

    /// Adapter-owned continuation blob carried across delayed re-activations.
    pub async fn continuation(&self, node_id: &NodeId) -> Result<Option<Value>, BrokerError> {
        let raw = self
            .broker
            .hash_get(&self.key(), &format!("cont:{node_id}"))
            .await?;
        raw.map(|s| {
            serde_json::from_str(&s)
                .map_err(|e| BrokerError::Corrupt(format!("bad continuation: {e}")))
        })
        .transpose()
    }

    pub async fn set_continuation(
        &self,
        node_id: &NodeId,
        continuation: &Value,
    ) -> Result<(), BrokerError> {
        self.broker
            .hash_set(&self.key(), &format!("cont:{node_id}"), continuation.to_string())
            .await
    }

    pub async fn clear_continuation(&self, node_id: &NodeId) -> Result<(), BrokerError> {
        self.broker.hash_del(&self.key(), &format!("cont:{node_id}")).await
    }

    // ---- input port bookkeeping ----

    /// Counts one delivered value on a port; returns the new count.
    pub async fn record_input(&self, node_id: &NodeId, port: usize) -> Result<i64, BrokerError> {
        self.broker
            .hash_incr(&self.key(), &format!("seen:{node_id}:{port}"), 1)
            .await
    }

    pub async fn seen_count(&self, node_id: &NodeId, port: usize) -> Result<i64, BrokerError> {
        Ok(self
            .broker
            .hash_get(&self.key(), &format!("seen:{node_id}:{port}"))
            .await?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0))
    }

    pub async fn mark_input_closed(
        &self,
        node_id: &NodeId,
        port: usize,
    ) -> Result<(), BrokerError> {
        self.broker
            .hash_set(&self.key(), &format!("closed:{node_id}:{port}"), "1".to_string())
            .await
    }

    pub async fn input_closed(&self, node_id: &NodeId, port: usize) -> Result<bool, BrokerError> {
        Ok(self
            .broker
            .hash_get(&self.key(), &format!("closed:{node_id}:{port}"))
            .await?
            .is_some())
    }

    // ---- mailboxes ----

    /// Drops a message into a request-scoped mailbox slot.
    pub async fn post_message(&self, mailbox: &str, message: &str) -> Result<(), BrokerError> {
        self.broker
            .set(&keys::mailbox(&self.request_id, mailbox), message.to_string())
            .await
    }

    pub async fn read_message(&self, mailbox: &str) -> Result<Option<String>, BrokerError> {
        self.broker.get(&keys::mailbox(&self.request_id, mailbox)).await
    }

    // ---- cancellation and lifetime ----

    /// Sets the cancellation flag. Returns true the first time only, so
    /// repeated cancels are observable no-ops.
    pub async fn cancel(&self) -> Result<bool, BrokerError> {
        let already = self.broker.hash_get(&self.key(), "cancelled").await?.is_some();
        if already {
            return Ok(false);
        }
        self.broker
            .hash_set(&self.key(), "cancelled", "1".to_string())
            .await?;
        Ok(true)
    }

    pub async fn is_cancelled(&self) -> Result<bool, BrokerError> {
        Ok(self.broker.hash_get(&self.key(), "cancelled").await?.is_some())
    }

    pub async fn created_at(&self) -> Result<DateTime<Utc>, BrokerError> {
        let raw = self
            .broker
            .hash_get(&self.key(), "created_at")
            .await?
            .ok_or_else(|| BrokerError::Corrupt("request has no created_at".to_string()))?;
        let ms: i64 = raw
            .parse()
            .map_err(|e| BrokerError::Corrupt(format!("bad created_at: {e}")))?;
        DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| BrokerError::Corrupt(format!("bad created_at value {ms}")))
    }

    pub async fn age(&self) -> Result<Duration, BrokerError> {
        let created = self.created_at().await?;
        let elapsed = Utc::now().signed_duration_since(created);
        Ok(elapsed.to_std().unwrap_or(Duration::ZERO))
    }

    /// Removes the whole record: request hash, response queue, input ports.
    pub async fn delete(&self) -> Result<(), BrokerError> {
        if let Ok(pipeline) = self.pipeline().await {
            for node in &pipeline.nodes {
                for port in 0..node.inputs.len().max(1) {
                    self.broker
                        .del(&keys::input(&self.request_id, &node.node_id, port))
                        .await?;
                }
            }
        }
        self.broker.del(&keys::response(&self.request_id)).await?;
        self.broker.del(&self.key()).await?;
        Ok(())
    }

    // ---- scheduling ----

    /// Pushes a node straight onto the execution queue.
    pub async fn enqueue_now(&self, node_id: &NodeId) -> Result<(), BrokerError> {
        let item = WorkItem::new(self.request_id.clone(), node_id.clone());
        self.broker.push_back(keys::EXEC_QUEUE, item.encode()).await
    }

    /// Parks a node on the delayed queue until `at` (wall-clock ms) and
    /// pokes the scheduler.
    pub async fn schedule_at(&self, node_id: &NodeId, at_ms: i64) -> Result<(), BrokerError> {
        let item = WorkItem::new(self.request_id.clone(), node_id.clone());
        self.broker
            .zadd(keys::SCHED_DELAYED, at_ms, item.encode())
            .await?;
        self.broker
            .publish(keys::SCHED_WAKE, at_ms.to_string())
            .await
    }
}

fn state_field(node_id: &NodeId) -> String {
    format!("state:{node_id}")
}
