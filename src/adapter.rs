//! The adapter contract. An adapter is the implementation of one api_class
//! within one provider: a cooperative producer that reads zero or more
//! upstream value streams and emits values through its context. Instances
//! are created per node execution and thrown away afterwards.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::api::response::ErrorKind;
use crate::api::NodeId;
use crate::broker::{keys, Broker, SharedBroker};
use crate::provider::ProviderHandle;
use crate::request::RequestHandle;

#[derive(Debug)]
pub enum AdapterError {
    /// The adapter deems its params unusable; never retried.
    BadInput(String),
    /// An external collaborator is unreachable; retried with backoff.
    UpstreamUnavailable(String),
    /// Anything else; terminal.
    Internal(String),
    /// The surrounding execution was cancelled.
    Cancelled,
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterError::BadInput(msg) => write!(f, "bad input: {msg}"),
            AdapterError::UpstreamUnavailable(msg) => write!(f, "upstream unavailable: {msg}"),
            AdapterError::Internal(msg) => write!(f, "internal adapter error: {msg}"),
            AdapterError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for AdapterError {}

impl AdapterError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::BadInput(_) => ErrorKind::AdapterBadInput,
            AdapterError::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            AdapterError::Internal(_) => ErrorKind::Internal,
            AdapterError::Cancelled => ErrorKind::Cancelled,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::UpstreamUnavailable(_))
    }
}

/// Parses a typed params or config record, mapping failures to BadInput.
pub fn parse_record<P: DeserializeOwned>(record: &Value) -> Result<P, AdapterError> {
    serde_json::from_value(record.clone()).map_err(|e| AdapterError::BadInput(e.to_string()))
}

/// One entry on an input port: a value, an orderly close, or an abort
/// because the upstream failed or was cancelled.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum PortItem {
    Value { v: Value },
    End,
    Abort,
}

impl PortItem {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("port item serialization")
    }
}

/// A broker-backed stream of values from one upstream node, observed in the
/// upstream's yield order.
pub struct ValueStream {
    broker: SharedBroker,
    key: String,
    done: bool,
}

impl ValueStream {
    #[must_use]
    pub fn new(
        broker: SharedBroker,
        request_id: &crate::api::RequestId,
        consumer: &NodeId,
        port: usize,
    ) -> Self {
        ValueStream {
            key: keys::input(request_id, consumer, port),
            broker,
            done: false,
        }
    }

    /// The next upstream value, or None when the upstream completed. An
    /// aborted upstream surfaces as Cancelled.
    pub async fn next(&mut self) -> Result<Option<Value>, AdapterError> {
        if self.done {
            return Ok(None);
        }
        loop {
            let popped = self
                .broker
                .pop_front(&self.key, Duration::from_millis(250))
                .await
                .map_err(|e| AdapterError::Internal(e.to_string()))?;
            let Some(raw) = popped else {
                continue;
            };
            let item: PortItem = serde_json::from_str(&raw)
                .map_err(|e| AdapterError::Internal(format!("bad port item: {e}")))?;
            return match item {
                PortItem::Value { v } => Ok(Some(v)),
                PortItem::End => {
                    self.done = true;
                    Ok(None)
                }
                PortItem::Abort => {
                    self.done = true;
                    Err(AdapterError::Cancelled)
                }
            };
        }
    }

    /// Drains the remaining stream into a vector.
    pub async fn collect(&mut self) -> Result<Vec<Value>, AdapterError> {
        let mut values = Vec::new();
        while let Some(value) = self.next().await? {
            values.push(value);
        }
        Ok(values)
    }
}

/// Upstream streams handed to an adapter, shaped by its declared arity.
pub enum Inputs {
    None,
    One(ValueStream),
    Many(Vec<ValueStream>),
}

impl Inputs {
    /// The single stream of a unary adapter.
    pub fn into_one(self) -> Result<ValueStream, AdapterError> {
        match self {
            Inputs::One(stream) => Ok(stream),
            _ => Err(AdapterError::Internal(
                "adapter arity does not match its inputs".to_string(),
            )),
        }
    }

    pub fn into_many(self) -> Result<Vec<ValueStream>, AdapterError> {
        match self {
            Inputs::Many(streams) => Ok(streams),
            Inputs::One(stream) => Ok(vec![stream]),
            Inputs::None => Err(AdapterError::Internal(
                "adapter arity does not match its inputs".to_string(),
            )),
        }
    }
}

/// A deferred re-activation requested through `schedule_after`.
#[derive(Debug, Clone)]
pub struct Deferral {
    pub delay: Duration,
    pub continuation: Value,
}

/// Execution context handed to an adapter body: its identity, its request
/// handle for responses and mailboxes, and the channel its values flow out
/// through.
pub struct AdapterCtx {
    request: RequestHandle,
    node_id: NodeId,
    provider: Arc<ProviderHandle>,
    continuation: Option<Value>,
    tx: mpsc::Sender<Value>,
    deferral: Arc<Mutex<Option<Deferral>>>,
}

impl AdapterCtx {
    pub(crate) fn new(
        request: RequestHandle,
        node_id: NodeId,
        provider: Arc<ProviderHandle>,
        continuation: Option<Value>,
        tx: mpsc::Sender<Value>,
    ) -> (Self, Arc<Mutex<Option<Deferral>>>) {
        let deferral = Arc::new(Mutex::new(None));
        let ctx = AdapterCtx {
            request,
            node_id,
            provider,
            continuation,
            tx,
            deferral: Arc::clone(&deferral),
        };
        (ctx, deferral)
    }

    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    #[must_use]
    pub fn request(&self) -> &RequestHandle {
        &self.request
    }

    #[must_use]
    pub fn provider(&self) -> &ProviderHandle {
        &self.provider
    }

    /// The blob the adapter stored on its previous activation, if any.
    #[must_use]
    pub fn continuation(&self) -> Option<&Value> {
        self.continuation.as_ref()
    }

    /// Yields one value downstream. Fails when the execution was cancelled
    /// and nobody is consuming anymore.
    pub async fn emit(&self, value: Value) -> Result<(), AdapterError> {
        self.tx.send(value).await.map_err(|_| AdapterError::Cancelled)
    }

    /// Asks for this node to be re-activated after `delay`, with
    /// `continuation` available on the next run. The body should return Ok
    /// without yielding afterwards; the worker is released in the meantime.
    pub async fn schedule_after(
        &self,
        delay: Duration,
        continuation: Value,
    ) -> Result<(), AdapterError> {
        let mut slot = self.deferral.lock().await;
        *slot = Some(Deferral { delay, continuation });
        Ok(())
    }
}

#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// Builds an instance from the binding's static config and the node's
    /// params. Params arrive already schema-validated.
    fn configure(config: &Value, params: &Value) -> Result<Self, AdapterError>
    where
        Self: Sized;

    /// The producer. Reads upstream streams, emits values through the
    /// context, and may await external I/O freely. Side effects should be
    /// idempotent; a retried node runs the body again.
    async fn body(&self, ctx: &AdapterCtx, inputs: Inputs) -> Result<(), AdapterError>;
}
