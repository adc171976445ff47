//! The ingress service: accepts pipelines over HTTP, verifies and optimizes
//! them, seeds the initial ready set, and serves response polling and
//! cancellation.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::adapter::PortItem;
use crate::api::response::Response;
use crate::api::{NodeState, Pipeline, RequestId};
use crate::broker::{keys, Broker, SharedBroker};
use crate::config::SiteConfig;
use crate::executor::enqueue_if_ready;
use crate::pipeline::{optimize, verify};
use crate::provider::Dispatch;
use crate::request::RequestHandle;

/// Server-side clamp on the blocking poll in `/responses`.
const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_POLL_BATCH: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("{message}")]
    BadPipeline { message: String },
    #[error("no such request: {request_id}")]
    NoSuchRequest { request_id: String },
    #[error("missing or invalid authorization")]
    Unauthorized,
    #[error("{message}")]
    Internal { message: String },
}

impl ProcessError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            ProcessError::BadPipeline { .. } => (StatusCode::BAD_REQUEST, "BAD_PIPELINE"),
            ProcessError::NoSuchRequest { .. } => (StatusCode::NOT_FOUND, "NO_SUCH_REQUEST"),
            ProcessError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ProcessError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        }
    }
}

impl IntoResponse for ProcessError {
    fn into_response(self) -> HttpResponse {
        let (status, kind) = self.status_and_kind();
        let body = json!({
            "error_kind": kind,
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<crate::broker::BrokerError> for ProcessError {
    fn from(e: crate::broker::BrokerError) -> Self {
        ProcessError::Internal {
            message: e.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct ProcessState {
    pub broker: SharedBroker,
    pub site: Arc<SiteConfig>,
    pub dispatch: Arc<Dispatch>,
    pub auth_api_key: Option<String>,
}

impl ProcessState {
    #[must_use]
    pub fn new(
        broker: SharedBroker,
        site: Arc<SiteConfig>,
        dispatch: Arc<Dispatch>,
        auth_api_key: Option<String>,
    ) -> Self {
        ProcessState {
            broker,
            site,
            dispatch,
            auth_api_key,
        }
    }
}

/// Verifies, optimizes, and persists a pipeline, returning the new request
/// id. The initial ready set lands on the execution queue; nodes with a
/// future `not_before` go to the delayed queue.
pub async fn submit_pipeline(
    broker: &SharedBroker,
    site: &SiteConfig,
    mut pipeline: Pipeline,
) -> Result<RequestId, ProcessError> {
    pipeline.normalize();
    verify(&pipeline, site).map_err(|e| ProcessError::BadPipeline {
        message: e.to_string(),
    })?;
    let optimized = optimize(pipeline).map_err(|e| ProcessError::BadPipeline {
        message: e.to_string(),
    })?;

    let request_id = Uuid::new_v4().to_string();
    let req = RequestHandle::create(broker.clone(), request_id.clone(), &optimized.pipeline).await?;

    for (node_id, fp) in &optimized.fingerprints {
        req.set_fingerprint(node_id, fp).await?;
    }
    // Folded constants never run; they are born COMPLETED and their literal
    // is already waiting on the consumer's port.
    for node_id in &optimized.folded_nodes {
        req.set_state(node_id, NodeState::Completed).await?;
    }
    for folded in &optimized.folded_inputs {
        let key = keys::input(&request_id, &folded.consumer, folded.port);
        broker
            .push_back(&key, PortItem::Value { v: folded.value.clone() }.encode())
            .await?;
        broker.push_back(&key, PortItem::End.encode()).await?;
        req.record_input(&folded.consumer, folded.port).await?;
        req.mark_input_closed(&folded.consumer, folded.port).await?;
    }
    for node in &optimized.pipeline.nodes {
        enqueue_if_ready(
            broker,
            &req,
            &optimized.pipeline,
            &node.node_id,
            site.request_timeout(),
        )
        .await?;
    }
    info!(%request_id, nodes = optimized.pipeline.nodes.len(), "pipeline accepted");
    Ok(request_id)
}

/// Drains queued responses for a request, blocking briefly when none are
/// available yet. An empty result is a normal outcome; the client polls
/// again.
pub async fn poll_responses(
    broker: &SharedBroker,
    request_id: &RequestId,
    max: usize,
    timeout: Duration,
) -> Result<Vec<Response>, ProcessError> {
    if RequestHandle::load(broker.clone(), request_id).await?.is_none() {
        return Err(ProcessError::NoSuchRequest {
            request_id: request_id.clone(),
        });
    }
    let raw = broker
        .pop_front_many(
            &keys::response(request_id),
            max.clamp(1, MAX_POLL_BATCH),
            timeout.min(MAX_POLL_TIMEOUT),
        )
        .await?;
    raw.iter()
        .map(|entry| {
            serde_json::from_str(entry).map_err(|e| ProcessError::Internal {
                message: format!("bad response record: {e}"),
            })
        })
        .collect()
}

/// Flags a request cancelled. Safe to repeat; only the first call changes
/// anything.
pub async fn cancel_request(
    broker: &SharedBroker,
    request_id: &RequestId,
) -> Result<(), ProcessError> {
    let Some(req) = RequestHandle::load(broker.clone(), request_id).await? else {
        return Err(ProcessError::NoSuchRequest {
            request_id: request_id.clone(),
        });
    };
    if req.cancel().await? {
        info!(%request_id, "request cancelled");
    }
    Ok(())
}

// ---- HTTP surface ----

async fn version(State(state): State<ProcessState>) -> Json<serde_json::Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "site": state.site.site,
    }))
}

async fn discover(State(state): State<ProcessState>) -> Json<serde_json::Value> {
    Json(json!({ "providers": state.dispatch.discover() }))
}

async fn process_pipeline(
    State(state): State<ProcessState>,
    Json(pipeline): Json<Pipeline>,
) -> Result<(StatusCode, Json<serde_json::Value>), ProcessError> {
    let request_id = submit_pipeline(&state.broker, &state.site, pipeline).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "request_id": request_id }))))
}

#[derive(Debug, Deserialize)]
struct ResponsesQuery {
    max: Option<usize>,
    timeout_ms: Option<u64>,
}

async fn responses(
    State(state): State<ProcessState>,
    Path(request_id): Path<String>,
    Query(query): Query<ResponsesQuery>,
) -> Result<Json<serde_json::Value>, ProcessError> {
    let drained = poll_responses(
        &state.broker,
        &request_id,
        query.max.unwrap_or(MAX_POLL_BATCH),
        Duration::from_millis(query.timeout_ms.unwrap_or(1_000)),
    )
    .await?;
    Ok(Json(json!({ "responses": drained })))
}

async fn cancel(
    State(state): State<ProcessState>,
    Path(request_id): Path<String>,
) -> Result<Json<serde_json::Value>, ProcessError> {
    cancel_request(&state.broker, &request_id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn require_auth(
    State(state): State<ProcessState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<HttpResponse, ProcessError> {
    if let Some(expected) = &state.auth_api_key {
        let presented = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        if presented != Some(expected.as_str()) {
            return Err(ProcessError::Unauthorized);
        }
    }
    Ok(next.run(request).await)
}

#[must_use]
pub fn router(state: ProcessState) -> Router {
    Router::new()
        .route("/version", get(version))
        .route("/discover", get(discover))
        .route("/process", post(process_pipeline))
        .route("/responses/:request_id", get(responses))
        .route("/cancel/:request_id", post(cancel))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds and serves the ingress until the task is aborted.
pub async fn serve(state: ProcessState, addr: std::net::SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "process service listening");
    axum::serve(listener, router(state)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{NodeSpec, CONSTANT_API};
    use crate::broker::MemoryBroker;
    use crate::provider::AdapterRegistry;

    fn state() -> ProcessState {
        let broker = MemoryBroker::shared();
        let site = SiteConfig::builtin("test-site");
        let dispatch = Dispatch::new(&site, AdapterRegistry::builtin()).unwrap();
        ProcessState::new(broker, Arc::new(site), Arc::new(dispatch), None)
    }

    #[tokio::test]
    async fn submit_rejects_bad_pipeline() {
        let state = state();
        let pipeline = Pipeline::new(vec![NodeSpec::new("x", "dfm.api.Nope")]);
        let err = submit_pipeline(&state.broker, &state.site, pipeline)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::BadPipeline { .. }));
    }

    #[tokio::test]
    async fn submit_enqueues_initial_ready_set() {
        let state = state();
        let pipeline = Pipeline::new(vec![NodeSpec::new("c", CONSTANT_API)
            .with_params(json!({"value": 42}))
            .output()]);
        let request_id = submit_pipeline(&state.broker, &state.site, pipeline)
            .await
            .unwrap();
        assert_eq!(
            state.broker.list_len(keys::EXEC_QUEUE).await.unwrap(),
            1,
            "root node should be on the execution queue"
        );
        let req = RequestHandle::load(state.broker.clone(), &request_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            req.state(&"c".to_string()).await.unwrap(),
            Some(NodeState::Ready)
        );
    }

    #[tokio::test]
    async fn polling_unknown_request_is_not_found() {
        let state = state();
        let err = poll_responses(
            &state.broker,
            &"missing".to_string(),
            10,
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProcessError::NoSuchRequest { .. }));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_through_the_api() {
        let state = state();
        let pipeline = Pipeline::new(vec![NodeSpec::new("c", CONSTANT_API)
            .with_params(json!({"value": 1}))
            .output()]);
        let request_id = submit_pipeline(&state.broker, &state.site, pipeline)
            .await
            .unwrap();
        cancel_request(&state.broker, &request_id).await.unwrap();
        cancel_request(&state.broker, &request_id).await.unwrap();
    }
}
