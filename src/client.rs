//! HTTP client for the ingress service, with an async iterator over a
//! request's response stream.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::api::response::Response;
use crate::api::{NodeId, Pipeline, RequestId};

#[derive(Debug)]
pub enum ClientError {
    /// Transport-level failure.
    Http(String),
    /// The service answered with an error payload.
    Api {
        status: u16,
        error_kind: String,
        message: String,
    },
    Decode(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Http(msg) => write!(f, "http error: {msg}"),
            ClientError::Api {
                status,
                error_kind,
                message,
            } => write!(f, "service error {status} {error_kind}: {message}"),
            ClientError::Decode(msg) => write!(f, "cannot decode response: {msg}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Http(e.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub site: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub description: String,
    pub apis: Vec<String>,
}

pub struct Client {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl Client {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Client {
            http: reqwest::Client::new(),
            base_url,
            api_key: None,
        }
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{path}", self.base_url));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ClientError::Decode(e.to_string()));
        }
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Err(ClientError::Api {
            status: status.as_u16(),
            error_kind: body["error_kind"].as_str().unwrap_or("UNKNOWN").to_string(),
            message: body["message"].as_str().unwrap_or_default().to_string(),
        })
    }

    pub async fn version(&self) -> Result<VersionInfo, ClientError> {
        let response = self.request(reqwest::Method::GET, "/version").send().await?;
        Self::decode(response).await
    }

    pub async fn discover(&self) -> Result<Vec<ProviderInfo>, ClientError> {
        #[derive(Deserialize)]
        struct Discovery {
            providers: Vec<ProviderInfo>,
        }
        let response = self.request(reqwest::Method::GET, "/discover").send().await?;
        let discovery: Discovery = Self::decode(response).await?;
        Ok(discovery.providers)
    }

    /// Submits a pipeline and returns its request id.
    pub async fn process(&self, pipeline: &Pipeline) -> Result<RequestId, ClientError> {
        #[derive(Deserialize)]
        struct Accepted {
            request_id: RequestId,
        }
        let response = self
            .request(reqwest::Method::POST, "/process")
            .json(pipeline)
            .send()
            .await?;
        let accepted: Accepted = Self::decode(response).await?;
        Ok(accepted.request_id)
    }

    /// One polling round against the response queue. Empty results are
    /// normal; see [`Client::responses`] for the iterator that loops.
    pub async fn poll(
        &self,
        request_id: &RequestId,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<Response>, ClientError> {
        #[derive(Deserialize)]
        struct Drained {
            responses: Vec<Response>,
        }
        let path = format!(
            "/responses/{request_id}?max={max}&timeout_ms={}",
            timeout.as_millis()
        );
        let response = self.request(reqwest::Method::GET, &path).send().await?;
        let drained: Drained = Self::decode(response).await?;
        Ok(drained.responses)
    }

    pub async fn cancel(&self, request_id: &RequestId) -> Result<(), ClientError> {
        let response = self
            .request(reqwest::Method::POST, &format!("/cancel/{request_id}"))
            .send()
            .await?;
        let _: Value = Self::decode(response).await?;
        Ok(())
    }

    /// An iterator over the request's responses, in queue order.
    #[must_use]
    pub fn responses(&self, request_id: RequestId, options: ResponseStream) -> ResponsesIter<'_> {
        ResponsesIter {
            client: self,
            request_id,
            remaining_stops: options.stop_node_ids.into_iter().collect(),
            return_statuses: options.return_statuses,
            return_heartbeats: options.return_heartbeats,
            buffer: VecDeque::new(),
            finished: false,
            empty_polls: 0,
            backoff: Box::new(|empty_polls| {
                Duration::from_millis(100 * u64::from(empty_polls.min(10)))
            }),
        }
    }
}

/// Options for [`Client::responses`].
#[derive(Debug, Default)]
pub struct ResponseStream {
    /// The iterator ends once every one of these nodes reached a terminal
    /// status (or terminal error). Empty means iterate until aborted.
    pub stop_node_ids: Vec<NodeId>,
    /// Yield status envelopes to the caller. Termination tracking happens
    /// either way.
    pub return_statuses: bool,
    pub return_heartbeats: bool,
}

impl ResponseStream {
    #[must_use]
    pub fn stopping_at<I: IntoIterator<Item = S>, S: Into<NodeId>>(stop: I) -> Self {
        ResponseStream {
            stop_node_ids: stop.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_statuses(mut self) -> Self {
        self.return_statuses = true;
        self
    }

    #[must_use]
    pub fn with_heartbeats(mut self) -> Self {
        self.return_heartbeats = true;
        self
    }
}

pub struct ResponsesIter<'a> {
    client: &'a Client,
    request_id: RequestId,
    remaining_stops: HashSet<NodeId>,
    return_statuses: bool,
    return_heartbeats: bool,
    buffer: VecDeque<Response>,
    finished: bool,
    empty_polls: u32,
    backoff: Box<dyn Fn(u32) -> Duration + Send + Sync>,
}

impl<'a> ResponsesIter<'a> {
    /// Replaces the sleep between empty polls. The hook receives the count
    /// of consecutive empty polls so callers can shape their own backoff.
    #[must_use]
    pub fn with_backoff(
        mut self,
        backoff: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.backoff = Box::new(backoff);
        self
    }

    /// The next response, or None once every stop node is terminal. The
    /// response that completes the last stop node is still yielded (unless
    /// filtered); everything after it is not.
    pub async fn next(&mut self) -> Result<Option<Response>, ClientError> {
        loop {
            let was_finished = self.finished;
            if let Some(response) = self.buffer.pop_front() {
                if was_finished {
                    return Ok(None);
                }
                self.track_termination(&response);
                if response.is_heartbeat() && !self.return_heartbeats {
                    continue;
                }
                if response.is_status() && !self.return_statuses {
                    continue;
                }
                return Ok(Some(response));
            }
            if self.finished {
                return Ok(None);
            }
            let batch = self
                .client
                .poll(&self.request_id, 64, Duration::from_secs(1))
                .await?;
            if batch.is_empty() {
                self.empty_polls += 1;
                tokio::time::sleep((self.backoff)(self.empty_polls)).await;
            } else {
                self.empty_polls = 0;
                self.buffer.extend(batch);
            }
        }
    }

    /// Drains the stream into a vector. Only sensible with stop nodes set.
    pub async fn collect_all(&mut self) -> Result<Vec<Response>, ClientError> {
        let mut all = Vec::new();
        while let Some(response) = self.next().await? {
            all.push(response);
        }
        Ok(all)
    }

    fn track_termination(&mut self, response: &Response) {
        if self.remaining_stops.is_empty() {
            return;
        }
        let Some(node_id) = &response.node_id else {
            return;
        };
        if response.terminal_state().is_some() && self.remaining_stops.remove(node_id) {
            self.finished = self.remaining_stops.is_empty();
        }
    }
}
