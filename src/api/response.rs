//! Response envelopes streamed back to the client. Every message a request
//! produces is one of these, tagged with the request and (usually) the node
//! it concerns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{NodeId, NodeState, RequestId};

/// Error taxonomy surfaced to clients. Kinds, not types: the same kind can
/// originate from different places in the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    BadPipeline,
    NoSuchRequest,
    AdapterBadInput,
    UpstreamUnavailable,
    Internal,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::BadPipeline => "BAD_PIPELINE",
            ErrorKind::NoSuchRequest => "NO_SUCH_REQUEST",
            ErrorKind::AdapterBadInput => "ADAPTER_BAD_INPUT",
            ErrorKind::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ErrorKind::Internal => "INTERNAL",
            ErrorKind::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseBody {
    /// A typed datum produced by the node.
    Value { value: Value },
    /// A lifecycle transition.
    Status { state: NodeState, message: String },
    /// Periodic liveness signal while the request has live nodes.
    Heartbeat {},
    /// Terminal failure detail. `origin` names the node whose failure caused
    /// this, which differs from the envelope's node_id for cascades.
    Error {
        error_kind: ErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<NodeId>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl Response {
    pub fn new(request_id: RequestId, node_id: Option<NodeId>, body: ResponseBody) -> Self {
        Response {
            request_id,
            node_id,
            timestamp: Utc::now(),
            body,
        }
    }

    #[must_use]
    pub fn is_value(&self) -> bool {
        matches!(self.body, ResponseBody::Value { .. })
    }

    #[must_use]
    pub fn is_status(&self) -> bool {
        matches!(self.body, ResponseBody::Status { .. })
    }

    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        matches!(self.body, ResponseBody::Heartbeat {})
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self.body, ResponseBody::Error { .. })
    }

    /// The terminal state this response reports for its node, if any. Errors
    /// count as terminal so stop-node polling also ends on failure; an error
    /// of kind CANCELLED reports the cancelled state, not a failure.
    #[must_use]
    pub fn terminal_state(&self) -> Option<NodeState> {
        match &self.body {
            ResponseBody::Status { state, .. } if state.is_terminal() => Some(*state),
            ResponseBody::Error { error_kind, .. } => match error_kind {
                ErrorKind::Cancelled => Some(NodeState::Cancelled),
                _ => Some(NodeState::Failed),
            },
            _ => None,
        }
    }
}
