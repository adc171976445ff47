use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fingerprint;

pub mod params;
pub mod response;

pub type NodeId = String;
pub type RequestId = String;

/// Default provider namespace, used when a node does not name one.
pub const DEFAULT_PROVIDER: &str = "dfm";

/// The pure-constant function. Nodes with this api_class are subject to
/// constant folding during pipeline optimization.
pub const CONSTANT_API: &str = "dfm.api.dfm.Constant";

/// Lifecycle state of a single node within a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl NodeState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Completed | NodeState::Failed | NodeState::Cancelled
        )
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Pending => "PENDING",
            NodeState::Ready => "READY",
            NodeState::Running => "RUNNING",
            NodeState::Completed => "COMPLETED",
            NodeState::Failed => "FAILED",
            NodeState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// One function call in a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSpec {
    /// Stable identifier, unique within the pipeline. Client-assigned, or
    /// filled in deterministically by [`Pipeline::normalize`].
    #[serde(default)]
    pub node_id: NodeId,
    pub api_class: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "empty_object")]
    pub params: Value,
    #[serde(default)]
    pub inputs: Vec<NodeId>,
    #[serde(default)]
    pub after: Vec<NodeId>,
    #[serde(default)]
    pub is_output: bool,
    #[serde(default)]
    pub force_compute: bool,
    /// Earliest wall-clock time this node may run. Routes the node through
    /// the delayed queue instead of the execution queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<chrono::DateTime<chrono::Utc>>,
}

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl NodeSpec {
    pub fn new(node_id: impl Into<NodeId>, api_class: impl Into<String>) -> Self {
        NodeSpec {
            node_id: node_id.into(),
            api_class: api_class.into(),
            provider: default_provider(),
            params: empty_object(),
            inputs: Vec::new(),
            after: Vec::new(),
            is_output: false,
            force_compute: false,
            not_before: None,
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn with_inputs<I: IntoIterator<Item = S>, S: Into<NodeId>>(mut self, inputs: I) -> Self {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_after<I: IntoIterator<Item = S>, S: Into<NodeId>>(mut self, after: I) -> Self {
        self.after = after.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    #[must_use]
    pub fn output(mut self) -> Self {
        self.is_output = true;
        self
    }

    #[must_use]
    pub fn forced(mut self) -> Self {
        self.force_compute = true;
        self
    }

    #[must_use]
    pub fn not_before(mut self, at: chrono::DateTime<chrono::Utc>) -> Self {
        self.not_before = Some(at);
        self
    }
}

/// A client-submitted DAG of function calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pipeline {
    pub nodes: Vec<NodeSpec>,
}

impl Pipeline {
    pub fn new(nodes: Vec<NodeSpec>) -> Self {
        Pipeline { nodes }
    }

    /// Assigns deterministic ids to nodes the client left unnamed. The id is
    /// derived from the node's api_class, canonical params, and position, so
    /// resubmitting the same pipeline yields the same ids.
    pub fn normalize(&mut self) {
        for (index, node) in self.nodes.iter_mut().enumerate() {
            if node.node_id.is_empty() {
                node.node_id = auto_node_id(&node.api_class, &node.params, index);
            }
        }
    }

    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }
}

fn auto_node_id(api_class: &str, params: &Value, index: usize) -> NodeId {
    let canonical = fingerprint::canonical_string(params).unwrap_or_default();
    let digest = fingerprint::digest_parts(&[api_class, &canonical, &index.to_string()]);
    format!("n{}", &digest[..12])
}

/// Declared input arity of an api_class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Nullary,
    Unary,
    NAry,
}

impl Arity {
    #[must_use]
    pub fn matches(self, input_count: usize) -> bool {
        match self {
            Arity::Nullary => input_count == 0,
            Arity::Unary => input_count == 1,
            Arity::NAry => input_count >= 1,
        }
    }
}

/// Registry entry for one api_class: its arity and its params schema.
pub struct ApiSpec {
    pub api_class: &'static str,
    pub description: &'static str,
    pub arity: Arity,
    validate: fn(&Value) -> Result<(), String>,
}

impl ApiSpec {
    /// Validates a params record against this api_class's schema. Unknown
    /// fields are rejected.
    pub fn validate_params(&self, params: &Value) -> Result<(), String> {
        if !params.is_object() {
            return Err("params must be a JSON object".to_string());
        }
        (self.validate)(params)
    }
}

fn validate_as<P: serde::de::DeserializeOwned>(params: &Value) -> Result<(), String> {
    serde_json::from_value::<P>(params.clone())
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// The closed api_class registry. Adding a function means adding a tag, a
/// params schema, and an arity here.
pub fn registry() -> &'static [ApiSpec] {
    use params::*;
    static REGISTRY: &[ApiSpec] = &[
        ApiSpec {
            api_class: CONSTANT_API,
            description: "Yield a literal value once",
            arity: Arity::Nullary,
            validate: validate_as::<ConstantParams>,
        },
        ApiSpec {
            api_class: "dfm.api.dfm.GreetMe",
            description: "Yield a greeting for the given name",
            arity: Arity::Nullary,
            validate: validate_as::<GreetMeParams>,
        },
        ApiSpec {
            api_class: "dfm.api.dfm.SignalClient",
            description: "Yield a message, typically ordered after other nodes",
            arity: Arity::Nullary,
            validate: validate_as::<SignalClientParams>,
        },
        ApiSpec {
            api_class: "dfm.api.dfm.SendMessage",
            description: "Write a message into a request-scoped mailbox",
            arity: Arity::Nullary,
            validate: validate_as::<SendMessageParams>,
        },
        ApiSpec {
            api_class: "dfm.api.dfm.AwaitMessage",
            description: "Wait for a mailbox message, re-scheduling until it arrives",
            arity: Arity::Nullary,
            validate: validate_as::<AwaitMessageParams>,
        },
        ApiSpec {
            api_class: "dfm.api.dfm.Zip2",
            description: "Pair up values from two upstream streams",
            arity: Arity::NAry,
            validate: validate_as::<Zip2Params>,
        },
        ApiSpec {
            api_class: "dfm.api.testing.Sleepy",
            description: "Sleep, then yield or fail as configured",
            arity: Arity::Nullary,
            validate: validate_as::<SleepyParams>,
        },
        ApiSpec {
            api_class: "dfm.api.testing.EmitSeries",
            description: "Yield a run of consecutive integers",
            arity: Arity::Nullary,
            validate: validate_as::<EmitSeriesParams>,
        },
        ApiSpec {
            api_class: "dfm.api.testing.Square",
            description: "Square each upstream integer",
            arity: Arity::Unary,
            validate: validate_as::<SquareParams>,
        },
        ApiSpec {
            api_class: "dfm.api.data_loader.LoadModelData",
            description: "Load synthetic model frames for a point in time",
            arity: Arity::Nullary,
            validate: validate_as::<LoadModelDataParams>,
        },
    ];
    REGISTRY
}

#[must_use]
pub fn lookup(api_class: &str) -> Option<&'static ApiSpec> {
    registry().iter().find(|spec| spec.api_class == api_class)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_assigns_stable_ids() {
        let mut a = Pipeline::new(vec![
            NodeSpec::new("", CONSTANT_API).with_params(json!({"value": 1}))
        ]);
        let mut b = a.clone();
        a.normalize();
        b.normalize();
        assert_eq!(a.nodes[0].node_id, b.nodes[0].node_id);
        assert!(a.nodes[0].node_id.starts_with('n'));
    }

    #[test]
    fn normalize_distinguishes_position() {
        let mut p = Pipeline::new(vec![
            NodeSpec::new("", CONSTANT_API).with_params(json!({"value": 1})),
            NodeSpec::new("", CONSTANT_API).with_params(json!({"value": 1})),
        ]);
        p.normalize();
        assert_ne!(p.nodes[0].node_id, p.nodes[1].node_id);
    }

    #[test]
    fn registry_rejects_unknown_param_fields() {
        let spec = lookup(CONSTANT_API).unwrap();
        assert!(spec.validate_params(&json!({"value": 42})).is_ok());
        assert!(spec
            .validate_params(&json!({"value": 42, "bogus": true}))
            .is_err());
    }

    #[test]
    fn arity_matching() {
        assert!(Arity::Nullary.matches(0));
        assert!(!Arity::Nullary.matches(1));
        assert!(Arity::Unary.matches(1));
        assert!(!Arity::Unary.matches(2));
        assert!(Arity::NAry.matches(2));
        assert!(!Arity::NAry.matches(0));
    }

    #[test]
    fn pipeline_json_round_trip() {
        let raw = json!({
            "nodes": [
                {"node_id": "c", "api_class": CONSTANT_API, "params": {"value": 42}, "is_output": true},
                {"node_id": "sq", "api_class": "dfm.api.testing.Square", "inputs": ["c"]}
            ]
        });
        let pipeline: Pipeline = serde_json::from_value(raw).unwrap();
        assert_eq!(pipeline.nodes.len(), 2);
        assert_eq!(pipeline.nodes[0].provider, DEFAULT_PROVIDER);
        assert_eq!(pipeline.nodes[1].inputs, vec!["c".to_string()]);
    }
}
