//! Deterministic fingerprints over a node's semantic identity. The
//! fingerprint is the cache key: two nodes with the same api_class,
//! canonical params, provider, and upstream fingerprints are
//! interchangeable.

use std::collections::HashMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::api::{NodeId, Pipeline};

pub type Fingerprint = String;

#[derive(Debug)]
pub enum FingerprintError {
    /// Params contain a float that has no canonical form (NaN or infinity).
    NonCanonicalNumber(String),
    /// An input edge references a node with no computed fingerprint, which
    /// means the pipeline was not topologically ordered or is not closed.
    UnresolvedInput { node_id: NodeId, input: NodeId },
}

impl std::fmt::Display for FingerprintError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FingerprintError::NonCanonicalNumber(repr) => {
                write!(f, "params contain a non-canonical number: {repr}")
            }
            FingerprintError::UnresolvedInput { node_id, input } => {
                write!(f, "node {node_id}: no fingerprint for input {input}")
            }
        }
    }
}

impl std::error::Error for FingerprintError {}

/// Renders a JSON value into its canonical textual form: object keys sorted,
/// integral floats normalized to integers, compact separators. Cache-key
/// equality is semantic equality, so `{"a":1,"b":2}` and `{"b":2.0,"a":1}`
/// canonicalize identically.
pub fn canonical_string(value: &Value) -> Result<String, FingerprintError> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), FingerprintError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.push_str(&i.to_string());
            } else if let Some(u) = n.as_u64() {
                out.push_str(&u.to_string());
            } else if let Some(f) = n.as_f64() {
                if !f.is_finite() {
                    return Err(FingerprintError::NonCanonicalNumber(n.to_string()));
                }
                if f.fract() == 0.0 && f.abs() < 9.0e15 {
                    out.push_str(&(f as i64).to_string());
                } else {
                    out.push_str(&format!("{f:?}"));
                }
            } else {
                return Err(FingerprintError::NonCanonicalNumber(n.to_string()));
            }
        }
        Value::String(s) => {
            out.push_str(&serde_json::to_string(s).expect("string serialization"));
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serialization"));
                out.push(':');
                write_canonical(&map[*key], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

/// SHA-256 over length-prefixed parts, hex encoded. Length prefixes keep
/// `["ab","c"]` and `["a","bc"]` distinct.
#[must_use]
pub fn digest_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Fingerprint of a single node given the fingerprints of its inputs, in
/// input order.
pub fn node_fingerprint(
    api_class: &str,
    params: &Value,
    provider: &str,
    upstream: &[&Fingerprint],
) -> Result<Fingerprint, FingerprintError> {
    let canonical = canonical_string(params)?;
    let mut parts: Vec<&str> = vec![api_class, &canonical, provider];
    for fp in upstream {
        parts.push(fp.as_str());
    }
    Ok(digest_parts(&parts))
}

/// Computes fingerprints for every node in the pipeline, walking edges so
/// each node sees its upstream fingerprints. The pipeline must be verified
/// (acyclic, closed edges) first.
pub fn pipeline_fingerprints(
    pipeline: &Pipeline,
) -> Result<HashMap<NodeId, Fingerprint>, FingerprintError> {
    let mut done: HashMap<NodeId, Fingerprint> = HashMap::new();
    // Verified pipelines are acyclic, so this settles in at most n passes.
    while done.len() < pipeline.nodes.len() {
        let before = done.len();
        for node in &pipeline.nodes {
            if done.contains_key(&node.node_id) {
                continue;
            }
            if node.inputs.iter().all(|input| done.contains_key(input)) {
                let upstream: Vec<&Fingerprint> =
                    node.inputs.iter().map(|input| &done[input]).collect();
                let fp =
                    node_fingerprint(&node.api_class, &node.params, &node.provider, &upstream)?;
                done.insert(node.node_id.clone(), fp);
            }
        }
        if done.len() == before {
            // Only reachable on unverified input; report the first stuck edge.
            let node = pipeline
                .nodes
                .iter()
                .find(|n| !done.contains_key(&n.node_id))
                .expect("some node is unresolved");
            let input = node
                .inputs
                .iter()
                .find(|i| !done.contains_key(*i))
                .cloned()
                .unwrap_or_default();
            return Err(FingerprintError::UnresolvedInput {
                node_id: node.node_id.clone(),
                input,
            });
        }
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{NodeSpec, CONSTANT_API};
    use serde_json::json;

    #[test]
    fn canonical_sorts_keys_and_normalizes_numbers() {
        let a = canonical_string(&json!({"b": 2.0, "a": 1})).unwrap();
        let b = canonical_string(&json!({"a": 1, "b": 2})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn canonical_preserves_fractional_floats() {
        let a = canonical_string(&json!({"x": 1.5})).unwrap();
        assert_eq!(a, r#"{"x":1.5}"#);
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let fp1 = node_fingerprint(CONSTANT_API, &json!({"value": 42}), "dfm", &[]).unwrap();
        let fp2 = node_fingerprint(CONSTANT_API, &json!({"value": 42}), "dfm", &[]).unwrap();
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.len(), 64);
    }

    #[test]
    fn fingerprint_varies_with_each_component() {
        let base = node_fingerprint(CONSTANT_API, &json!({"value": 42}), "dfm", &[]).unwrap();
        let params = node_fingerprint(CONSTANT_API, &json!({"value": 43}), "dfm", &[]).unwrap();
        let provider = node_fingerprint(CONSTANT_API, &json!({"value": 42}), "other", &[]).unwrap();
        let upstream =
            node_fingerprint(CONSTANT_API, &json!({"value": 42}), "dfm", &[&base]).unwrap();
        assert_ne!(base, params);
        assert_ne!(base, provider);
        assert_ne!(base, upstream);
    }

    #[test]
    fn upstream_order_matters() {
        let a = digest_parts(&["x"]);
        let b = digest_parts(&["y"]);
        let ab = node_fingerprint("f", &json!({}), "dfm", &[&a, &b]).unwrap();
        let ba = node_fingerprint("f", &json!({}), "dfm", &[&b, &a]).unwrap();
        assert_ne!(ab, ba);
    }

    #[test]
    fn pipeline_fingerprints_follow_edges() {
        let pipeline = crate::api::Pipeline::new(vec![
            NodeSpec::new("c", CONSTANT_API).with_params(json!({"value": 1})),
            NodeSpec::new("sq", "dfm.api.testing.Square").with_inputs(["c"]),
        ]);
        let fps = pipeline_fingerprints(&pipeline).unwrap();
        assert_eq!(fps.len(), 2);
        let direct = node_fingerprint(
            "dfm.api.testing.Square",
            &json!({}),
            "dfm",
            &[&fps["c"]],
        )
        .unwrap();
        assert_eq!(fps["sq"], direct);
    }
}
