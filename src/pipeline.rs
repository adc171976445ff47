//! Pipeline verification and optimization. Verification rejects anything
//! the executor could choke on later; optimization applies two deterministic
//! rewrites (duplicate elimination by fingerprint, constant folding) before
//! the request record is persisted.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde_json::Value;
use tracing::debug;

use crate::api::{self, Arity, NodeId, NodeSpec, Pipeline, CONSTANT_API};
use crate::config::SiteConfig;
use crate::fingerprint::{self, Fingerprint, FingerprintError};

#[derive(Debug)]
pub enum VerifyError {
    DuplicateNodeId(NodeId),
    UnknownReference { node_id: NodeId, reference: NodeId },
    CycleDetected,
    UnknownApiClass { node_id: NodeId, api_class: String },
    UnknownProvider { node_id: NodeId, provider: String },
    NotOffered { node_id: NodeId, provider: String, api_class: String },
    BadParams { node_id: NodeId, reason: String },
    ArityMismatch { node_id: NodeId, api_class: String, inputs: usize },
    Fingerprint(FingerprintError),
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyError::DuplicateNodeId(id) => write!(f, "duplicate node id {id:?}"),
            VerifyError::UnknownReference { node_id, reference } => {
                write!(f, "node {node_id}: edge references unknown node {reference:?}")
            }
            VerifyError::CycleDetected => write!(f, "pipeline contains a cycle"),
            VerifyError::UnknownApiClass { node_id, api_class } => {
                write!(f, "node {node_id}: api_class {api_class:?} is not registered")
            }
            VerifyError::UnknownProvider { node_id, provider } => {
                write!(f, "node {node_id}: provider {provider:?} is not configured at this site")
            }
            VerifyError::NotOffered {
                node_id,
                provider,
                api_class,
            } => write!(
                f,
                "node {node_id}: provider {provider:?} does not offer {api_class:?}"
            ),
            VerifyError::BadParams { node_id, reason } => {
                write!(f, "node {node_id}: invalid params: {reason}")
            }
            VerifyError::ArityMismatch {
                node_id,
                api_class,
                inputs,
            } => write!(
                f,
                "node {node_id}: {api_class} does not accept {inputs} input(s)"
            ),
            VerifyError::Fingerprint(e) => write!(f, "cannot fingerprint pipeline: {e}"),
        }
    }
}

impl std::error::Error for VerifyError {}

impl From<FingerprintError> for VerifyError {
    fn from(e: FingerprintError) -> Self {
        VerifyError::Fingerprint(e)
    }
}

/// Rejects a pipeline that is not a closed, acyclic graph of registered,
/// well-typed function calls offered by this site's providers.
pub fn verify(pipeline: &Pipeline, site: &SiteConfig) -> Result<(), VerifyError> {
    let mut node_ids = HashSet::new();
    for node in &pipeline.nodes {
        if !node_ids.insert(node.node_id.clone()) {
            return Err(VerifyError::DuplicateNodeId(node.node_id.clone()));
        }
    }

    for node in &pipeline.nodes {
        for reference in node.inputs.iter().chain(node.after.iter()) {
            if !node_ids.contains(reference) {
                return Err(VerifyError::UnknownReference {
                    node_id: node.node_id.clone(),
                    reference: reference.clone(),
                });
            }
        }

        let spec = api::lookup(&node.api_class).ok_or_else(|| VerifyError::UnknownApiClass {
            node_id: node.node_id.clone(),
            api_class: node.api_class.clone(),
        })?;
        if !spec.arity.matches(node.inputs.len()) {
            return Err(VerifyError::ArityMismatch {
                node_id: node.node_id.clone(),
                api_class: node.api_class.clone(),
                inputs: node.inputs.len(),
            });
        }
        spec.validate_params(&node.params)
            .map_err(|reason| VerifyError::BadParams {
                node_id: node.node_id.clone(),
                reason,
            })?;

        let provider = site.providers.get(&node.provider).ok_or_else(|| {
            VerifyError::UnknownProvider {
                node_id: node.node_id.clone(),
                provider: node.provider.clone(),
            }
        })?;
        if !provider.interface.contains_key(&node.api_class) {
            return Err(VerifyError::NotOffered {
                node_id: node.node_id.clone(),
                provider: node.provider.clone(),
                api_class: node.api_class.clone(),
            });
        }
    }

    check_acyclic(pipeline)?;
    Ok(())
}

fn check_acyclic(pipeline: &Pipeline) -> Result<(), VerifyError> {
    // Edges run source -> dependent over both value and ordering edges.
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in &pipeline.nodes {
        adjacency.entry(node.node_id.as_str()).or_default();
        for source in node.inputs.iter().chain(node.after.iter()) {
            adjacency
                .entry(source.as_str())
                .or_default()
                .push(node.node_id.as_str());
        }
    }

    let mut visited = HashSet::new();
    let mut stack = HashSet::new();
    for node in &pipeline.nodes {
        if has_cycle(&adjacency, node.node_id.as_str(), &mut visited, &mut stack) {
            return Err(VerifyError::CycleDetected);
        }
    }
    Ok(())
}

fn has_cycle<'a>(
    adjacency: &HashMap<&'a str, Vec<&'a str>>,
    node: &'a str,
    visited: &mut HashSet<&'a str>,
    stack: &mut HashSet<&'a str>,
) -> bool {
    if stack.contains(node) {
        return true;
    }
    if visited.contains(node) {
        return false;
    }
    visited.insert(node);
    stack.insert(node);
    if let Some(dependents) = adjacency.get(node) {
        for dependent in dependents {
            if has_cycle(adjacency, dependent, visited, stack) {
                return true;
            }
        }
    }
    stack.remove(node);
    false
}

/// A constant value destined for a consumer's input port, produced by
/// folding away a Constant node.
#[derive(Debug, Clone)]
pub struct FoldedInput {
    pub consumer: NodeId,
    pub port: usize,
    pub value: Value,
}

/// The optimized form of a verified pipeline, ready to persist.
#[derive(Debug)]
pub struct Optimized {
    pub pipeline: Pipeline,
    pub fingerprints: HashMap<NodeId, Fingerprint>,
    /// Constants to seed into consumer ports at enqueue time.
    pub folded_inputs: Vec<FoldedInput>,
    /// Folded-away nodes, recorded COMPLETED without ever running.
    pub folded_nodes: Vec<NodeId>,
}

/// Applies duplicate elimination and constant folding. Must be called on a
/// verified pipeline.
pub fn optimize(pipeline: Pipeline) -> Result<Optimized, VerifyError> {
    let fingerprints = fingerprint::pipeline_fingerprints(&pipeline)?;

    // Duplicate elimination: the first node with a given fingerprint
    // survives; consumers of a duplicate fan out to the survivor. Ordering
    // constraints of merged nodes are unioned, which can only delay, never
    // reorder.
    let mut survivor_by_fp: HashMap<&Fingerprint, NodeId> = HashMap::new();
    let mut rewrite: HashMap<NodeId, NodeId> = HashMap::new();
    let mut survivors: IndexMap<NodeId, NodeSpec> = IndexMap::new();
    for node in pipeline.nodes {
        let fp = &fingerprints[&node.node_id];
        match survivor_by_fp.get(fp) {
            Some(survivor_id) => {
                debug!(duplicate = %node.node_id, survivor = %survivor_id, "collapsing duplicate node");
                rewrite.insert(node.node_id.clone(), survivor_id.clone());
                let survivor = survivors.get_mut(survivor_id).expect("survivor exists");
                survivor.is_output |= node.is_output;
                survivor.force_compute |= node.force_compute;
                for ordering in node.after {
                    if !survivor.after.contains(&ordering) {
                        survivor.after.push(ordering);
                    }
                }
            }
            None => {
                survivor_by_fp.insert(fp, node.node_id.clone());
                survivors.insert(node.node_id.clone(), node);
            }
        }
    }
    let mut nodes: Vec<NodeSpec> = survivors.into_values().collect();
    for node in &mut nodes {
        for reference in node.inputs.iter_mut().chain(node.after.iter_mut()) {
            if let Some(survivor) = rewrite.get(reference) {
                *reference = survivor.clone();
            }
        }
        node.after.dedup();
    }

    // Constant folding: a non-output Constant that no ordering edge depends
    // on is replaced at its consumers by its literal value.
    let after_referenced: HashSet<NodeId> = nodes
        .iter()
        .flat_map(|n| n.after.iter().cloned())
        .collect();
    let mut folded_values: HashMap<NodeId, Value> = HashMap::new();
    for node in &nodes {
        if node.api_class == CONSTANT_API
            && !node.is_output
            && !node.force_compute
            && !after_referenced.contains(&node.node_id)
        {
            folded_values.insert(node.node_id.clone(), node.params["value"].clone());
        }
    }
    let mut folded_inputs = Vec::new();
    for node in &nodes {
        for (port, input) in node.inputs.iter().enumerate() {
            if let Some(value) = folded_values.get(input) {
                folded_inputs.push(FoldedInput {
                    consumer: node.node_id.clone(),
                    port,
                    value: value.clone(),
                });
            }
        }
    }
    let folded_nodes: Vec<NodeId> = folded_values.keys().cloned().collect();
    nodes.retain(|n| !folded_values.contains_key(&n.node_id));

    Ok(Optimized {
        pipeline: Pipeline::new(nodes),
        fingerprints,
        folded_inputs,
        folded_nodes,
    })
}

/// Consumers of each node's values: (consumer id, port) pairs in consumer
/// input order. The executor uses this to route yielded values.
#[must_use]
pub fn consumers(pipeline: &Pipeline) -> HashMap<NodeId, Vec<(NodeId, usize)>> {
    let mut map: HashMap<NodeId, Vec<(NodeId, usize)>> = HashMap::new();
    for node in &pipeline.nodes {
        for (port, input) in node.inputs.iter().enumerate() {
            map.entry(input.clone())
                .or_default()
                .push((node.node_id.clone(), port));
        }
    }
    map
}

/// Nodes whose `after` set names the given node.
#[must_use]
pub fn after_dependents(pipeline: &Pipeline, node_id: &NodeId) -> Vec<NodeId> {
    pipeline
        .nodes
        .iter()
        .filter(|n| n.after.contains(node_id))
        .map(|n| n.node_id.clone())
        .collect()
}

/// Every node reachable from `origin` along value or ordering edges.
#[must_use]
pub fn transitive_dependents(pipeline: &Pipeline, origin: &NodeId) -> Vec<NodeId> {
    let mut dependents = Vec::new();
    let mut frontier = vec![origin.clone()];
    let mut seen: HashSet<NodeId> = HashSet::new();
    seen.insert(origin.clone());
    while let Some(current) = frontier.pop() {
        for node in &pipeline.nodes {
            if node.inputs.contains(&current) || node.after.contains(&current) {
                if seen.insert(node.node_id.clone()) {
                    dependents.push(node.node_id.clone());
                    frontier.push(node.node_id.clone());
                }
            }
        }
    }
    dependents
}
