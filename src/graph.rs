//! Execution graph traversal.
//!
//! Producers ship node lists in two historical shapes: a flat `nodes[]`
//! array or a nested `graph.nodes[]`. Nodes may reference a parent through
//! `parent_id` and may embed `children[]` arrays. Traversal is an explicit
//! worklist with a visited set keyed by node id, so duplicated ids and
//! `parent_id` cycles are skipped instead of followed.

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::{Map, Value};

/// Node object as found in an event payload.
pub type Node = Map<String, Value>;

/// Name reported for nodes without a usable `name` field.
pub const UNKNOWN_NODE: &str = "unknown";

/// Return the raw node array of a payload.
///
/// `graph.nodes` wins when `graph` is an object that carries `nodes`;
/// otherwise the top-level `nodes` field is used. Anything that is not an
/// array yields `None`.
pub fn node_list(payload: &Map<String, Value>) -> Option<&Vec<Value>> {
    let nodes = match payload.get("graph") {
        Some(Value::Object(graph)) if graph.contains_key("nodes") => graph.get("nodes"),
        _ => payload.get("nodes"),
    };
    nodes.and_then(Value::as_array)
}

/// Stable identifier of a node (`id` or `node_id`, string or number).
pub fn node_id(node: &Node) -> Option<String> {
    ["id", "node_id"]
        .iter()
        .find_map(|key| scalar_string(node.get(*key)?))
}

/// Name of a node, if it has a string `name`.
pub fn node_name(node: &Node) -> Option<&str> {
    node.get("name").and_then(Value::as_str)
}

fn parent_id(node: &Node) -> Option<String> {
    scalar_string(node.get("parent_id")?)
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Visit every object node of a payload in causal order.
///
/// Roots (no `parent_id`, or a parent that names no node) come first in
/// their original order, followed by their descendants breadth-first.
/// Nodes that are only reachable through a `parent_id` cycle are picked up
/// afterwards, each exactly once.
pub fn walk(payload: &Map<String, Value>) -> Vec<&Node> {
    let Some(list) = node_list(payload) else {
        return Vec::new();
    };
    let nodes: Vec<&Node> = list.iter().filter_map(Value::as_object).collect();
    let ids: HashSet<String> = nodes.iter().filter_map(|n| node_id(n)).collect();

    let mut children: HashMap<String, Vec<&Node>> = HashMap::new();
    let mut work: VecDeque<&Node> = VecDeque::new();
    for &node in &nodes {
        match parent_id(node) {
            Some(parent) if ids.contains(&parent) => children.entry(parent).or_default().push(node),
            _ => work.push_back(node),
        }
    }

    let mut visited: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(nodes.len());
    loop {
        while let Some(node) = work.pop_front() {
            if let Some(id) = node_id(node) {
                if !visited.insert(id.clone()) {
                    continue;
                }
                if let Some(kids) = children.get(&id) {
                    work.extend(kids.iter().copied());
                }
            }
            if let Some(Value::Array(embedded)) = node.get("children") {
                work.extend(embedded.iter().filter_map(Value::as_object));
            }
            out.push(node);
        }

        // Whatever is left unvisited hangs off a cycle with no root.
        let orphan = nodes
            .iter()
            .copied()
            .find(|n| node_id(n).is_some_and(|id| !visited.contains(&id)));
        match orphan {
            Some(node) => work.push_back(node),
            None => break,
        }
    }
    out
}

/// Name of the first node in traversal order.
pub fn primary_node_name(payload: &Map<String, Value>) -> Option<String> {
    walk(payload)
        .into_iter()
        .find_map(node_name)
        .map(str::to_string)
}
