//! Worker membership as seen by the master

use std::collections::HashMap;

use crate::store::Node;

/// A worker node and the number of resources assigned to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub node: Node,
    pub payload: usize,
}

impl NodeSpec {
    pub fn new(node: Node) -> Self {
        Self { node, payload: 0 }
    }

    pub fn id(&self) -> &str {
        &self.node.id
    }
}

/// Node IDs that joined, left or changed between two snapshots
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MembershipDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl MembershipDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Compare two snapshots by node ID and node fields; payloads are ignored
pub fn diff(old: &HashMap<String, NodeSpec>, new: &HashMap<String, NodeSpec>) -> MembershipDiff {
    let mut result = MembershipDiff::default();

    for (id, spec) in new {
        match old.get(id) {
            Some(previous) if previous.node != spec.node => result.changed.push(id.clone()),
            Some(_) => {}
            None => result.added.push(id.clone()),
        }
    }
    for id in old.keys() {
        if !new.contains_key(id) {
            result.removed.push(id.clone());
        }
    }

    result.added.sort();
    result.removed.sort();
    result.changed.sort();
    result
}

/// Build a snapshot keyed by node ID
pub fn snapshot(nodes: Vec<Node>) -> HashMap<String, NodeSpec> {
    nodes
        .into_iter()
        .map(|node| (node.id.clone(), NodeSpec::new(node)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_added_removed_changed() {
        let old = snapshot(vec![
            Node::new("a", "10.0.0.1:1"),
            Node::new("b", "10.0.0.2:1"),
            Node::new("c", "10.0.0.3:1"),
        ]);
        let mut moved = Node::new("b", "10.0.0.2:1");
        moved.metadata.insert("zone".into(), "east".into());
        let new = snapshot(vec![
            Node::new("a", "10.0.0.1:1"),
            moved,
            Node::new("d", "10.0.0.4:1"),
        ]);

        let result = diff(&old, &new);
        assert_eq!(result.added, vec!["d"]);
        assert_eq!(result.removed, vec!["c"]);
        assert_eq!(result.changed, vec!["b"]);
    }

    #[test]
    fn test_payload_does_not_count_as_change() {
        let mut old = snapshot(vec![Node::new("a", "x")]);
        old.get_mut("a").unwrap().payload = 3;
        let new = snapshot(vec![Node::new("a", "x")]);
        assert!(diff(&old, &new).is_empty());
    }
}
