//! Node registry.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::node::Node;
use crate::protocol::constants::MAX_NODE_ID;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Node {0} already registered")]
    Duplicate(u8),

    #[error("Invalid node id {0}")]
    InvalidId(u8),
}

/// Nodes of one driver, keyed by node id.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: BTreeMap<u8, Node>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. An id is reusable only after `remove`.
    pub fn add(&mut self, node: Node) -> Result<(), RegistryError> {
        if node.node_id == 0 || node.node_id > MAX_NODE_ID {
            return Err(RegistryError::InvalidId(node.node_id));
        }
        if self.nodes.contains_key(&node.node_id) {
            return Err(RegistryError::Duplicate(node.node_id));
        }
        self.nodes.insert(node.node_id, node);
        Ok(())
    }

    pub fn remove(&mut self, node_id: u8) -> Option<Node> {
        self.nodes.remove(&node_id)
    }

    pub fn get(&self, node_id: u8) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    pub fn get_mut(&mut self, node_id: u8) -> Option<&mut Node> {
        self.nodes.get_mut(&node_id)
    }

    pub fn contains(&self, node_id: u8) -> bool {
        self.nodes.contains_key(&node_id)
    }

    pub fn ids(&self) -> Vec<u8> {
        self.nodes.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_ids() {
        let mut registry = NodeRegistry::new();
        registry.add(Node::new(2)).unwrap();
        assert_eq!(registry.add(Node::new(2)), Err(RegistryError::Duplicate(2)));
        assert!(registry.remove(2).is_some());
        assert!(registry.add(Node::new(2)).is_ok());
    }

    #[test]
    fn test_rejects_out_of_range() {
        let mut registry = NodeRegistry::new();
        assert_eq!(registry.add(Node::new(0)), Err(RegistryError::InvalidId(0)));
        assert_eq!(registry.add(Node::new(233)), Err(RegistryError::InvalidId(233)));
        assert!(registry.is_empty());
    }
}
