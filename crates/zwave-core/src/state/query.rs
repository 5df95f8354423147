//! Per-node interview requests and the network-wide completion sweep.

use tracing::info;

use crate::command_class::{self, ManufacturerSpecific};
use crate::node::{Liveness, Node, QueryStage};
use crate::notification::NotificationType;
use crate::protocol::Message;
use crate::registry::NodeRegistry;

/// Requests that move `node` out of its current stage.
///
/// An empty list means the stage completes at once.
pub fn stage_requests(node: &Node) -> Vec<Message> {
    let node_id = node.node_id;
    let supported = || {
        node.command_classes
            .iter()
            .filter_map(|cc| command_class::lookup(*cc))
    };
    match node.stage {
        QueryStage::Discovered => vec![Message::get_node_protocol_info(node_id)],
        QueryStage::ProtocolInfoKnown => vec![ManufacturerSpecific::request(node_id)],
        QueryStage::NamingKnown => vec![Message::request_node_info(node_id)],
        QueryStage::CommandClassesKnown => supported()
            .flat_map(|cc| cc.static_requests(node_id))
            .collect(),
        QueryStage::EssentialComplete => supported()
            .flat_map(|cc| cc.dynamic_requests(node_id))
            .collect(),
        QueryStage::FullComplete => Vec::new(),
    }
}

/// Notification announcing that `node` reached its current stage.
pub fn stage_notification(stage: QueryStage) -> Option<NotificationType> {
    match stage {
        QueryStage::ProtocolInfoKnown => Some(NotificationType::NodeProtocolInfo),
        QueryStage::NamingKnown => Some(NotificationType::NodeNaming),
        QueryStage::EssentialComplete => Some(NotificationType::EssentialNodeQueriesComplete),
        QueryStage::FullComplete => Some(NotificationType::NodeQueriesComplete),
        QueryStage::Discovered | QueryStage::CommandClassesKnown => None,
    }
}

/// Tracks the driver-wide aggregate notifications, each sent at most once.
#[derive(Debug, Default)]
pub struct QueryMachine {
    awake_reported: bool,
    all_reported: bool,
}

impl QueryMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregate notifications due for the registry's current state.
    ///
    /// `AwakeNodesQueried` fires when every node is finished or asleep with
    /// at least one sleeper still pending. Once every node is finished,
    /// exactly one of `AllNodesQueried` / `AllNodesQueriedSomeDead` fires.
    pub fn check(&mut self, registry: &NodeRegistry) -> Vec<NotificationType> {
        let mut due = Vec::new();
        if self.all_reported || registry.is_empty() {
            return due;
        }

        let all_settled = registry.iter().all(Node::is_settled);
        if !self.awake_reported && !all_settled {
            let awake_done = registry
                .iter()
                .all(|node| node.is_settled() || node.liveness == Liveness::Asleep);
            if awake_done {
                info!("All awake nodes queried");
                self.awake_reported = true;
                due.push(NotificationType::AwakeNodesQueried);
            }
        }

        if all_settled {
            self.all_reported = true;
            let dead = registry
                .iter()
                .filter(|node| node.liveness == Liveness::Dead)
                .count();
            if dead > 0 {
                info!(dead, "All nodes queried, some dead");
                due.push(NotificationType::AllNodesQueriedSomeDead);
            } else {
                info!("All nodes queried");
                due.push(NotificationType::AllNodesQueried);
            }
        }
        due
    }

    pub fn is_finished(&self) -> bool {
        self.all_reported
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;

    fn complete(node_id: u8) -> Node {
        let mut node = Node::new(node_id);
        node.stage = QueryStage::FullComplete;
        node
    }

    fn registry(nodes: Vec<Node>) -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        for node in nodes {
            registry.add(node).unwrap();
        }
        registry
    }

    #[test]
    fn test_stage_requests() {
        let mut node = Node::new(4);
        assert_eq!(stage_requests(&node)[0].function, FUNC_ID_ZW_GET_NODE_PROTOCOL_INFO);

        node.stage = QueryStage::CommandClassesKnown;
        node.command_classes = vec![COMMAND_CLASS_VERSION, COMMAND_CLASS_WAKE_UP, COMMAND_CLASS_BATTERY, 0x98];
        assert_eq!(stage_requests(&node).len(), 2);

        node.stage = QueryStage::EssentialComplete;
        let dynamic = stage_requests(&node);
        assert_eq!(dynamic.len(), 1);
        assert_eq!(dynamic[0].command_data(), Some(&[COMMAND_CLASS_BATTERY, 0x02][..]));

        node.stage = QueryStage::FullComplete;
        assert!(stage_requests(&node).is_empty());
    }

    #[test]
    fn test_all_nodes_queried_once() {
        let mut machine = QueryMachine::new();
        let registry = registry(vec![complete(1), complete(2)]);
        assert_eq!(machine.check(&registry), vec![NotificationType::AllNodesQueried]);
        assert!(machine.check(&registry).is_empty());
    }

    #[test]
    fn test_some_dead_excludes_all_queried() {
        let mut machine = QueryMachine::new();
        let mut dead = Node::new(3);
        dead.failed_query_cycles = 2;
        dead.transition(Liveness::Dead);
        let registry = registry(vec![complete(1), dead]);
        assert_eq!(
            machine.check(&registry),
            vec![NotificationType::AllNodesQueriedSomeDead]
        );
        assert!(machine.check(&registry).is_empty());
    }

    #[test]
    fn test_awake_nodes_then_all() {
        let mut machine = QueryMachine::new();
        let mut sleeper = Node::new(5);
        sleeper.stage = QueryStage::ProtocolInfoKnown;
        sleeper.transition(Liveness::Asleep);
        let mut net = registry(vec![complete(1), sleeper]);

        assert_eq!(machine.check(&net), vec![NotificationType::AwakeNodesQueried]);
        assert!(machine.check(&net).is_empty());

        net.get_mut(5).unwrap().stage = QueryStage::FullComplete;
        assert_eq!(machine.check(&net), vec![NotificationType::AllNodesQueried]);
    }

    #[test]
    fn test_pending_awake_node_blocks() {
        let mut machine = QueryMachine::new();
        let net = registry(vec![complete(1), Node::new(2)]);
        assert!(machine.check(&net).is_empty());
    }
}
