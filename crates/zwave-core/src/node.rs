//! Node model: protocol info, naming, interview stage and liveness.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::protocol::constants::*;

/// Interview progress, in the order the driver walks it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QueryStage {
    #[default]
    Discovered,
    ProtocolInfoKnown,
    NamingKnown,
    CommandClassesKnown,
    /// Static values known.
    EssentialComplete,
    /// Dynamic values known.
    FullComplete,
}

impl QueryStage {
    pub fn next(self) -> Self {
        match self {
            QueryStage::Discovered => QueryStage::ProtocolInfoKnown,
            QueryStage::ProtocolInfoKnown => QueryStage::NamingKnown,
            QueryStage::NamingKnown => QueryStage::CommandClassesKnown,
            QueryStage::CommandClassesKnown => QueryStage::EssentialComplete,
            QueryStage::EssentialComplete | QueryStage::FullComplete => QueryStage::FullComplete,
        }
    }
}

impl fmt::Display for QueryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Whether the node is reachable right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Liveness {
    #[default]
    Unknown,
    Awake,
    Asleep,
    Dead,
    Alive,
}

impl Liveness {
    /// Allowed liveness moves. `Unknown -> Dead` needs at least one failed
    /// query cycle; a dead node only comes back through `Alive`.
    pub fn can_transition(self, to: Liveness, failed_query_cycles: u32) -> bool {
        use Liveness::*;
        match (self, to) {
            (Unknown, Alive | Awake | Asleep) => true,
            (Unknown, Dead) => failed_query_cycles > 0,
            (Alive, Dead | Awake | Asleep) => true,
            (Awake, Asleep | Dead) => true,
            (Asleep, Awake | Dead) => true,
            (Dead, Alive) => true,
            _ => false,
        }
    }

    pub fn is_reachable(self) -> bool {
        !matches!(self, Liveness::Asleep | Liveness::Dead)
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Parsed GetNodeProtocolInfo response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub listening: bool,
    pub frequent_listening: bool,
    pub routing: bool,
    pub max_baud_rate: u32,
    pub version: u8,
    pub basic: u8,
    pub generic: u8,
    pub specific: u8,
}

impl ProtocolInfo {
    /// `[capability, security, reserved, basic, generic, specific]`.
    ///
    /// A zero basic type means the controller knows no such node.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let &[capability, security, reserved, basic, generic, specific, ..] = bytes else {
            return None;
        };
        if basic == 0 {
            return None;
        }
        let max_baud_rate = if reserved & 0x01 != 0 {
            100_000
        } else {
            match (capability & NODE_CAPABILITY_BAUD_MASK) >> 3 {
                0x02 => 40_000,
                _ => 9_600,
            }
        };
        Some(Self {
            listening: capability & NODE_CAPABILITY_LISTENING != 0,
            frequent_listening: security & NODE_SECURITY_FREQUENT_LISTENING != 0,
            routing: capability & NODE_CAPABILITY_ROUTING != 0,
            max_baud_rate,
            version: (capability & 0x07) + 1,
            basic,
            generic,
            specific,
        })
    }
}

/// A device on the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: u8,
    pub listening: bool,
    pub frequent_listening: bool,
    pub routing: bool,
    pub max_baud_rate: u32,
    pub version: u8,
    pub basic: u8,
    pub generic: u8,
    pub specific: u8,
    pub manufacturer_id: Option<u16>,
    pub product_type: Option<u16>,
    pub product_id: Option<u16>,
    pub manufacturer_name: String,
    pub product_name: String,
    pub command_classes: Vec<u8>,
    pub stage: QueryStage,
    #[serde(skip)]
    pub liveness: Liveness,
    #[serde(skip)]
    pub failed_query_cycles: u32,
    /// Consecutive transactions to this node dropped for lack of an answer.
    #[serde(skip)]
    pub failed_transmissions: u32,
    /// Stage whose requests are currently queued.
    #[serde(skip)]
    pub(crate) issued: Option<QueryStage>,
}

impl Node {
    pub fn new(node_id: u8) -> Self {
        Self {
            node_id,
            listening: true,
            frequent_listening: false,
            routing: false,
            max_baud_rate: 0,
            version: 0,
            basic: 0,
            generic: 0,
            specific: 0,
            manufacturer_id: None,
            product_type: None,
            product_id: None,
            manufacturer_name: String::new(),
            product_name: String::new(),
            command_classes: Vec::new(),
            stage: QueryStage::Discovered,
            liveness: Liveness::Unknown,
            failed_query_cycles: 0,
            failed_transmissions: 0,
            issued: None,
        }
    }

    pub fn apply_protocol_info(&mut self, info: &ProtocolInfo) {
        self.listening = info.listening;
        self.frequent_listening = info.frequent_listening;
        self.routing = info.routing;
        self.max_baud_rate = info.max_baud_rate;
        self.version = info.version;
        self.basic = info.basic;
        self.generic = info.generic;
        self.specific = info.specific;
    }

    /// Battery device that only hears traffic after a wake-up.
    pub fn is_sleeping_device(&self) -> bool {
        !self.listening && !self.frequent_listening
    }

    pub fn is_controller(&self) -> bool {
        matches!(self.basic, BASIC_TYPE_CONTROLLER | BASIC_TYPE_STATIC_CONTROLLER)
    }

    pub fn supports(&self, command_class: u8) -> bool {
        self.command_classes.contains(&command_class)
    }

    pub fn is_complete(&self) -> bool {
        self.stage == QueryStage::FullComplete
    }

    /// Finished as far as the network sweep is concerned.
    pub fn is_settled(&self) -> bool {
        self.is_complete() || self.liveness == Liveness::Dead
    }

    /// Advance the interview stage.
    pub fn goto_stage(&mut self, stage: QueryStage) {
        info!(node = self.node_id, from = %self.stage, to = %stage, "Query stage");
        self.stage = stage;
        self.issued = None;
    }

    /// Move to `to` if the transition is allowed. Returns true on change.
    pub fn transition(&mut self, to: Liveness) -> bool {
        if self.liveness == to {
            return false;
        }
        if !self.liveness.can_transition(to, self.failed_query_cycles) {
            warn!(node = self.node_id, from = %self.liveness, to = %to, "Rejected liveness transition");
            return false;
        }
        debug!(node = self.node_id, from = %self.liveness, to = %to, "Liveness");
        self.liveness = to;
        true
    }

    /// Display name built from the naming stage.
    pub fn display_name(&self) -> String {
        match (self.manufacturer_name.is_empty(), self.product_name.is_empty()) {
            (true, true) => format!("Node {}", self.node_id),
            (false, true) => self.manufacturer_name.clone(),
            (true, false) => self.product_name.clone(),
            (false, false) => format!("{} {}", self.manufacturer_name, self.product_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_info_parse() {
        let info = ProtocolInfo::from_bytes(&[0xD3, 0x9C, 0x01, 0x04, 0x10, 0x01]).unwrap();
        assert!(info.listening);
        assert!(info.routing);
        assert_eq!(info.max_baud_rate, 100_000);
        assert_eq!(info.version, 4);
        assert_eq!(info.generic, 0x10);

        let sensor = ProtocolInfo::from_bytes(&[0x10, 0x00, 0x00, 0x03, 0x21, 0x01]).unwrap();
        assert!(!sensor.listening);
        assert_eq!(sensor.max_baud_rate, 40_000);

        assert_eq!(ProtocolInfo::from_bytes(&[0; 6]), None);
        assert_eq!(ProtocolInfo::from_bytes(&[0xD3, 0x9C]), None);
    }

    #[test]
    fn test_liveness_table() {
        use Liveness::*;
        assert!(Awake.can_transition(Asleep, 0));
        assert!(Asleep.can_transition(Awake, 0));
        assert!(Dead.can_transition(Alive, 0));
        assert!(!Dead.can_transition(Awake, 3));
        assert!(!Asleep.can_transition(Alive, 0));
        assert!(!Unknown.can_transition(Dead, 0));
        assert!(Unknown.can_transition(Dead, 1));
    }

    #[test]
    fn test_transition_guards_dead() {
        let mut node = Node::new(7);
        assert!(!node.transition(Liveness::Dead));
        assert_eq!(node.liveness, Liveness::Unknown);
        node.failed_query_cycles = 1;
        assert!(node.transition(Liveness::Dead));
        assert!(!node.transition(Liveness::Dead));
        assert!(node.transition(Liveness::Alive));
    }

    #[test]
    fn test_stage_order() {
        let mut stage = QueryStage::Discovered;
        let mut walked = vec![stage];
        while stage != QueryStage::FullComplete {
            stage = stage.next();
            walked.push(stage);
        }
        assert_eq!(walked.len(), 6);
        assert!(walked.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_sleeping_device() {
        let mut node = Node::new(3);
        node.listening = false;
        assert!(node.is_sleeping_device());
        node.frequent_listening = true;
        assert!(!node.is_sleeping_device());
    }
}
