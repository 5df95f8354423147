//! NoOperation (0x00) and DeviceResetLocally (0x5A).

use super::{CommandClass, CommandEvent};
use crate::protocol::Message;
use crate::protocol::constants::{COMMAND_CLASS_DEVICE_RESET_LOCALLY, COMMAND_CLASS_NO_OPERATION};

const RESET_LOCALLY_NOTIFICATION: u8 = 0x01;

/// Empty frame used to test reachability.
pub struct NoOperation;

impl NoOperation {
    pub fn ping(node_id: u8) -> Message {
        let mut msg = Message::send_data(node_id, vec![COMMAND_CLASS_NO_OPERATION]);
        msg.label = "NoOperation".into();
        msg
    }
}

impl CommandClass for NoOperation {
    fn id(&self) -> u8 {
        COMMAND_CLASS_NO_OPERATION
    }

    fn name(&self) -> &'static str {
        "NoOperation"
    }

    fn decode(&self, _node_id: u8, _data: &[u8]) -> Vec<CommandEvent> {
        Vec::new()
    }
}

pub struct DeviceResetLocally;

impl CommandClass for DeviceResetLocally {
    fn id(&self) -> u8 {
        COMMAND_CLASS_DEVICE_RESET_LOCALLY
    }

    fn name(&self) -> &'static str {
        "DeviceResetLocally"
    }

    fn decode(&self, _node_id: u8, data: &[u8]) -> Vec<CommandEvent> {
        match data.first() {
            Some(&RESET_LOCALLY_NOTIFICATION) => vec![CommandEvent::ResetLocally],
            _ => Vec::new(),
        }
    }
}
