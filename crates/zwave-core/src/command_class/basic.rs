use super::{CommandClass, CommandEvent, get, value_id};
use crate::protocol::Message;
use crate::protocol::constants::COMMAND_CLASS_BASIC;
use crate::value::{Value, ValueGenre, ValuePayload, ValueType};

const SET: u8 = 0x01;
const GET: u8 = 0x02;
const REPORT: u8 = 0x03;

/// Basic (0x20). An unsolicited Set from a node is a node event.
pub struct Basic;

impl CommandClass for Basic {
    fn id(&self) -> u8 {
        COMMAND_CLASS_BASIC
    }

    fn name(&self) -> &'static str {
        "Basic"
    }

    fn create_values(&self, node_id: u8) -> Vec<Value> {
        vec![Value::new(
            value_id(node_id, COMMAND_CLASS_BASIC, 0),
            ValueGenre::Basic,
            ValueType::Byte,
            "Basic",
        )]
    }

    fn dynamic_requests(&self, node_id: u8) -> Vec<Message> {
        vec![get(node_id, COMMAND_CLASS_BASIC, GET)]
    }

    fn refresh_request(&self, node_id: u8, _index: u8) -> Option<Message> {
        Some(get(node_id, COMMAND_CLASS_BASIC, GET))
    }

    fn encode_set(&self, _value: &Value, payload: &ValuePayload, _controller_id: u8) -> Option<Vec<u8>> {
        match payload {
            ValuePayload::Byte(level) => Some(vec![COMMAND_CLASS_BASIC, SET, *level]),
            _ => None,
        }
    }

    fn decode(&self, _node_id: u8, data: &[u8]) -> Vec<CommandEvent> {
        match data {
            [REPORT, level, ..] => vec![CommandEvent::Value {
                index: 0,
                payload: ValuePayload::Byte(*level),
            }],
            [SET, level, ..] => vec![CommandEvent::NodeEvent(*level)],
            _ => Vec::new(),
        }
    }
}
