//! SwitchBinary (0x25) and SwitchMultilevel (0x26).

use super::{CommandClass, CommandEvent, get, value_id};
use crate::protocol::Message;
use crate::protocol::constants::{COMMAND_CLASS_SWITCH_BINARY, COMMAND_CLASS_SWITCH_MULTILEVEL};
use crate::value::{Value, ValueGenre, ValuePayload, ValueType};

const SET: u8 = 0x01;
const GET: u8 = 0x02;
const REPORT: u8 = 0x03;

/// Highest dimmer level; 0xFF restores the last level.
const MAX_LEVEL: u8 = 99;
const LAST_LEVEL: u8 = 0xFF;

pub struct SwitchBinary;

impl CommandClass for SwitchBinary {
    fn id(&self) -> u8 {
        COMMAND_CLASS_SWITCH_BINARY
    }

    fn name(&self) -> &'static str {
        "SwitchBinary"
    }

    fn create_values(&self, node_id: u8) -> Vec<Value> {
        vec![Value::new(
            value_id(node_id, COMMAND_CLASS_SWITCH_BINARY, 0),
            ValueGenre::User,
            ValueType::Bool,
            "Switch",
        )]
    }

    fn dynamic_requests(&self, node_id: u8) -> Vec<Message> {
        vec![get(node_id, COMMAND_CLASS_SWITCH_BINARY, GET)]
    }

    fn refresh_request(&self, node_id: u8, _index: u8) -> Option<Message> {
        Some(get(node_id, COMMAND_CLASS_SWITCH_BINARY, GET))
    }

    fn encode_set(&self, _value: &Value, payload: &ValuePayload, _controller_id: u8) -> Option<Vec<u8>> {
        match payload {
            ValuePayload::Bool(on) => Some(vec![
                COMMAND_CLASS_SWITCH_BINARY,
                SET,
                if *on { 0xFF } else { 0x00 },
            ]),
            _ => None,
        }
    }

    fn decode(&self, _node_id: u8, data: &[u8]) -> Vec<CommandEvent> {
        match data {
            [REPORT, state, ..] => vec![CommandEvent::Value {
                index: 0,
                payload: ValuePayload::Bool(*state != 0),
            }],
            _ => Vec::new(),
        }
    }
}

pub struct SwitchMultilevel;

impl CommandClass for SwitchMultilevel {
    fn id(&self) -> u8 {
        COMMAND_CLASS_SWITCH_MULTILEVEL
    }

    fn name(&self) -> &'static str {
        "SwitchMultilevel"
    }

    fn create_values(&self, node_id: u8) -> Vec<Value> {
        vec![Value::new(
            value_id(node_id, COMMAND_CLASS_SWITCH_MULTILEVEL, 0),
            ValueGenre::User,
            ValueType::Byte,
            "Level",
        )]
    }

    fn dynamic_requests(&self, node_id: u8) -> Vec<Message> {
        vec![get(node_id, COMMAND_CLASS_SWITCH_MULTILEVEL, GET)]
    }

    fn refresh_request(&self, node_id: u8, _index: u8) -> Option<Message> {
        Some(get(node_id, COMMAND_CLASS_SWITCH_MULTILEVEL, GET))
    }

    fn encode_set(&self, _value: &Value, payload: &ValuePayload, _controller_id: u8) -> Option<Vec<u8>> {
        match payload {
            ValuePayload::Byte(level) if *level <= MAX_LEVEL || *level == LAST_LEVEL => {
                Some(vec![COMMAND_CLASS_SWITCH_MULTILEVEL, SET, *level])
            }
            _ => None,
        }
    }

    fn decode(&self, _node_id: u8, data: &[u8]) -> Vec<CommandEvent> {
        match data {
            [REPORT, level, ..] => vec![CommandEvent::Value {
                index: 0,
                payload: ValuePayload::Byte(*level),
            }],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_encode_decode() {
        let value = &SwitchBinary.create_values(2)[0];
        assert_eq!(
            SwitchBinary.encode_set(value, &ValuePayload::Bool(true), 1),
            Some(vec![0x25, 0x01, 0xFF])
        );
        assert_eq!(
            SwitchBinary.decode(2, &[REPORT, 0x00]),
            vec![CommandEvent::Value { index: 0, payload: ValuePayload::Bool(false) }]
        );
    }

    #[test]
    fn test_multilevel_rejects_out_of_range() {
        let value = &SwitchMultilevel.create_values(2)[0];
        assert!(SwitchMultilevel.encode_set(value, &ValuePayload::Byte(50), 1).is_some());
        assert!(SwitchMultilevel.encode_set(value, &ValuePayload::Byte(0xFF), 1).is_some());
        assert!(SwitchMultilevel.encode_set(value, &ValuePayload::Byte(100), 1).is_none());
    }
}
