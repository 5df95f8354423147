use super::{CommandClass, CommandEvent, get, value_id};
use crate::protocol::Message;
use crate::protocol::constants::COMMAND_CLASS_BATTERY;
use crate::value::{Value, ValueGenre, ValuePayload, ValueType};

const GET: u8 = 0x02;
const REPORT: u8 = 0x03;
/// Reported instead of a percentage when the battery is nearly flat.
const LOW_BATTERY: u8 = 0xFF;

pub struct Battery;

impl CommandClass for Battery {
    fn id(&self) -> u8 {
        COMMAND_CLASS_BATTERY
    }

    fn name(&self) -> &'static str {
        "Battery"
    }

    fn create_values(&self, node_id: u8) -> Vec<Value> {
        vec![
            Value::new(
                value_id(node_id, COMMAND_CLASS_BATTERY, 0),
                ValueGenre::User,
                ValueType::Byte,
                "Battery Level",
            )
            .with_units("%")
            .read_only(),
        ]
    }

    fn dynamic_requests(&self, node_id: u8) -> Vec<Message> {
        vec![get(node_id, COMMAND_CLASS_BATTERY, GET)]
    }

    fn refresh_request(&self, node_id: u8, _index: u8) -> Option<Message> {
        Some(get(node_id, COMMAND_CLASS_BATTERY, GET))
    }

    fn decode(&self, _node_id: u8, data: &[u8]) -> Vec<CommandEvent> {
        match data {
            [REPORT, level, ..] => {
                let level = if *level == LOW_BATTERY { 0 } else { (*level).min(100) };
                vec![CommandEvent::Value {
                    index: 0,
                    payload: ValuePayload::Byte(level),
                }]
            }
            _ => Vec::new(),
        }
    }
}
