use byteorder::{BigEndian, ByteOrder};

use super::{CommandClass, CommandEvent, get, value_id};
use crate::protocol::Message;
use crate::protocol::constants::COMMAND_CLASS_WAKE_UP;
use crate::value::{Value, ValueGenre, ValuePayload, ValueType};

const INTERVAL_SET: u8 = 0x04;
const INTERVAL_GET: u8 = 0x05;
const INTERVAL_REPORT: u8 = 0x06;
const NOTIFICATION: u8 = 0x07;
const NO_MORE_INFORMATION: u8 = 0x08;

/// Largest interval the 24-bit field holds.
const MAX_INTERVAL: i32 = 0x00FF_FFFF;

/// WakeUp (0x84).
pub struct WakeUp;

/// Tell a node it may go back to sleep.
pub fn no_more_information(node_id: u8) -> Message {
    let mut msg = Message::send_data(node_id, vec![COMMAND_CLASS_WAKE_UP, NO_MORE_INFORMATION]);
    msg.label = "WakeUpNoMoreInformation".into();
    msg
}

impl CommandClass for WakeUp {
    fn id(&self) -> u8 {
        COMMAND_CLASS_WAKE_UP
    }

    fn name(&self) -> &'static str {
        "WakeUp"
    }

    fn create_values(&self, node_id: u8) -> Vec<Value> {
        vec![
            Value::new(
                value_id(node_id, COMMAND_CLASS_WAKE_UP, 0),
                ValueGenre::System,
                ValueType::Int,
                "Wake-up Interval",
            )
            .with_units("seconds"),
        ]
    }

    fn static_requests(&self, node_id: u8) -> Vec<Message> {
        vec![get(node_id, COMMAND_CLASS_WAKE_UP, INTERVAL_GET)]
    }

    fn refresh_request(&self, node_id: u8, _index: u8) -> Option<Message> {
        Some(get(node_id, COMMAND_CLASS_WAKE_UP, INTERVAL_GET))
    }

    fn encode_set(&self, _value: &Value, payload: &ValuePayload, controller_id: u8) -> Option<Vec<u8>> {
        match payload {
            ValuePayload::Int(seconds) if (0..=MAX_INTERVAL).contains(seconds) => {
                let mut data = vec![COMMAND_CLASS_WAKE_UP, INTERVAL_SET, 0, 0, 0, controller_id];
                BigEndian::write_u24(&mut data[2..5], *seconds as u32);
                Some(data)
            }
            _ => None,
        }
    }

    fn decode(&self, _node_id: u8, data: &[u8]) -> Vec<CommandEvent> {
        match data {
            [INTERVAL_REPORT, interval @ ..] if interval.len() >= 3 => vec![CommandEvent::Value {
                index: 0,
                payload: ValuePayload::Int(BigEndian::read_u24(&interval[..3]) as i32),
            }],
            [NOTIFICATION, ..] => vec![CommandEvent::WakeUpNotification],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_round_trip() {
        let value = &WakeUp.create_values(3)[0];
        let data = WakeUp.encode_set(value, &ValuePayload::Int(3600), 1).unwrap();
        assert_eq!(data, vec![0x84, 0x04, 0x00, 0x0E, 0x10, 0x01]);
        assert_eq!(
            WakeUp.decode(3, &[INTERVAL_REPORT, 0x00, 0x0E, 0x10, 0x01]),
            vec![CommandEvent::Value { index: 0, payload: ValuePayload::Int(3600) }]
        );
        assert!(WakeUp.encode_set(value, &ValuePayload::Int(-1), 1).is_none());
    }

    #[test]
    fn test_notification() {
        assert_eq!(WakeUp.decode(3, &[NOTIFICATION]), vec![CommandEvent::WakeUpNotification]);
        assert_eq!(
            no_more_information(3).command_data(),
            Some(&[0x84, 0x08][..])
        );
    }
}
