use byteorder::{BigEndian, ByteOrder};

use super::{CommandClass, CommandEvent, value_id};
use crate::protocol::Message;
use crate::protocol::constants::COMMAND_CLASS_CONFIGURATION;
use crate::value::{Value, ValueGenre, ValuePayload, ValueType};

const SET: u8 = 0x04;
const GET: u8 = 0x05;
const REPORT: u8 = 0x06;

/// Configuration (0x70). Parameters are not enumerable, so a Config value is
/// created the first time a parameter is reported, indexed by its number.
pub struct Configuration;

impl Configuration {
    pub fn get(node_id: u8, param: u8) -> Message {
        let mut msg = Message::send_data_with_report(
            node_id,
            vec![COMMAND_CLASS_CONFIGURATION, GET, param],
            COMMAND_CLASS_CONFIGURATION,
        );
        msg.label = format!("ConfigurationGet #{}", param);
        msg
    }

    /// Set command; `size` is 1, 2 or 4 bytes.
    pub fn set(node_id: u8, param: u8, value: i32, size: u8) -> Option<Message> {
        let data = encode(param, value, size)?;
        let mut msg = Message::send_data(node_id, data);
        msg.label = format!("ConfigurationSet #{}", param);
        Some(msg)
    }
}

fn encode(param: u8, value: i32, size: u8) -> Option<Vec<u8>> {
    let fits = match size {
        1 => i8::try_from(value).is_ok(),
        2 => i16::try_from(value).is_ok(),
        4 => true,
        _ => false,
    };
    if !fits {
        return None;
    }
    let mut data = vec![COMMAND_CLASS_CONFIGURATION, SET, param, size];
    let mut bytes = [0u8; 4];
    BigEndian::write_i32(&mut bytes, value);
    data.extend_from_slice(&bytes[4 - size as usize..]);
    Some(data)
}

/// Narrowest parameter size holding `value`.
fn size_for(value: i32) -> u8 {
    if i8::try_from(value).is_ok() {
        1
    } else if i16::try_from(value).is_ok() {
        2
    } else {
        4
    }
}

fn param_value(node_id: u8, param: u8) -> Value {
    Value::new(
        value_id(node_id, COMMAND_CLASS_CONFIGURATION, param),
        ValueGenre::Config,
        ValueType::Int,
        &format!("Parameter #{}", param),
    )
}

impl CommandClass for Configuration {
    fn id(&self) -> u8 {
        COMMAND_CLASS_CONFIGURATION
    }

    fn name(&self) -> &'static str {
        "Configuration"
    }

    fn refresh_request(&self, node_id: u8, index: u8) -> Option<Message> {
        Some(Self::get(node_id, index))
    }

    fn encode_set(&self, value: &Value, payload: &ValuePayload, _controller_id: u8) -> Option<Vec<u8>> {
        match payload {
            ValuePayload::Int(v) => encode(value.id.index, *v, value.size().unwrap_or_else(|| size_for(*v))),
            _ => None,
        }
    }

    fn decode(&self, node_id: u8, data: &[u8]) -> Vec<CommandEvent> {
        let [REPORT, param, size_byte, rest @ ..] = data else {
            return Vec::new();
        };
        let size = (size_byte & 0x07) as usize;
        if !matches!(size, 1 | 2 | 4) || rest.len() < size {
            return Vec::new();
        }
        let raw = BigEndian::read_int(&rest[..size], size) as i32;
        vec![CommandEvent::NewValue(
            param_value(node_id, *param)
                .with_size(size as u8)
                .with_payload(ValuePayload::Int(raw)),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_encoding() {
        let msg = Configuration::set(2, 7, 300, 2).unwrap();
        assert_eq!(msg.command_data(), Some(&[0x70, 0x04, 7, 2, 0x01, 0x2C][..]));
        assert!(Configuration::set(2, 7, 300, 1).is_none());
        assert!(Configuration::set(2, 7, 1, 3).is_none());
    }

    #[test]
    fn test_report_creates_config_value() {
        let events = Configuration.decode(2, &[REPORT, 7, 2, 0xFF, 0xFE]);
        let [CommandEvent::NewValue(value)] = events.as_slice() else {
            panic!("unexpected {:?}", events);
        };
        assert_eq!(value.id.index, 7);
        assert_eq!(value.genre, ValueGenre::Config);
        assert_eq!(value.payload(), &ValuePayload::Int(-2));
    }

    #[test]
    fn test_encode_set_keeps_reported_size() {
        let events = Configuration.decode(2, &[REPORT, 5, 2, 0x01, 0x2C]);
        let [CommandEvent::NewValue(value)] = events.as_slice() else {
            panic!("unexpected {:?}", events);
        };
        assert_eq!(value.size(), Some(2));
        assert_eq!(
            Configuration.encode_set(value, &ValuePayload::Int(5), 1),
            Some(vec![0x70, 0x04, 5, 2, 0x00, 0x05])
        );
        // Does not fit the reported width.
        assert_eq!(Configuration.encode_set(value, &ValuePayload::Int(70_000), 1), None);
    }

    #[test]
    fn test_encode_set_uses_narrowest_size() {
        let value = param_value(2, 3);
        assert_eq!(
            Configuration.encode_set(&value, &ValuePayload::Int(5), 1),
            Some(vec![0x70, 0x04, 3, 1, 5])
        );
        assert_eq!(
            Configuration.encode_set(&value, &ValuePayload::Int(70_000), 1).map(|d| d[3]),
            Some(4)
        );
    }
}
