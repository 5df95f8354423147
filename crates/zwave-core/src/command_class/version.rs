use super::{CommandClass, CommandEvent, get, value_id};
use crate::protocol::Message;
use crate::protocol::constants::COMMAND_CLASS_VERSION;
use crate::value::{Value, ValueGenre, ValuePayload, ValueType};

const GET: u8 = 0x11;
const REPORT: u8 = 0x12;

const INDEX_LIBRARY: u8 = 0;
const INDEX_PROTOCOL: u8 = 1;
const INDEX_APPLICATION: u8 = 2;

/// Version (0x86): library type and firmware versions as System strings.
pub struct Version;

fn version_value(node_id: u8, index: u8, label: &str) -> Value {
    Value::new(
        value_id(node_id, COMMAND_CLASS_VERSION, index),
        ValueGenre::System,
        ValueType::String,
        label,
    )
    .read_only()
}

impl CommandClass for Version {
    fn id(&self) -> u8 {
        COMMAND_CLASS_VERSION
    }

    fn name(&self) -> &'static str {
        "Version"
    }

    fn create_values(&self, node_id: u8) -> Vec<Value> {
        vec![
            version_value(node_id, INDEX_LIBRARY, "Library Version"),
            version_value(node_id, INDEX_PROTOCOL, "Protocol Version"),
            version_value(node_id, INDEX_APPLICATION, "Application Version"),
        ]
    }

    fn static_requests(&self, node_id: u8) -> Vec<Message> {
        vec![get(node_id, COMMAND_CLASS_VERSION, GET)]
    }

    fn refresh_request(&self, node_id: u8, _index: u8) -> Option<Message> {
        Some(get(node_id, COMMAND_CLASS_VERSION, GET))
    }

    fn decode(&self, _node_id: u8, data: &[u8]) -> Vec<CommandEvent> {
        let [REPORT, library, protocol, protocol_sub, application, application_sub, ..] = data
        else {
            return Vec::new();
        };
        let string = |s: String| ValuePayload::String(s);
        vec![
            CommandEvent::Value {
                index: INDEX_LIBRARY,
                payload: string(library.to_string()),
            },
            CommandEvent::Value {
                index: INDEX_PROTOCOL,
                payload: string(format!("{}.{:02}", protocol, protocol_sub)),
            },
            CommandEvent::Value {
                index: INDEX_APPLICATION,
                payload: string(format!("{}.{:02}", application, application_sub)),
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_versions() {
        let events = Version.decode(2, &[REPORT, 3, 4, 5, 1, 2]);
        assert_eq!(
            events,
            vec![
                CommandEvent::Value { index: 0, payload: ValuePayload::String("3".into()) },
                CommandEvent::Value { index: 1, payload: ValuePayload::String("4.05".into()) },
                CommandEvent::Value { index: 2, payload: ValuePayload::String("1.02".into()) },
            ]
        );
    }
}
