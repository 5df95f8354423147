use super::{CommandClass, CommandEvent, get, value_id};
use crate::protocol::Message;
use crate::protocol::constants::COMMAND_CLASS_THERMOSTAT_MODE;
use crate::value::{ListItem, Value, ValueGenre, ValueList, ValuePayload, ValueType};

const SET: u8 = 0x01;
const GET: u8 = 0x02;
const REPORT: u8 = 0x03;
const MODE_MASK: u8 = 0x1F;

const MODES: [&str; 14] = [
    "Off",
    "Heat",
    "Cool",
    "Auto",
    "Auxiliary Heat",
    "Resume",
    "Fan Only",
    "Furnace",
    "Dry Air",
    "Moist Air",
    "Auto Changeover",
    "Heat Econ",
    "Cool Econ",
    "Away",
];

/// ThermostatMode (0x40), exposed as a List value.
pub struct ThermostatMode;

impl CommandClass for ThermostatMode {
    fn id(&self) -> u8 {
        COMMAND_CLASS_THERMOSTAT_MODE
    }

    fn name(&self) -> &'static str {
        "ThermostatMode"
    }

    fn create_values(&self, node_id: u8) -> Vec<Value> {
        let items = MODES
            .iter()
            .enumerate()
            .map(|(value, label)| ListItem {
                label: label.to_string(),
                value: value as i32,
            })
            .collect();
        vec![
            Value::new(
                value_id(node_id, COMMAND_CLASS_THERMOSTAT_MODE, 0),
                ValueGenre::User,
                ValueType::List,
                "Mode",
            )
            .with_payload(ValuePayload::List(ValueList { items, selected: 0 })),
        ]
    }

    fn dynamic_requests(&self, node_id: u8) -> Vec<Message> {
        vec![get(node_id, COMMAND_CLASS_THERMOSTAT_MODE, GET)]
    }

    fn refresh_request(&self, node_id: u8, _index: u8) -> Option<Message> {
        Some(get(node_id, COMMAND_CLASS_THERMOSTAT_MODE, GET))
    }

    fn encode_set(&self, _value: &Value, payload: &ValuePayload, _controller_id: u8) -> Option<Vec<u8>> {
        match payload {
            ValuePayload::List(list) => {
                let mode = u8::try_from(list.selected).ok().filter(|m| *m <= MODE_MASK)?;
                Some(vec![COMMAND_CLASS_THERMOSTAT_MODE, SET, mode])
            }
            _ => None,
        }
    }

    fn decode(&self, _node_id: u8, data: &[u8]) -> Vec<CommandEvent> {
        match data {
            [REPORT, mode, ..] => vec![CommandEvent::Value {
                index: 0,
                payload: ValuePayload::List(ValueList {
                    items: Vec::new(),
                    selected: (mode & MODE_MASK) as i32,
                }),
            }],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_report() {
        let value = &ThermostatMode.create_values(4)[0];
        let heat = ValuePayload::List(ValueList { items: vec![], selected: 1 });
        assert!(value.validate(&heat).is_ok());
        assert_eq!(ThermostatMode.encode_set(value, &heat, 1), Some(vec![0x40, 0x01, 0x01]));

        let events = ThermostatMode.decode(4, &[REPORT, 0x03]);
        assert!(matches!(
            events.as_slice(),
            [CommandEvent::Value { payload: ValuePayload::List(ValueList { selected: 3, .. }), .. }]
        ));
    }
}
