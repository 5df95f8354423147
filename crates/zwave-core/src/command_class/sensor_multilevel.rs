use byteorder::{BigEndian, ByteOrder};

use super::{CommandClass, CommandEvent, get, value_id};
use crate::protocol::Message;
use crate::protocol::constants::COMMAND_CLASS_SENSOR_MULTILEVEL;
use crate::value::{Value, ValueGenre, ValuePayload, ValueType};

const GET: u8 = 0x04;
const REPORT: u8 = 0x05;

const TYPE_TEMPERATURE: u8 = 0x01;
const TYPE_LUMINANCE: u8 = 0x03;
const TYPE_POWER: u8 = 0x04;
const TYPE_HUMIDITY: u8 = 0x05;

/// SensorMultilevel (0x31). One read-only Decimal value per sensor type,
/// indexed by the type byte; types other than temperature appear on their
/// first report.
pub struct SensorMultilevel;

fn label(sensor_type: u8) -> &'static str {
    match sensor_type {
        TYPE_TEMPERATURE => "Temperature",
        TYPE_LUMINANCE => "Luminance",
        TYPE_POWER => "Power",
        TYPE_HUMIDITY => "Relative Humidity",
        _ => "Sensor",
    }
}

fn units(sensor_type: u8, scale: u8) -> &'static str {
    match (sensor_type, scale) {
        (TYPE_TEMPERATURE, 0) => "C",
        (TYPE_TEMPERATURE, _) => "F",
        (TYPE_LUMINANCE, 0) | (TYPE_HUMIDITY, 0) => "%",
        (TYPE_LUMINANCE, _) => "lux",
        (TYPE_POWER, 0) => "W",
        (TYPE_POWER, _) => "Btu/h",
        _ => "",
    }
}

/// Render a fixed-point reading without going through floating point.
pub(crate) fn format_decimal(raw: i64, precision: u8) -> String {
    if precision == 0 {
        return raw.to_string();
    }
    let digits = raw.unsigned_abs().to_string();
    let precision = precision as usize;
    let padded = format!("{:0>width$}", digits, width = precision + 1);
    let (int_part, frac_part) = padded.split_at(padded.len() - precision);
    let sign = if raw < 0 { "-" } else { "" };
    format!("{}{}.{}", sign, int_part, frac_part)
}

fn sensor_value(node_id: u8, sensor_type: u8, scale: u8) -> Value {
    Value::new(
        value_id(node_id, COMMAND_CLASS_SENSOR_MULTILEVEL, sensor_type),
        ValueGenre::User,
        ValueType::Decimal,
        label(sensor_type),
    )
    .with_units(units(sensor_type, scale))
    .read_only()
}

impl CommandClass for SensorMultilevel {
    fn id(&self) -> u8 {
        COMMAND_CLASS_SENSOR_MULTILEVEL
    }

    fn name(&self) -> &'static str {
        "SensorMultilevel"
    }

    fn create_values(&self, node_id: u8) -> Vec<Value> {
        vec![sensor_value(node_id, TYPE_TEMPERATURE, 0)]
    }

    fn dynamic_requests(&self, node_id: u8) -> Vec<Message> {
        vec![get(node_id, COMMAND_CLASS_SENSOR_MULTILEVEL, GET)]
    }

    fn refresh_request(&self, node_id: u8, _index: u8) -> Option<Message> {
        Some(get(node_id, COMMAND_CLASS_SENSOR_MULTILEVEL, GET))
    }

    fn decode(&self, node_id: u8, data: &[u8]) -> Vec<CommandEvent> {
        let [REPORT, sensor_type, pss, rest @ ..] = data else {
            return Vec::new();
        };
        let precision = pss >> 5;
        let scale = (pss >> 3) & 0x03;
        let size = (pss & 0x07) as usize;
        if !matches!(size, 1 | 2 | 4) || rest.len() < size {
            return Vec::new();
        }
        let raw = BigEndian::read_int(&rest[..size], size);
        let payload = ValuePayload::Decimal(format_decimal(raw, precision));
        vec![CommandEvent::NewValue(
            sensor_value(node_id, *sensor_type, scale).with_payload(payload),
        )]
    }
}
