//! ManufacturerSpecific (0x72) and the built-in manufacturer name table.

use byteorder::{BigEndian, ByteOrder};

use super::{CommandClass, CommandEvent, get};
use crate::protocol::Message;
use crate::protocol::constants::COMMAND_CLASS_MANUFACTURER_SPECIFIC;

const GET: u8 = 0x04;
const REPORT: u8 = 0x05;

/// Manufacturer ids known without an external device database.
pub const MANUFACTURERS: &[(u16, &str)] = &[
    (0x0000, "Sigma Designs"),
    (0x0060, "Everspring"),
    (0x0063, "GE (Jasco Products)"),
    (0x0086, "Aeotec"),
    (0x0109, "Vision Security"),
    (0x010F, "Fibargroup"),
    (0x0115, "Z-Wave.Me"),
    (0x014F, "Nortek Security & Control"),
    (0x0154, "Popp & Co"),
    (0x0159, "Qubino"),
];

pub fn manufacturer_name(id: u16) -> Option<&'static str> {
    MANUFACTURERS
        .binary_search_by_key(&id, |(known, _)| *known)
        .ok()
        .map(|i| MANUFACTURERS[i].1)
}

/// Product name when no database entry exists.
pub fn product_name(product_type: u16, product_id: u16) -> String {
    format!("Unknown: type={:04X}, id={:04X}", product_type, product_id)
}

pub struct ManufacturerSpecific;

impl ManufacturerSpecific {
    pub fn request(node_id: u8) -> Message {
        get(node_id, COMMAND_CLASS_MANUFACTURER_SPECIFIC, GET)
    }
}

impl CommandClass for ManufacturerSpecific {
    fn id(&self) -> u8 {
        COMMAND_CLASS_MANUFACTURER_SPECIFIC
    }

    fn name(&self) -> &'static str {
        "ManufacturerSpecific"
    }

    fn decode(&self, _node_id: u8, data: &[u8]) -> Vec<CommandEvent> {
        match data {
            [REPORT, ids @ ..] if ids.len() >= 6 => vec![CommandEvent::Naming {
                manufacturer_id: BigEndian::read_u16(&ids[0..2]),
                product_type: BigEndian::read_u16(&ids[2..4]),
                product_id: BigEndian::read_u16(&ids[4..6]),
            }],
            _ => Vec::new(),
        }
    }
}
