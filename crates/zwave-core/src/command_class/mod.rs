//! Command class catalog.
//!
//! Each supported command class is a stateless implementation of
//! [`CommandClass`]: it declares the values created when a node reports the
//! class, the requests issued during the interview, and how to encode writes
//! and decode reports. Classes without an implementation are still recorded
//! on the node, they just expose no values.

mod basic;
mod battery;
mod configuration;
mod device;
pub mod manufacturer_specific;
mod sensor_multilevel;
mod switch;
mod thermostat_mode;
mod version;
pub mod wake_up;

use crate::protocol::Message;
use crate::protocol::constants::*;
use crate::value::{Value, ValueId, ValuePayload};

pub use basic::Basic;
pub use battery::Battery;
pub use configuration::Configuration;
pub use device::{DeviceResetLocally, NoOperation};
pub use manufacturer_specific::ManufacturerSpecific;
pub use sensor_multilevel::SensorMultilevel;
pub use switch::{SwitchBinary, SwitchMultilevel};
pub use thermostat_mode::ThermostatMode;
pub use version::Version;
pub use wake_up::WakeUp;

/// Something a received command means for the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEvent {
    /// New payload for value `index` of this class (instance 1).
    Value { index: u8, payload: ValuePayload },
    /// Value created on first report, carrying its payload.
    NewValue(Value),
    /// ManufacturerSpecific report.
    Naming {
        manufacturer_id: u16,
        product_type: u16,
        product_id: u16,
    },
    WakeUpNotification,
    /// Unsolicited Basic Set from the node.
    NodeEvent(u8),
    ResetLocally,
}

/// Behavior of one command class.
pub trait CommandClass: Send + Sync {
    fn id(&self) -> u8;

    fn name(&self) -> &'static str;

    /// Values created when a node reports the class.
    fn create_values(&self, _node_id: u8) -> Vec<Value> {
        Vec::new()
    }

    /// Requests for values that never change (essential stage).
    fn static_requests(&self, _node_id: u8) -> Vec<Message> {
        Vec::new()
    }

    /// Requests for current state (full stage).
    fn dynamic_requests(&self, _node_id: u8) -> Vec<Message> {
        Vec::new()
    }

    /// Get for a single value.
    fn refresh_request(&self, _node_id: u8, _index: u8) -> Option<Message> {
        None
    }

    /// Command class payload writing `payload` to `value`.
    fn encode_set(&self, _value: &Value, _payload: &ValuePayload, _controller_id: u8) -> Option<Vec<u8>> {
        None
    }

    /// Interpret a command received from `node_id`. `data` starts with the
    /// command byte (the class byte is stripped).
    fn decode(&self, node_id: u8, data: &[u8]) -> Vec<CommandEvent>;
}

static NO_OPERATION: NoOperation = NoOperation;
static BASIC: Basic = Basic;
static SWITCH_BINARY: SwitchBinary = SwitchBinary;
static SWITCH_MULTILEVEL: SwitchMultilevel = SwitchMultilevel;
static SENSOR_MULTILEVEL: SensorMultilevel = SensorMultilevel;
static THERMOSTAT_MODE: ThermostatMode = ThermostatMode;
static DEVICE_RESET_LOCALLY: DeviceResetLocally = DeviceResetLocally;
static CONFIGURATION: Configuration = Configuration;
static MANUFACTURER_SPECIFIC: ManufacturerSpecific = ManufacturerSpecific;
static BATTERY: Battery = Battery;
static WAKE_UP: WakeUp = WakeUp;
static VERSION: Version = Version;

/// Implementation for a command class id, if the catalog has one.
pub fn lookup(id: u8) -> Option<&'static dyn CommandClass> {
    let cc: &'static dyn CommandClass = match id {
        COMMAND_CLASS_NO_OPERATION => &NO_OPERATION,
        COMMAND_CLASS_BASIC => &BASIC,
        COMMAND_CLASS_SWITCH_BINARY => &SWITCH_BINARY,
        COMMAND_CLASS_SWITCH_MULTILEVEL => &SWITCH_MULTILEVEL,
        COMMAND_CLASS_SENSOR_MULTILEVEL => &SENSOR_MULTILEVEL,
        COMMAND_CLASS_THERMOSTAT_MODE => &THERMOSTAT_MODE,
        COMMAND_CLASS_DEVICE_RESET_LOCALLY => &DEVICE_RESET_LOCALLY,
        COMMAND_CLASS_CONFIGURATION => &CONFIGURATION,
        COMMAND_CLASS_MANUFACTURER_SPECIFIC => &MANUFACTURER_SPECIFIC,
        COMMAND_CLASS_BATTERY => &BATTERY,
        COMMAND_CLASS_WAKE_UP => &WAKE_UP,
        COMMAND_CLASS_VERSION => &VERSION,
        _ => return None,
    };
    Some(cc)
}

/// Name for logs; unknown classes print their id.
pub fn name_of(id: u8) -> String {
    match lookup(id) {
        Some(cc) => cc.name().to_string(),
        None => format!("0x{:02X}", id),
    }
}

/// Value id of instance 1 of a class.
pub(crate) fn value_id(node_id: u8, command_class: u8, index: u8) -> ValueId {
    ValueId::new(node_id, command_class, 1, index)
}

/// Get command that waits for the class's report.
pub(crate) fn get(node_id: u8, command_class: u8, command: u8) -> Message {
    Message::send_data_with_report(node_id, vec![command_class, command], command_class)
}
