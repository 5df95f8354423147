//! Protocol constants for the Z-Wave serial API.
//!
//! This is the internal constant table the rest of the crate matches on.
//! Bump [`PROTOCOL_TABLE_VERSION`] whenever an entry changes meaning.

/// Version of this constant table, independent of any binding layer.
pub const PROTOCOL_TABLE_VERSION: u16 = 0x0104;

// ============================================================================
// Frame Markers
// ============================================================================

/// Start of frame.
pub const SOF: u8 = 0x01;
/// Acknowledge.
pub const ACK: u8 = 0x06;
/// Negative acknowledge (checksum failure on the far side).
pub const NAK: u8 = 0x15;
/// Cancel (frame collision, retransmit).
pub const CAN: u8 = 0x18;

/// Frame type: host or controller request.
pub const REQUEST: u8 = 0x00;
/// Frame type: response to a request.
pub const RESPONSE: u8 = 0x01;

/// Largest value accepted in the length byte.
///
/// The length covers type, function, payload and checksum.
pub const MAX_FRAME_LENGTH: u8 = 0x80;

/// Smallest legal length byte (type + function + checksum).
pub const MIN_FRAME_LENGTH: u8 = 0x03;

/// Initial value of the XOR checksum.
pub const CHECKSUM_SEED: u8 = 0xFF;

// ============================================================================
// Serial API Function IDs
// ============================================================================

pub const FUNC_ID_SERIAL_API_GET_INIT_DATA: u8 = 0x02;
pub const FUNC_ID_APPLICATION_COMMAND_HANDLER: u8 = 0x04;
pub const FUNC_ID_SERIAL_API_GET_CAPABILITIES: u8 = 0x07;
pub const FUNC_ID_ZW_SEND_DATA: u8 = 0x13;
pub const FUNC_ID_ZW_GET_VERSION: u8 = 0x15;
pub const FUNC_ID_ZW_MEMORY_GET_ID: u8 = 0x20;
pub const FUNC_ID_ZW_GET_NODE_PROTOCOL_INFO: u8 = 0x41;
pub const FUNC_ID_ZW_APPLICATION_UPDATE: u8 = 0x49;
pub const FUNC_ID_ZW_REQUEST_NODE_INFO: u8 = 0x60;

// ============================================================================
// Application Update States
// ============================================================================

/// Node information frame received.
pub const UPDATE_STATE_NODE_INFO_RECEIVED: u8 = 0x84;
/// Node information request failed (node did not answer).
pub const UPDATE_STATE_NODE_INFO_REQ_FAILED: u8 = 0x81;
/// Node was removed from the network.
pub const UPDATE_STATE_DELETE_DONE: u8 = 0x20;
/// Node was added to the network.
pub const UPDATE_STATE_NEW_ID_ASSIGNED: u8 = 0x40;

// ============================================================================
// Transmit
// ============================================================================

pub const TRANSMIT_OPTION_ACK: u8 = 0x01;
pub const TRANSMIT_OPTION_AUTO_ROUTE: u8 = 0x04;
pub const TRANSMIT_OPTION_EXPLORE: u8 = 0x20;
/// Options used for every SendData.
pub const TRANSMIT_OPTIONS: u8 =
    TRANSMIT_OPTION_ACK | TRANSMIT_OPTION_AUTO_ROUTE | TRANSMIT_OPTION_EXPLORE;

pub const TRANSMIT_COMPLETE_OK: u8 = 0x00;
pub const TRANSMIT_COMPLETE_NO_ACK: u8 = 0x01;
pub const TRANSMIT_COMPLETE_FAIL: u8 = 0x02;

// ============================================================================
// Node Protocol Info
// ============================================================================

pub const NODE_CAPABILITY_LISTENING: u8 = 0x80;
pub const NODE_CAPABILITY_ROUTING: u8 = 0x40;
pub const NODE_CAPABILITY_BAUD_MASK: u8 = 0x38;
pub const NODE_SECURITY_FREQUENT_LISTENING: u8 = 0x60;

/// Bytes in the node bitmask returned by GetInitData (232 nodes).
pub const NODE_BITMASK_LEN: usize = 29;
/// Highest valid node id.
pub const MAX_NODE_ID: u8 = 232;

// ============================================================================
// Command Classes
// ============================================================================

pub const COMMAND_CLASS_NO_OPERATION: u8 = 0x00;
pub const COMMAND_CLASS_BASIC: u8 = 0x20;
pub const COMMAND_CLASS_SWITCH_BINARY: u8 = 0x25;
pub const COMMAND_CLASS_SWITCH_MULTILEVEL: u8 = 0x26;
pub const COMMAND_CLASS_SENSOR_MULTILEVEL: u8 = 0x31;
pub const COMMAND_CLASS_THERMOSTAT_MODE: u8 = 0x40;
pub const COMMAND_CLASS_DEVICE_RESET_LOCALLY: u8 = 0x5A;
pub const COMMAND_CLASS_CONFIGURATION: u8 = 0x70;
pub const COMMAND_CLASS_MANUFACTURER_SPECIFIC: u8 = 0x72;
pub const COMMAND_CLASS_BATTERY: u8 = 0x80;
pub const COMMAND_CLASS_WAKE_UP: u8 = 0x84;
pub const COMMAND_CLASS_VERSION: u8 = 0x86;

/// Marks the end of the supported list in a node information frame.
pub const COMMAND_CLASS_MARK: u8 = 0xEF;

// ============================================================================
// Basic Device Classes
// ============================================================================

pub const BASIC_TYPE_CONTROLLER: u8 = 0x01;
pub const BASIC_TYPE_STATIC_CONTROLLER: u8 = 0x02;
pub const BASIC_TYPE_SLAVE: u8 = 0x03;
pub const BASIC_TYPE_ROUTING_SLAVE: u8 = 0x04;
