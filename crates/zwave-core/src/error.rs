//! Errors returned by the driver API.

use thiserror::Error;

use crate::cache::CacheError;
use crate::transport::TransportError;
use crate::value::{ValueError, ValueId, ValueType};

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Transport fault: {0}")]
    Transport(#[from] TransportError),

    #[error("Value {id} holds {expected}, got {actual}")]
    InvalidType {
        id: ValueId,
        expected: ValueType,
        actual: ValueType,
    },

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Value {0} is read-only")]
    ReadOnly(ValueId),

    #[error("Unknown value {0}")]
    UnknownValue(ValueId),

    #[error("Node {0} is unreachable")]
    NodeUnreachable(u8),

    #[error("Unknown node {0}")]
    UnknownNode(u8),

    #[error("Node {node} does not support command class 0x{command_class:02X}")]
    UnsupportedCommandClass { node: u8, command_class: u8 },

    #[error("Driver has failed")]
    Failed,

    #[error("Driver is shutting down")]
    ShuttingDown,

    #[error("Controller handshake not finished")]
    NotReady,

    #[error("A driver for {0} is already running")]
    DuplicateDriver(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

impl From<ValueError> for DriverError {
    fn from(err: ValueError) -> Self {
        match err {
            ValueError::InvalidType {
                id,
                expected,
                actual,
            } => DriverError::InvalidType {
                id,
                expected,
                actual,
            },
            ValueError::ReadOnly(id) => DriverError::ReadOnly(id),
            ValueError::UnknownValue(id) => DriverError::UnknownValue(id),
            other => DriverError::InvalidValue(other.to_string()),
        }
    }
}
