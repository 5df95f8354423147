//! Controller transport abstraction.
//!
//! Defines the `ControllerTransport` trait for the byte-level link to the
//! local Z-Wave controller, allowing different implementations (serial,
//! USB, mock, simulated).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open {port}: {message}")]
    OpenFailed { port: String, message: String },

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Controller disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// A read that simply found no data. Not a fault.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

/// How the host talks to its local controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerInterface {
    #[default]
    Unknown,
    Serial,
    Hid,
}

impl fmt::Display for ControllerInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerInterface::Unknown => write!(f, "Unknown"),
            ControllerInterface::Serial => write!(f, "Serial"),
            ControllerInterface::Hid => write!(f, "HID"),
        }
    }
}

/// Duplex byte channel to a controller interface.
///
/// Reads block for at most the transport's read timeout and report an
/// empty link as [`TransportError::Timeout`]. Writes hand the bytes to the
/// device's send buffer and return.
pub trait ControllerTransport: Send + Sync {
    /// Write raw bytes.
    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read whatever is available, up to `max_len` bytes.
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Check if the controller is still attached.
    fn is_connected(&self) -> bool;

    /// Kind of interface behind this transport.
    fn interface(&self) -> ControllerInterface;

    /// Re-establish the link after a fault.
    fn reopen(&self) -> Result<(), TransportError> {
        Err(TransportError::Disconnected)
    }

    /// Release the underlying device.
    fn close(&self) {}
}

impl<T: ControllerTransport + ?Sized> ControllerTransport for Box<T> {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        (**self).write(data)
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        (**self).read(max_len)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn interface(&self) -> ControllerInterface {
        (**self).interface()
    }

    fn reopen(&self) -> Result<(), TransportError> {
        (**self).reopen()
    }

    fn close(&self) {
        (**self).close()
    }
}
