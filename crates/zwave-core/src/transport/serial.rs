//! Serial-port transport (USB CDC sticks and UART controllers).

use std::io::{ErrorKind, Read, Write};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, info, instrument, warn};

use super::traits::{ControllerInterface, ControllerTransport, TransportError};

/// Serial API controllers always run at 115200 8N1.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Serial-port transport.
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    read_timeout: Duration,
    port: Mutex<Option<Box<dyn SerialPort>>>,
}

impl SerialTransport {
    /// Open `port_name` (e.g. `/dev/ttyACM0`, `COM3`).
    #[instrument(level = "info")]
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let port = open_port(port_name, baud_rate, read_timeout)?;
        info!(port = %port_name, baud_rate, "Serial controller opened");
        Ok(Self {
            port_name: port_name.to_string(),
            baud_rate,
            read_timeout,
            port: Mutex::new(Some(port)),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn port(&self) -> MutexGuard<'_, Option<Box<dyn SerialPort>>> {
        self.port
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn open_port(
    port_name: &str,
    baud_rate: u32,
    read_timeout: Duration,
) -> Result<Box<dyn SerialPort>, TransportError> {
    serialport::new(port_name, baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(read_timeout)
        .open()
        .map_err(|e| match e.kind() {
            serialport::ErrorKind::NoDevice => TransportError::DeviceNotFound(port_name.to_string()),
            _ => TransportError::OpenFailed {
                port: port_name.to_string(),
                message: e.to_string(),
            },
        })
}

impl ControllerTransport for SerialTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut guard = self.port();
        let port = guard.as_mut().ok_or(TransportError::Disconnected)?;
        port.write_all(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        port.flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut guard = self.port();
        let port = guard.as_mut().ok_or(TransportError::Disconnected)?;
        let mut buf = vec![0u8; max_len];
        match port.read(&mut buf) {
            Ok(0) => Err(TransportError::Disconnected),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => Err(TransportError::Timeout {
                timeout_ms: self.read_timeout.as_millis() as u64,
            }),
            Err(e) => Err(TransportError::ReadFailed(e.to_string())),
        }
    }

    fn is_connected(&self) -> bool {
        self.port().is_some()
    }

    fn interface(&self) -> ControllerInterface {
        ControllerInterface::Serial
    }

    fn reopen(&self) -> Result<(), TransportError> {
        let mut guard = self.port();
        guard.take();
        match open_port(&self.port_name, self.baud_rate, self.read_timeout) {
            Ok(port) => {
                *guard = Some(port);
                info!(port = %self.port_name, "Serial controller reopened");
                Ok(())
            }
            Err(e) => {
                warn!(port = %self.port_name, error = %e, "Reopen failed");
                Err(e)
            }
        }
    }

    fn close(&self) {
        if self.port().take().is_some() {
            info!(port = %self.port_name, "Serial controller closed");
        }
    }
}
