//! nusb-based transport for USB controllers that expose raw endpoints
//! instead of a CDC serial port (`ControllerInterface::Hid`).

use std::io::{ErrorKind, Read, Write};
use std::sync::{Mutex, MutexGuard};

use nusb::transfer::{Bulk, In, Out};
use nusb::{Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument};

use super::traits::{ControllerInterface, ControllerTransport, TransportError};

struct UsbLink {
    interface: Interface,
    in_endpoint: u8,
    out_endpoint: u8,
}

/// USB transport.
pub struct UsbTransport {
    vid: u16,
    pid: u16,
    link: Mutex<Option<UsbLink>>,
}

impl UsbTransport {
    /// Open the first device with the given VID/PID.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open_with_ids(vid: u16, pid: u16) -> Result<Self, TransportError> {
        let link = open_link(vid, pid)?;
        Ok(Self {
            vid,
            pid,
            link: Mutex::new(Some(link)),
        })
    }

    /// Parse a `VID:PID` hex pair such as `1D6B:0104`.
    pub fn parse_ids(ids: &str) -> Option<(u16, u16)> {
        let (vid, pid) = ids.split_once(':')?;
        Some((
            u16::from_str_radix(vid.trim(), 16).ok()?,
            u16::from_str_radix(pid.trim(), 16).ok()?,
        ))
    }

    pub fn vendor_id(&self) -> u16 {
        self.vid
    }

    pub fn product_id(&self) -> u16 {
        self.pid
    }

    fn link(&self) -> MutexGuard<'_, Option<UsbLink>> {
        self.link
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn open_link(vid: u16, pid: u16) -> Result<UsbLink, TransportError> {
    let device_info = list_devices()
        .wait()
        .map_err(|e| TransportError::OpenFailed {
            port: format!("{:04X}:{:04X}", vid, pid),
            message: e.to_string(),
        })?
        .find(|d| d.vendor_id() == vid && d.product_id() == pid)
        .ok_or_else(|| TransportError::DeviceNotFound(format!("{:04X}:{:04X}", vid, pid)))?;

    info!(
        vendor_id = %format!("{:04X}", vid),
        product_id = %format!("{:04X}", pid),
        "Found controller"
    );

    let device = device_info
        .open()
        .wait()
        .map_err(|e| TransportError::OpenFailed {
            port: format!("{:04X}:{:04X}", vid, pid),
            message: e.to_string(),
        })?;

    let interface =
        device
            .claim_interface(0)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: 0,
                message: e.to_string(),
            })?;

    let mut in_endpoint: u8 = 0;
    let mut out_endpoint: u8 = 0;

    for config in device.configurations() {
        for iface in config.interfaces() {
            if iface.interface_number() != 0 {
                continue;
            }
            for alt in iface.alt_settings() {
                for ep in alt.endpoints() {
                    if ep.transfer_type() == nusb::descriptors::TransferType::Bulk {
                        if ep.direction() == nusb::transfer::Direction::In {
                            in_endpoint = ep.address();
                        } else {
                            out_endpoint = ep.address();
                        }
                    }
                }
            }
        }
    }

    if in_endpoint == 0 {
        return Err(TransportError::EndpointNotFound {
            ep_type: "Bulk".into(),
            direction: "In".into(),
        });
    }
    if out_endpoint == 0 {
        return Err(TransportError::EndpointNotFound {
            ep_type: "Bulk".into(),
            direction: "Out".into(),
        });
    }

    info!(
        in_ep = %format!("0x{:02X}", in_endpoint),
        out_ep = %format!("0x{:02X}", out_endpoint),
        "Controller opened"
    );

    Ok(UsbLink {
        interface,
        in_endpoint,
        out_endpoint,
    })
}

impl ControllerTransport for UsbTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let guard = self.link();
        let link = guard.as_ref().ok_or(TransportError::Disconnected)?;
        let ep = link
            .interface
            .endpoint::<Bulk, Out>(link.out_endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut writer = ep.writer(256);
        writer
            .write_all(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let guard = self.link();
        let link = guard.as_ref().ok_or(TransportError::Disconnected)?;
        let ep = link
            .interface
            .endpoint::<Bulk, In>(link.in_endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        let mut reader = ep.reader(256);
        let mut buf = vec![0u8; max_len];
        let n = reader.read(&mut buf).map_err(|e| match e.kind() {
            ErrorKind::TimedOut => TransportError::Timeout { timeout_ms: 0 },
            _ => TransportError::ReadFailed(e.to_string()),
        })?;

        buf.truncate(n);
        Ok(buf)
    }

    fn is_connected(&self) -> bool {
        self.link().is_some()
    }

    fn interface(&self) -> ControllerInterface {
        ControllerInterface::Hid
    }

    fn reopen(&self) -> Result<(), TransportError> {
        let mut guard = self.link();
        guard.take();
        *guard = Some(open_link(self.vid, self.pid)?);
        Ok(())
    }

    fn close(&self) {
        self.link().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ids() {
        assert_eq!(UsbTransport::parse_ids("1D6B:0104"), Some((0x1D6B, 0x0104)));
        assert_eq!(UsbTransport::parse_ids("zz:0104"), None);
        assert_eq!(UsbTransport::parse_ids("1D6B"), None);
    }
}
