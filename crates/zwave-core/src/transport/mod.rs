//! Transport layer module.

pub mod mock;
pub mod serial;
pub mod sim;
pub mod traits;
pub mod usb;

pub use mock::MockTransport;
pub use serial::SerialTransport;
pub use sim::{SimNode, SimulatedController};
pub use traits::{ControllerInterface, ControllerTransport, TransportError};
pub use usb::UsbTransport;
