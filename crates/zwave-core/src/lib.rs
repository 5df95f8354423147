//! Z-Wave core: serial API driver for a local Z-Wave controller.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Serial API constants, frame codec, outgoing messages
//! - **Transport**: Byte link to the controller (serial, raw USB, mock, simulator)
//! - **Dispatcher**: Single in-flight transaction, priority queues, retries, sleep holds
//! - **Command classes**: Value catalog, interview requests, report decoding
//! - **State**: Frame handlers and the node interview machine
//! - **Value / Registry**: Typed value store and node registry
//! - **Notifications**: Ordered fan-out to watchers
//! - **Driver**: Orchestrator for one controller, plus a threaded handle
//! - **Manager**: All drivers of the process, keyed by port
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use zwave_core::{Driver, DriverConfig, Notification};
//!
//! let driver = Driver::open(DriverConfig::new("/dev/ttyACM0")).expect("open controller");
//! driver.add_watcher(Arc::new(|n: &Notification| println!("{}", n)));
//! let (handle, thread) = driver.spawn().expect("start driver");
//! // ... use `handle` from any thread ...
//! handle.shutdown();
//! let report = thread.join().expect("driver thread");
//! println!("{} commands completed", report.completed.len());
//! ```

pub mod bus;
pub mod cache;
pub mod command_class;
pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod handle;
pub mod manager;
pub mod node;
pub mod notification;
pub mod protocol;
pub mod registry;
pub mod state;
pub mod transport;
pub mod value;

// Re-exports for convenience
pub use bus::{NotificationBus, WatcherHandle};
pub use cache::{NetworkSnapshot, NodeCache, NullCache, TomlFileCache};
pub use config::{ConfigError, DriverConfig, OptionType};
pub use dispatcher::{Priority, RetryPolicy, TransactionId};
pub use driver::{Driver, DriverState, ShutdownReport};
pub use error::DriverError;
pub use handle::{DriverHandle, DriverStatus};
pub use manager::{Manager, ManagerWatcherId};
pub use node::{Liveness, Node, QueryStage};
pub use notification::{
    LogLevel, Notification, NotificationCode, NotificationPayload, NotificationType,
    TracingWatcher, Watcher,
};
pub use protocol::{Frame, FrameDecoder, Message};
pub use transport::{
    ControllerInterface, ControllerTransport, MockTransport, SerialTransport, SimNode,
    SimulatedController, TransportError, UsbTransport,
};
pub use value::{Value, ValueGenre, ValueId, ValuePayload, ValueType};
