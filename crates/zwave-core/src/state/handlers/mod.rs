//! Frame handlers - dispatch logic for each serial API function.
//!
//! This module is split into submodules by functionality:
//! - `controller`: controller handshake responses (version, Home ID, init data, protocol info)
//! - `application`: application commands sent by nodes
//! - `update`: application updates (node information frames)

mod application;
mod controller;
mod update;

use tracing::trace;

use crate::bus::NotificationBus;
use crate::dispatcher::InFlightInfo;
use crate::node::Liveness;
use crate::notification::{Notification, NotificationCode, NotificationType};
use crate::protocol::Frame;
use crate::protocol::constants::*;
use crate::registry::NodeRegistry;
use crate::value::{StoreUpdate, Value, ValueId, ValuePayload, ValueStore};

pub use controller::ControllerInfo;

use application::handle_application_command;
use controller::{
    handle_capabilities, handle_init_data, handle_memory_get_id, handle_protocol_info,
    handle_version,
};
use update::handle_application_update;

/// What the driver must do after a frame was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleResult {
    /// Nothing beyond what the handler already did.
    Continue,
    /// Controller reported its Home ID.
    HomeId(u32),
    /// Controller reported the nodes it knows.
    NodeList(Vec<u8>),
    /// Protocol info stored for a node.
    ProtocolInfo(u8),
    /// The controller knows nothing about the node being queried.
    QueryFailed(u8),
    /// Node sent WakeUp Notification.
    WakeUp(u8),
    /// Node was factory reset and left the network.
    NodeReset(u8),
    /// Controller assigned a new node id.
    NodeJoined(u8),
    /// Controller removed a node.
    NodeLeft(u8),
}

/// Frame handler context containing all resources.
pub struct HandlerContext<'a> {
    pub bus: &'a NotificationBus,
    pub controller: &'a mut ControllerInfo,
    pub registry: &'a mut NodeRegistry,
    pub values: &'a mut ValueStore,
    /// Transaction the frame may answer; responses carry no node id.
    pub in_flight: Option<InFlightInfo>,
}

impl HandlerContext<'_> {
    pub(crate) fn emit(&self, notification: Notification) {
        self.bus.publish(&notification);
    }

    pub(crate) fn notify(&self, kind: NotificationType, node_id: u8) {
        self.emit(Notification::new(kind, self.controller.home_id, node_id));
    }

    pub(crate) fn notify_code(&self, code: NotificationCode, node_id: u8) {
        self.emit(Notification::with_code(code, self.controller.home_id, node_id));
    }

    pub(crate) fn notify_value(&self, kind: NotificationType, value_id: ValueId) {
        self.emit(Notification::for_value(kind, self.controller.home_id, value_id));
    }

    /// Node the in-flight transaction talks to.
    pub(crate) fn in_flight_target(&self, function: u8) -> Option<u8> {
        self.in_flight
            .filter(|info| info.function == function)
            .and_then(|info| info.target)
    }

    /// Store a value unless it exists, announcing it.
    pub(crate) fn add_value(&mut self, value: Value) {
        let id = value.id;
        if self.values.add(value).is_ok() {
            self.notify_value(NotificationType::ValueAdded, id);
        }
    }

    /// Apply a reported payload, announcing the change or refresh.
    pub(crate) fn report_value(&mut self, id: ValueId, payload: ValuePayload) {
        match self.values.apply_report(&id, payload) {
            Some(StoreUpdate::Changed) => self.notify_value(NotificationType::ValueChanged, id),
            Some(StoreUpdate::Refreshed) => {
                self.notify_value(NotificationType::ValueRefreshed, id)
            }
            None => trace!(value = %id, "Report for unknown value ignored"),
        }
    }

    /// A node proved it is reachable. Dead nodes come back to life.
    pub(crate) fn heard_from(&mut self, node_id: u8) {
        let Some(node) = self.registry.get_mut(node_id) else {
            return;
        };
        node.failed_transmissions = 0;
        match node.liveness {
            Liveness::Dead => {
                if node.transition(Liveness::Alive) {
                    node.failed_query_cycles = 0;
                    self.notify_code(NotificationCode::Alive, node_id);
                }
            }
            Liveness::Unknown if !node.is_sleeping_device() => {
                node.transition(Liveness::Alive);
            }
            _ => {}
        }
    }
}

/// Handle a data frame from the controller.
pub fn handle_frame(frame: &Frame, ctx: &mut HandlerContext<'_>) -> HandleResult {
    match (frame.is_response(), frame.function) {
        (true, FUNC_ID_ZW_GET_VERSION) => handle_version(frame, ctx),
        (true, FUNC_ID_ZW_MEMORY_GET_ID) => handle_memory_get_id(frame, ctx),
        (true, FUNC_ID_SERIAL_API_GET_CAPABILITIES) => handle_capabilities(frame, ctx),
        (true, FUNC_ID_SERIAL_API_GET_INIT_DATA) => handle_init_data(frame, ctx),
        (true, FUNC_ID_ZW_GET_NODE_PROTOCOL_INFO) => handle_protocol_info(frame, ctx),
        (false, FUNC_ID_APPLICATION_COMMAND_HANDLER) => handle_application_command(frame, ctx),
        (false, FUNC_ID_ZW_APPLICATION_UPDATE) => handle_application_update(frame, ctx),
        _ => {
            // Send data responses and callbacks only matter to the dispatcher.
            trace!(function = format!("0x{:02X}", frame.function), "No handler for frame");
            HandleResult::Continue
        }
    }
}
