//! Driver - orchestrates one controller interface.
//!
//! The driver owns the transport, the frame decoder, the dispatcher and the
//! network model. Everything happens on the thread that calls
//! [`Driver::poll`]; [`Driver::spawn`](crate::handle) moves a driver onto its
//! own thread and hands out a cloneable handle instead.

use std::collections::BTreeSet;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, trace, warn};

use crate::bus::{NotificationBus, WatcherHandle};
use crate::cache::{NetworkSnapshot, NodeCache, NodeSnapshot};
use crate::command_class::{self, Configuration, NoOperation, wake_up};
use crate::config::DriverConfig;
use crate::dispatcher::{
    DispatchEvent, Dispatcher, FailReason, InFlightInfo, Origin, Priority, Transaction,
    TransactionId,
};
use crate::error::DriverError;
use crate::node::{Liveness, Node, QueryStage};
use crate::notification::{
    Notification, NotificationCode, NotificationPayload, NotificationType, Watcher,
};
use crate::protocol::constants::*;
use crate::protocol::frame::hex_dump;
use crate::protocol::{ControlByte, DecodeEvent, FrameDecoder, Message};
use crate::registry::NodeRegistry;
use crate::state::{
    ControllerInfo, HandleResult, HandlerContext, QueryMachine, handle_frame, stage_notification,
    stage_requests,
};
use crate::transport::{ControllerTransport, TransportError};
use crate::value::{StoreUpdate, Value, ValueId, ValuePayload, ValueStore, ValueType};

/// Bytes asked for per transport read.
const READ_CHUNK: usize = 256;
/// Reads per poll before other work gets a turn.
const MAX_READS_PER_POLL: usize = 64;

/// Lifecycle of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Created,
    /// Controller handshake in progress.
    Initializing,
    /// Node list known; interviews running or done.
    Ready,
    ShuttingDown,
    /// Transport lost for good.
    Failed,
    Removed,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Fate of every externally submitted transaction, reported at shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub completed: Vec<TransactionId>,
    pub timed_out: Vec<TransactionId>,
    pub cancelled: Vec<TransactionId>,
}

/// Z-Wave driver for one controller.
pub struct Driver<T: ControllerTransport = Box<dyn ControllerTransport>> {
    config: DriverConfig,
    transport: T,
    decoder: FrameDecoder,
    dispatcher: Dispatcher,
    registry: NodeRegistry,
    values: ValueStore,
    bus: NotificationBus,
    queries: QueryMachine,
    cache: Box<dyn NodeCache>,
    restored: Option<NetworkSnapshot>,
    controller: ControllerInfo,
    state: DriverState,
    polled: BTreeSet<ValueId>,
    last_poll: Option<Instant>,
    /// Sleeping devices to send back to sleep once their traffic drains.
    wake_flush: BTreeSet<u8>,
    report: ShutdownReport,
}

impl Driver {
    /// Open the transport named by `config`.
    pub fn open(config: DriverConfig) -> Result<Self, DriverError> {
        let transport = config.open_transport()?;
        Ok(Self::new(config, transport))
    }
}

impl<T: ControllerTransport> Driver<T> {
    pub fn new(config: DriverConfig, transport: T) -> Self {
        let cache = config.node_cache();
        let dispatcher = Dispatcher::new(config.retry_policy());
        Self {
            config,
            transport,
            decoder: FrameDecoder::new(),
            dispatcher,
            registry: NodeRegistry::new(),
            values: ValueStore::new(),
            bus: NotificationBus::new(),
            queries: QueryMachine::new(),
            cache,
            restored: None,
            controller: ControllerInfo::default(),
            state: DriverState::Created,
            polled: BTreeSet::new(),
            last_poll: None,
            wake_flush: BTreeSet::new(),
            report: ShutdownReport::default(),
        }
    }

    /// Replace the cache backend chosen from the config.
    pub fn with_cache(mut self, cache: Box<dyn NodeCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub fn add_watcher(&self, watcher: std::sync::Arc<dyn Watcher>) -> WatcherHandle {
        self.bus.add_watcher(watcher)
    }

    pub fn remove_watcher(&self, handle: WatcherHandle) -> bool {
        self.bus.remove_watcher(handle)
    }

    /// Home ID reported by the controller, 0 until known.
    pub fn home_id(&self) -> u32 {
        self.controller.home_id
    }

    pub fn controller_info(&self) -> &ControllerInfo {
        &self.controller
    }

    pub fn node_ids(&self) -> Vec<u8> {
        self.registry.ids()
    }

    pub fn node_info(&self, node_id: u8) -> Option<Node> {
        self.registry.get(node_id).cloned()
    }

    pub fn node_values(&self, node_id: u8) -> Vec<Value> {
        self.values.node_values(node_id).cloned().collect()
    }

    pub fn is_polled(&self, id: &ValueId) -> bool {
        self.polled.contains(id)
    }

    /// No transaction in flight or waiting to be sent (held ones aside).
    pub fn is_idle(&self) -> bool {
        self.dispatcher.is_idle()
    }

    /// Network-wide interview sweep finished.
    pub fn all_queried(&self) -> bool {
        self.queries.is_finished()
    }

    // ---- Lifecycle ----

    /// Start the controller handshake.
    #[instrument(skip(self), fields(port = %self.config.port))]
    pub fn initialize(&mut self) -> Result<(), DriverError> {
        match self.state {
            DriverState::Created => {}
            DriverState::Failed => return Err(DriverError::Failed),
            DriverState::ShuttingDown | DriverState::Removed => {
                return Err(DriverError::ShuttingDown);
            }
            DriverState::Initializing | DriverState::Ready => return Ok(()),
        }

        if !self.transport.is_connected() {
            self.recover_transport(TransportError::Disconnected)?;
        }
        info!(interface = %self.transport.interface(), "Initializing driver");
        self.state = DriverState::Initializing;

        // Stale bytes in the controller's buffer are dropped on NAK.
        self.write(&[NAK])?;
        self.notify(NotificationType::ManufacturerSpecificDBReady, 0);

        for message in [
            Message::get_version(),
            Message::memory_get_id(),
            Message::get_capabilities(),
            Message::get_init_data(),
        ] {
            self.dispatcher
                .enqueue(message, Priority::Controller, Origin::Init);
        }
        Ok(())
    }

    /// Run one pass of I/O and bookkeeping. Returns true if anything happened.
    pub fn poll(&mut self) -> Result<bool, DriverError> {
        match self.state {
            DriverState::Failed => return Err(DriverError::Failed),
            DriverState::Removed => return Err(DriverError::ShuttingDown),
            _ => {}
        }

        let mut active = self.read_input()?;
        active |= self.process_input()?;

        let now = Instant::now();
        self.dispatcher.check_timeouts(now);
        active |= self.process_dispatch_events();

        if self.state == DriverState::Ready {
            active |= self.advance_queries();
            self.check_aggregates();
            active |= self.schedule_polls(now);
            active |= self.flush_wake_ups();
        }

        active |= self.send_next()?;
        Ok(active)
    }

    /// Poll until `done` holds or `timeout` passes. Returns whether `done` held.
    pub fn run_until<F>(&mut self, timeout: Duration, mut done: F) -> Result<bool, DriverError>
    where
        F: FnMut(&Self) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if done(self) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            if !self.poll()? {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    /// Finish the in-flight transaction, cancel the rest, save the cache and
    /// release the transport.
    #[instrument(skip(self))]
    pub fn shutdown(&mut self) -> ShutdownReport {
        if self.state == DriverState::Removed {
            return self.report.clone();
        }

        if self.state != DriverState::Failed {
            self.state = DriverState::ShuttingDown;
            let cancelled = self.dispatcher.cancel_all();
            self.record_cancelled(&cancelled);

            let deadline = Instant::now() + self.dispatcher.policy().worst_case();
            while self.dispatcher.has_in_flight() && Instant::now() < deadline {
                match self.poll() {
                    Ok(true) => {}
                    Ok(false) => thread::sleep(Duration::from_millis(1)),
                    Err(e) => {
                        warn!(error = %e, "Poll failed during shutdown");
                        break;
                    }
                }
            }
        }
        if let Some(tx) = self.dispatcher.abort_in_flight() {
            self.record_cancelled(std::slice::from_ref(&tx));
        }

        self.save_cache();
        self.notify(NotificationType::DriverRemoved, self.controller.node_id);
        self.transport.close();
        self.state = DriverState::Removed;

        info!(
            completed = self.report.completed.len(),
            timed_out = self.report.timed_out.len(),
            cancelled = self.report.cancelled.len(),
            "Driver removed"
        );
        self.report.clone()
    }

    // ---- External operations ----

    /// Send a raw command class payload to a node.
    pub fn submit_command(
        &mut self,
        node_id: u8,
        command_class: u8,
        payload: &[u8],
    ) -> Result<TransactionId, DriverError> {
        self.ensure_ready()?;
        self.ensure_reachable(node_id)?;
        let mut data = vec![command_class];
        data.extend_from_slice(payload);
        Ok(self
            .dispatcher
            .enqueue(Message::send_data(node_id, data), Priority::Node, Origin::Command))
    }

    pub fn get_value(&self, id: &ValueId) -> Result<Value, DriverError> {
        self.values
            .get(id)
            .cloned()
            .ok_or(DriverError::UnknownValue(*id))
    }

    /// Write a value. The store keeps the old payload until the device
    /// confirms the new one.
    pub fn set_value(
        &mut self,
        id: &ValueId,
        payload: ValuePayload,
    ) -> Result<TransactionId, DriverError> {
        self.ensure_ready()?;
        let value = self.values.validate_set(id, &payload)?;
        self.ensure_reachable(id.node_id)?;
        let cc = command_class::lookup(id.command_class).ok_or(
            DriverError::UnsupportedCommandClass {
                node: id.node_id,
                command_class: id.command_class,
            },
        )?;
        let data = cc
            .encode_set(value, &payload, self.controller.node_id)
            .ok_or_else(|| DriverError::InvalidValue(format!("{} cannot be set to {}", id, payload)))?;
        let confirm_locally = value.write_only || value.value_type() == ValueType::Button;

        let tx = self.dispatcher.enqueue(
            Message::send_data(id.node_id, data),
            Priority::Node,
            Origin::SetValue(*id),
        );
        self.values.mark_pending(id, payload);
        if !confirm_locally && let Some(get) = cc.refresh_request(id.node_id, id.index) {
            self.dispatcher
                .enqueue(get, Priority::Node, Origin::Refresh(*id));
        }
        debug!(tx, value = %id, "Set value");
        Ok(tx)
    }

    /// Ask the node for the current payload of a value.
    pub fn refresh_value(&mut self, id: &ValueId) -> Result<TransactionId, DriverError> {
        self.ensure_ready()?;
        if !self.values.contains(id) {
            return Err(DriverError::UnknownValue(*id));
        }
        self.ensure_reachable(id.node_id)?;
        let get = command_class::lookup(id.command_class)
            .and_then(|cc| cc.refresh_request(id.node_id, id.index))
            .ok_or(DriverError::UnsupportedCommandClass {
                node: id.node_id,
                command_class: id.command_class,
            })?;
        Ok(self.dispatcher.enqueue(get, Priority::Node, Origin::Command))
    }

    /// Refresh `id` every poll interval.
    pub fn enable_poll(&mut self, id: &ValueId) -> Result<(), DriverError> {
        if !self.values.contains(id) {
            return Err(DriverError::UnknownValue(*id));
        }
        if command_class::lookup(id.command_class)
            .and_then(|cc| cc.refresh_request(id.node_id, id.index))
            .is_none()
        {
            return Err(DriverError::UnsupportedCommandClass {
                node: id.node_id,
                command_class: id.command_class,
            });
        }
        if self.polled.insert(*id) {
            info!(value = %id, "Polling enabled");
            self.notify_value(NotificationType::PollingEnabled, *id);
        }
        Ok(())
    }

    /// Returns false if the value was not polled.
    pub fn disable_poll(&mut self, id: &ValueId) -> bool {
        let removed = self.polled.remove(id);
        if removed {
            info!(value = %id, "Polling disabled");
            self.notify_value(NotificationType::PollingDisabled, *id);
        }
        removed
    }

    /// Read a configuration parameter; the report creates or updates its value.
    pub fn request_config_param(&mut self, node_id: u8, param: u8) -> Result<TransactionId, DriverError> {
        self.ensure_ready()?;
        self.ensure_reachable(node_id)?;
        Ok(self.dispatcher.enqueue(
            Configuration::get(node_id, param),
            Priority::Node,
            Origin::Command,
        ))
    }

    /// Write a configuration parameter of `size` bytes, then read it back.
    pub fn set_config_param(
        &mut self,
        node_id: u8,
        param: u8,
        value: i32,
        size: u8,
    ) -> Result<TransactionId, DriverError> {
        self.ensure_ready()?;
        self.ensure_reachable(node_id)?;
        let set = Configuration::set(node_id, param, value, size).ok_or_else(|| {
            DriverError::InvalidValue(format!("{} does not fit in {} byte(s)", value, size))
        })?;
        let tx = self.dispatcher.enqueue(set, Priority::Node, Origin::Command);
        let id = command_class::value_id(node_id, COMMAND_CLASS_CONFIGURATION, param);
        self.dispatcher.enqueue(
            Configuration::get(node_id, param),
            Priority::Node,
            Origin::Refresh(id),
        );
        Ok(tx)
    }

    /// Send a NoOperation frame. Works on dead nodes; success revives them.
    pub fn test_node(&mut self, node_id: u8) -> Result<TransactionId, DriverError> {
        self.ensure_ready()?;
        if !self.registry.contains(node_id) {
            return Err(DriverError::UnknownNode(node_id));
        }
        Ok(self
            .dispatcher
            .enqueue(NoOperation::ping(node_id), Priority::Node, Origin::TestNode))
    }

    /// Forget a node: its pending traffic is cancelled and its values removed.
    pub fn remove_node(&mut self, node_id: u8) -> Result<(), DriverError> {
        if !self.registry.contains(node_id) {
            return Err(DriverError::UnknownNode(node_id));
        }
        self.forget_node(node_id);
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), DriverError> {
        match self.state {
            DriverState::Ready => Ok(()),
            DriverState::Created | DriverState::Initializing => Err(DriverError::NotReady),
            DriverState::Failed => Err(DriverError::Failed),
            DriverState::ShuttingDown | DriverState::Removed => Err(DriverError::ShuttingDown),
        }
    }

    /// Sleeping nodes are fine: their traffic waits for the next wake-up.
    fn ensure_reachable(&self, node_id: u8) -> Result<(), DriverError> {
        match self.registry.get(node_id) {
            None => Err(DriverError::UnknownNode(node_id)),
            Some(node) if node.liveness == Liveness::Dead => Err(DriverError::NodeUnreachable(node_id)),
            Some(_) => Ok(()),
        }
    }

    // ---- Transport ----

    fn write(&mut self, bytes: &[u8]) -> Result<(), DriverError> {
        trace!(bytes = %hex_dump(bytes), "Tx");
        match self.transport.write(bytes) {
            Ok(_) => Ok(()),
            Err(e) => self.recover_transport(e),
        }
    }

    fn read_input(&mut self) -> Result<bool, DriverError> {
        let mut received = false;
        for _ in 0..MAX_READS_PER_POLL {
            match self.transport.read(READ_CHUNK) {
                Ok(bytes) if bytes.is_empty() => break,
                Ok(bytes) => {
                    trace!(bytes = %hex_dump(&bytes), "Rx");
                    self.decoder.push(&bytes);
                    received = true;
                }
                Err(e) if e.is_timeout() => break,
                Err(e) => {
                    self.recover_transport(e)?;
                    break;
                }
            }
        }
        if self.decoder.expire(Instant::now(), self.config.frame_timeout()) {
            warn!("Discarded incomplete frame");
        }
        Ok(received)
    }

    /// Reopen the link with backoff. On success the in-flight transaction is
    /// resent; on failure the driver fails for good.
    fn recover_transport(&mut self, err: TransportError) -> Result<(), DriverError> {
        warn!(error = %err, "Transport fault");
        let backoff = self.config.reconnect_backoff();
        for attempt in 0..self.config.reconnect_attempts {
            thread::sleep(backoff.delay(attempt));
            match self.transport.reopen() {
                Ok(()) => {
                    info!(attempt = attempt + 1, "Transport reopened");
                    self.decoder.clear();
                    self.dispatcher.restart_in_flight(Instant::now());
                    return Ok(());
                }
                Err(e) => warn!(attempt = attempt + 1, error = %e, "Reopen failed"),
            }
        }
        self.fail(&err.to_string());
        Err(DriverError::Transport(err))
    }

    fn fail(&mut self, reason: &str) {
        if self.state == DriverState::Failed {
            return;
        }
        error!(reason, "Driver failed");
        self.state = DriverState::Failed;
        let mut dropped = self.dispatcher.cancel_all();
        dropped.extend(self.dispatcher.abort_in_flight());
        self.record_cancelled(&dropped);
        self.emit(
            Notification::new(NotificationType::DriverFailed, self.controller.home_id, self.controller.node_id)
                .payload(NotificationPayload::Failure(reason.to_string())),
        );
    }

    fn send_next(&mut self) -> Result<bool, DriverError> {
        if self.state == DriverState::Failed {
            return Ok(false);
        }
        match self.dispatcher.poll_send(Instant::now()) {
            Some(bytes) => {
                self.write(&bytes)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ---- Inbound ----

    fn process_input(&mut self) -> Result<bool, DriverError> {
        let mut active = false;
        while let Some(event) = self.decoder.next_event() {
            active = true;
            match event {
                DecodeEvent::Control(control) => {
                    trace!(control = %control, "Control byte");
                    self.dispatcher.on_control(control, Instant::now());
                }
                DecodeEvent::ChecksumError => {
                    warn!("Checksum error, sending NAK");
                    self.write(&[ControlByte::Nak.as_byte()])?;
                }
                DecodeEvent::Frame(frame) => {
                    // Every frame is acknowledged before anything else is sent.
                    self.write(&[ControlByte::Ack.as_byte()])?;
                    debug!(frame = %frame, "Received");
                    let in_flight = self.dispatcher.in_flight_info();
                    let result = handle_frame(&frame, &mut self.handler_context(in_flight));
                    self.dispatcher.on_frame(&frame, Instant::now());
                    self.apply_result(result);
                }
            }
        }
        Ok(active)
    }

    fn handler_context(&mut self, in_flight: Option<InFlightInfo>) -> HandlerContext<'_> {
        HandlerContext {
            bus: &self.bus,
            controller: &mut self.controller,
            registry: &mut self.registry,
            values: &mut self.values,
            in_flight,
        }
    }

    fn apply_result(&mut self, result: HandleResult) {
        match result {
            HandleResult::Continue => {}
            HandleResult::HomeId(home_id) => self.on_home_id(home_id),
            HandleResult::NodeList(ids) => self.on_node_list(&ids),
            HandleResult::ProtocolInfo(node_id) => self.on_protocol_info(node_id),
            HandleResult::QueryFailed(node_id) => {
                if let Some(stage) = self.registry.get(node_id).map(|node| node.stage) {
                    self.query_failed(node_id, stage);
                }
            }
            HandleResult::WakeUp(node_id) => self.on_wake_up(node_id),
            HandleResult::NodeReset(node_id) => {
                self.notify(NotificationType::NodeReset, node_id);
                self.forget_node(node_id);
            }
            HandleResult::NodeJoined(node_id) => self.add_new_node(node_id),
            HandleResult::NodeLeft(node_id) => {
                if self.registry.contains(node_id) {
                    self.forget_node(node_id);
                }
            }
        }
    }

    fn on_home_id(&mut self, home_id: u32) {
        self.notify(NotificationType::DriverReady, self.controller.node_id);
        match self.cache.load(home_id) {
            Ok(Some(snapshot)) => {
                info!(nodes = snapshot.nodes.len(), "Restoring cached network");
                self.restored = Some(snapshot);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Cache not usable");
                self.emit(
                    Notification::new(NotificationType::UserAlerts, home_id, self.controller.node_id)
                        .payload(NotificationPayload::Alert(format!("Network cache ignored: {}", e))),
                );
            }
        }
    }

    fn on_node_list(&mut self, ids: &[u8]) {
        let restored = self.restored.take();
        for &node_id in ids {
            if self.registry.contains(node_id) {
                continue;
            }
            match restored.as_ref().and_then(|snapshot| snapshot.node(node_id)) {
                Some(snapshot) => self.restore_node(snapshot),
                None => self.add_new_node(node_id),
            }
        }
        info!(nodes = self.registry.len(), "Driver ready");
        self.state = DriverState::Ready;
    }

    fn add_new_node(&mut self, node_id: u8) {
        if self.registry.add(Node::new(node_id)).is_err() {
            return;
        }
        self.notify(NotificationType::NodeNew, node_id);
        self.notify(NotificationType::NodeAdded, node_id);
    }

    fn restore_node(&mut self, snapshot: &NodeSnapshot) {
        let mut node = snapshot.node.clone();
        let node_id = node.node_id;
        node.liveness = Liveness::Unknown;
        node.failed_query_cycles = 0;
        node.stage = node.stage.min(QueryStage::CommandClassesKnown);
        node.issued = None;
        let sleeping = node.is_sleeping_device();
        if self.registry.add(node).is_err() {
            return;
        }
        debug!(node = node_id, values = snapshot.values.len(), "Node restored from cache");
        self.notify(NotificationType::NodeAdded, node_id);
        for value in &snapshot.values {
            let id = value.id;
            if self.values.add(value.clone()).is_ok() {
                self.notify_value(NotificationType::ValueAdded, id);
            }
        }
        if sleeping {
            self.on_protocol_info(node_id);
        }
    }

    /// Sleeping devices are assumed asleep until they wake up.
    fn on_protocol_info(&mut self, node_id: u8) {
        let Some(node) = self.registry.get_mut(node_id) else {
            return;
        };
        if !node.is_sleeping_device() {
            return;
        }
        self.dispatcher.set_sleeping_device(node_id, true);
        if node.liveness == Liveness::Unknown && node.transition(Liveness::Asleep) {
            self.dispatcher.hold_node(node_id);
            self.notify_code(NotificationCode::Sleep, node_id);
        }
    }

    fn on_wake_up(&mut self, node_id: u8) {
        let Some(node) = self.registry.get_mut(node_id) else {
            return;
        };
        if node.transition(Liveness::Awake) {
            self.notify_code(NotificationCode::Awake, node_id);
        }
        let released = self.dispatcher.release_node(node_id);
        info!(node = node_id, released, "Node awake");
        if self.registry.get(node_id).is_some_and(Node::is_sleeping_device) {
            self.wake_flush.insert(node_id);
        }
    }

    fn mark_asleep(&mut self, node_id: u8) {
        let Some(node) = self.registry.get_mut(node_id) else {
            return;
        };
        self.dispatcher.hold_node(node_id);
        if node.transition(Liveness::Asleep) {
            info!(node = node_id, held = self.dispatcher.held_count(node_id), "Node asleep");
            self.notify_code(NotificationCode::Sleep, node_id);
        }
    }

    fn forget_node(&mut self, node_id: u8) {
        let cancelled = self
            .dispatcher
            .cancel_where(|tx| tx.target() == Some(node_id));
        self.record_cancelled(&cancelled);
        self.dispatcher.release_node(node_id);
        self.dispatcher.set_sleeping_device(node_id, false);
        self.polled.retain(|id| id.node_id != node_id);
        self.wake_flush.remove(&node_id);
        for id in self.values.remove_node(node_id) {
            self.notify_value(NotificationType::ValueRemoved, id);
        }
        if self.registry.remove(node_id).is_some() {
            info!(node = node_id, "Node removed");
            self.notify(NotificationType::NodeRemoved, node_id);
        }
    }

    // ---- Dispatcher outcomes ----

    fn process_dispatch_events(&mut self) -> bool {
        let events = self.dispatcher.drain_events();
        let active = !events.is_empty();
        for event in events {
            match event {
                DispatchEvent::Completed(tx) => self.on_completed(tx),
                DispatchEvent::Failed { transaction, reason } => self.on_failed(transaction, reason),
                DispatchEvent::NodeAsleep(node_id) => self.mark_asleep(node_id),
            }
        }
        active
    }

    fn on_completed(&mut self, tx: Transaction) {
        if let Some(node_id) = tx.target()
            && matches!(tx.message.function, FUNC_ID_ZW_SEND_DATA | FUNC_ID_ZW_REQUEST_NODE_INFO)
        {
            self.handler_context(None).heard_from(node_id);
        }

        let node_id = tx.target().unwrap_or(0);
        match tx.origin {
            Origin::SetValue(id) => {
                let is_local = self
                    .values
                    .get(&id)
                    .is_some_and(|v| v.write_only || v.value_type() == ValueType::Button);
                if is_local {
                    match self.values.confirm_pending(&id) {
                        Some(StoreUpdate::Changed) => self.notify_value(NotificationType::ValueChanged, id),
                        Some(StoreUpdate::Refreshed) => {
                            self.notify_value(NotificationType::ValueRefreshed, id)
                        }
                        None => {}
                    }
                }
            }
            Origin::TestNode => self.notify_code(NotificationCode::NoOperation, node_id),
            Origin::NoMoreInformation => self.mark_asleep(node_id),
            _ => {}
        }

        if tx.origin.is_external() {
            self.report.completed.push(tx.id);
            self.emit(
                Notification::with_code(NotificationCode::MsgComplete, self.controller.home_id, node_id)
                    .payload(NotificationPayload::Transaction(tx.id)),
            );
        }
    }

    fn on_failed(&mut self, tx: Transaction, reason: FailReason) {
        let node_id = tx.target().unwrap_or(0);
        warn!(tx = %tx, reason = %reason, "Transaction dropped");
        self.emit(
            Notification::with_code(NotificationCode::Timeout, self.controller.home_id, node_id)
                .payload(NotificationPayload::Transaction(tx.id)),
        );
        if tx.origin.is_external() {
            self.report.timed_out.push(tx.id);
        }

        if reason.is_link_failure() && !matches!(tx.origin, Origin::Query { .. }) {
            self.transmission_failed(node_id);
        }

        match tx.origin {
            Origin::Init
                if matches!(
                    tx.message.function,
                    FUNC_ID_ZW_MEMORY_GET_ID | FUNC_ID_SERIAL_API_GET_INIT_DATA
                ) =>
            {
                self.fail(&format!("controller did not answer {}", tx.message.label));
            }
            Origin::Query { node_id, stage } if reason.is_link_failure() => {
                self.query_failed(node_id, stage);
            }
            Origin::SetValue(id) => {
                self.values.clear_pending(&id);
                self.dispatcher.cancel_where(|tx| tx.origin == Origin::Refresh(id));
            }
            Origin::Refresh(id) => self.values.clear_pending(&id),
            Origin::NoMoreInformation => self.mark_asleep(node_id),
            _ => {}
        }
    }

    /// A transaction to an interviewed node went unanswered. At the dead-node
    /// threshold the node is dead and everything still queued for it is
    /// dropped.
    fn transmission_failed(&mut self, node_id: u8) {
        let threshold = self.config.dead_node_threshold.max(1);
        let Some(node) = self.registry.get_mut(node_id) else {
            return;
        };
        if node.liveness == Liveness::Asleep {
            return;
        }
        node.failed_transmissions += 1;
        let failures = node.failed_transmissions;
        if failures < threshold || !node.transition(Liveness::Dead) {
            return;
        }
        node.issued = None;

        warn!(node = node_id, failures, "Node presumed dead");
        self.notify_code(NotificationCode::Dead, node_id);
        let dropped = self
            .dispatcher
            .cancel_where(|tx| tx.target() == Some(node_id) && tx.origin != Origin::TestNode);
        for tx in dropped {
            if tx.origin.is_external() {
                self.report.timed_out.push(tx.id);
            }
            if let Origin::SetValue(id) | Origin::Refresh(id) = tx.origin {
                self.values.clear_pending(&id);
            }
            self.emit(
                Notification::with_code(NotificationCode::Timeout, self.controller.home_id, node_id)
                    .payload(NotificationPayload::Transaction(tx.id)),
            );
        }
    }

    /// A stage's requests failed. Below the threshold the stage is retried;
    /// at the threshold the node is dead and its interview stops.
    fn query_failed(&mut self, node_id: u8, stage: QueryStage) {
        let threshold = self.config.dead_node_threshold.max(1);
        let Some(node) = self.registry.get_mut(node_id) else {
            return;
        };
        if node.is_sleeping_device() && node.liveness == Liveness::Asleep {
            return;
        }
        node.failed_query_cycles += 1;
        node.issued = None;
        let cycles = node.failed_query_cycles;

        if cycles >= threshold {
            let died = node.transition(Liveness::Dead);
            let cancelled = self.dispatcher.cancel_where(
                |tx| matches!(tx.origin, Origin::Query { node_id: n, .. } if n == node_id),
            );
            if died {
                warn!(node = node_id, cycles, "Node presumed dead");
                self.notify_code(NotificationCode::Dead, node_id);
            }
            debug!(node = node_id, cancelled = cancelled.len(), "Interview stopped");
        } else {
            debug!(node = node_id, stage = %stage, cycles, "Query cycle failed, retrying stage");
            self.dispatcher
                .cancel_where(|tx| tx.origin == Origin::Query { node_id, stage });
        }
    }

    fn record_cancelled(&mut self, transactions: &[Transaction]) {
        for tx in transactions.iter().filter(|tx| tx.origin.is_external()) {
            debug!(tx = %tx, "Cancelled external transaction");
            self.report.cancelled.push(tx.id);
        }
    }

    // ---- Interviews ----

    /// Issue or complete interview stages. Returns true if anything moved.
    fn advance_queries(&mut self) -> bool {
        let mut changed = false;
        for node_id in self.registry.ids() {
            loop {
                let Some(node) = self.registry.get_mut(node_id) else {
                    break;
                };
                if node.liveness == Liveness::Dead || node.is_complete() {
                    break;
                }
                let issued = node.issued;
                match issued {
                    None => {
                        let stage = node.stage;
                        let requests = stage_requests(node);
                        changed = true;
                        if requests.is_empty() {
                            self.complete_stage(node_id);
                            continue;
                        }
                        node.issued = Some(stage);
                        for message in requests {
                            self.dispatcher.enqueue(
                                message,
                                Priority::Node,
                                Origin::Query { node_id, stage },
                            );
                        }
                        break;
                    }
                    Some(stage) if self.dispatcher.pending_for_stage(node_id, stage) == 0 => {
                        changed = true;
                        self.complete_stage(node_id);
                    }
                    Some(_) => break,
                }
            }
        }
        changed
    }

    fn complete_stage(&mut self, node_id: u8) {
        let controller_id = self.controller.node_id;
        let Some(node) = self.registry.get_mut(node_id) else {
            return;
        };
        let from = node.stage;
        // The controller answers nothing about itself beyond protocol info.
        let to = if node_id == controller_id {
            QueryStage::FullComplete
        } else {
            from.next()
        };
        node.goto_stage(to);

        let mut stage = from;
        while stage < to {
            stage = stage.next();
            if let Some(kind) = stage_notification(stage) {
                self.notify(kind, node_id);
            }
        }
    }

    fn check_aggregates(&mut self) {
        for kind in self.queries.check(&self.registry) {
            self.notify(kind, self.controller.node_id);
        }
    }

    // ---- Polling and wake-up ----

    fn schedule_polls(&mut self, now: Instant) -> bool {
        if self.polled.is_empty() {
            return false;
        }
        let interval = self.config.poll_interval();
        if self
            .last_poll
            .is_some_and(|last| now.duration_since(last) < interval)
        {
            return false;
        }
        self.last_poll = Some(now);

        let mut queued = false;
        for id in self.polled.iter().copied() {
            let reachable = self
                .registry
                .get(id.node_id)
                .is_some_and(|node| node.liveness.is_reachable());
            if !reachable || self.dispatcher.count_pending(|tx| tx.origin == Origin::Poll(id)) > 0 {
                continue;
            }
            if let Some(get) = command_class::lookup(id.command_class)
                .and_then(|cc| cc.refresh_request(id.node_id, id.index))
            {
                trace!(value = %id, "Poll");
                self.dispatcher.enqueue(get, Priority::Poll, Origin::Poll(id));
                queued = true;
            }
        }
        queued
    }

    /// Send awake sleeping devices back to sleep once nothing is pending.
    fn flush_wake_ups(&mut self) -> bool {
        let ready: Vec<u8> = self
            .wake_flush
            .iter()
            .copied()
            .filter(|&node_id| {
                self.registry
                    .get(node_id)
                    .is_some_and(|node| node.liveness == Liveness::Awake)
                    && self.dispatcher.pending_for_node(node_id) == 0
            })
            .collect();
        for &node_id in &ready {
            self.wake_flush.remove(&node_id);
            debug!(node = node_id, "Wake-up traffic done");
            self.dispatcher.enqueue(
                wake_up::no_more_information(node_id),
                Priority::Node,
                Origin::NoMoreInformation,
            );
        }
        !ready.is_empty()
    }

    // ---- Cache ----

    fn snapshot(&self) -> NetworkSnapshot {
        NetworkSnapshot {
            home_id: self.controller.home_id,
            controller_node_id: self.controller.node_id,
            nodes: self
                .registry
                .iter()
                .map(|node| NodeSnapshot {
                    node: node.clone(),
                    values: self.values.node_values(node.node_id).cloned().collect(),
                })
                .collect(),
        }
    }

    fn save_cache(&mut self) {
        if !self.config.save_configuration || self.controller.home_id == 0 {
            return;
        }
        let snapshot = self.snapshot();
        if let Err(e) = self.cache.save(&snapshot) {
            warn!(error = %e, "Failed to save network cache");
            self.emit(
                Notification::new(NotificationType::UserAlerts, self.controller.home_id, self.controller.node_id)
                    .payload(NotificationPayload::Alert(format!("Network cache not saved: {}", e))),
            );
        }
    }

    // ---- Notifications ----

    fn emit(&self, notification: Notification) {
        self.bus.publish(&notification);
    }

    fn notify(&self, kind: NotificationType, node_id: u8) {
        self.emit(Notification::new(kind, self.controller.home_id, node_id));
    }

    fn notify_code(&self, code: NotificationCode, node_id: u8) {
        self.emit(Notification::with_code(code, self.controller.home_id, node_id));
    }

    fn notify_value(&self, kind: NotificationType, id: ValueId) {
        self.emit(Notification::for_value(kind, self.controller.home_id, id));
    }
}

impl<T: ControllerTransport> Drop for Driver<T> {
    fn drop(&mut self) {
        if self.state != DriverState::Removed {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheError;
    use crate::transport::{MockTransport, SimNode, SimulatedController};
    use std::sync::{Arc, Mutex};

    const HOME: u32 = 0xC0FF_EE01;

    fn fast_config() -> DriverConfig {
        DriverConfig {
            ack_timeout_ms: 50,
            reply_timeout_ms: 100,
            retry_initial_backoff_ms: 1,
            retry_max_backoff_ms: 5,
            reconnect_attempts: 2,
            reconnect_backoff_ms: 1,
            save_configuration: false,
            ..DriverConfig::new("sim")
        }
    }

    fn recorder<T: ControllerTransport>(driver: &Driver<T>) -> Arc<Mutex<Vec<Notification>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        driver.add_watcher(Arc::new(move |n: &Notification| {
            sink.lock().unwrap().push(n.clone());
        }));
        seen
    }

    fn started(sim: &SimulatedController) -> (Driver<MockTransport>, Arc<Mutex<Vec<Notification>>>) {
        let mut driver = Driver::new(fast_config(), sim.transport());
        let seen = recorder(&driver);
        driver.initialize().unwrap();
        let done = driver.run_until(Duration::from_secs(5), settled).unwrap();
        assert!(done, "network interview did not finish");
        (driver, seen)
    }

    /// Every node finished or asleep, nothing left to send.
    fn settled<T: ControllerTransport>(driver: &Driver<T>) -> bool {
        driver.state() == DriverState::Ready
            && driver.is_idle()
            && driver.node_ids().into_iter().all(|id| {
                driver
                    .node_info(id)
                    .is_some_and(|node| node.is_settled() || node.liveness == Liveness::Asleep)
            })
    }

    fn kinds(seen: &Arc<Mutex<Vec<Notification>>>) -> Vec<NotificationType> {
        seen.lock().unwrap().iter().map(|n| n.kind).collect()
    }

    #[test]
    fn test_initialize_builds_network() {
        let sim = SimulatedController::new(HOME);
        sim.add_node(SimNode::switch(2));
        sim.add_node(SimNode::dimmer(3));
        let (driver, seen) = started(&sim);

        assert_eq!(driver.state(), DriverState::Ready);
        assert_eq!(driver.home_id(), HOME);
        assert_eq!(driver.node_ids(), vec![1, 2, 3]);
        assert!(driver.node_info(2).unwrap().is_complete());
        assert_eq!(sim.overlap_violations(), 0);

        let kinds = kinds(&seen);
        assert_eq!(kinds[0], NotificationType::ManufacturerSpecificDBReady);
        assert!(kinds.contains(&NotificationType::DriverReady));
        assert_eq!(
            kinds.iter().filter(|k| **k == NotificationType::AllNodesQueried).count(),
            1
        );
        let switch = ValueId::new(2, COMMAND_CLASS_SWITCH_BINARY, 1, 0);
        assert!(driver.get_value(&switch).is_ok());
    }

    #[test]
    fn test_operations_before_ready() {
        let sim = SimulatedController::new(HOME);
        let mut driver = Driver::new(fast_config(), sim.transport());
        assert!(matches!(
            driver.submit_command(2, COMMAND_CLASS_BASIC, &[0x01, 0xFF]),
            Err(DriverError::NotReady)
        ));
    }

    #[test]
    fn test_set_value_confirmed_by_report() {
        let sim = SimulatedController::new(HOME);
        sim.add_node(SimNode::switch(2));
        let (mut driver, seen) = started(&sim);
        let id = ValueId::new(2, COMMAND_CLASS_SWITCH_BINARY, 1, 0);

        let tx = driver.set_value(&id, ValuePayload::Bool(true)).unwrap();
        assert_eq!(driver.get_value(&id).unwrap().pending(), Some(&ValuePayload::Bool(true)));
        assert_eq!(driver.get_value(&id).unwrap().payload(), &ValuePayload::Bool(false));

        assert!(driver.run_until(Duration::from_secs(2), |d| d.is_idle()).unwrap());
        assert_eq!(driver.get_value(&id).unwrap().payload(), &ValuePayload::Bool(true));
        assert!(sim.node(2).unwrap().switch_on);
        let completions: Vec<_> = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.code == Some(NotificationCode::MsgComplete))
            .filter_map(Notification::transaction)
            .collect();
        assert_eq!(completions, vec![tx]);
    }

    #[test]
    fn test_set_value_type_mismatch() {
        let sim = SimulatedController::new(HOME);
        sim.add_node(SimNode::switch(2));
        let (mut driver, _seen) = started(&sim);
        let id = ValueId::new(2, COMMAND_CLASS_SWITCH_BINARY, 1, 0);
        let before = driver.get_value(&id).unwrap();

        let err = driver.set_value(&id, ValuePayload::Byte(1)).unwrap_err();
        assert!(matches!(err, DriverError::InvalidType { .. }));
        assert_eq!(driver.get_value(&id).unwrap(), before);
        assert!(driver.is_idle());
    }

    #[test]
    fn test_unreachable_node_goes_dead() {
        let sim = SimulatedController::new(HOME);
        sim.add_node(SimNode::switch(2));
        sim.add_node(SimNode::switch(3));
        sim.set_responsive(3, false);
        let (mut driver, seen) = started(&sim);

        assert_eq!(driver.node_info(3).unwrap().liveness, Liveness::Dead);
        let kinds = kinds(&seen);
        assert_eq!(
            kinds.iter().filter(|k| **k == NotificationType::AllNodesQueriedSomeDead).count(),
            1
        );
        assert!(!kinds.contains(&NotificationType::AllNodesQueried));
        assert!(matches!(
            driver.submit_command(3, COMMAND_CLASS_BASIC, &[0x01, 0xFF]),
            Err(DriverError::NodeUnreachable(3))
        ));
    }

    #[test]
    fn test_test_node_revives_dead_node() {
        let sim = SimulatedController::new(HOME);
        sim.add_node(SimNode::switch(3));
        sim.set_responsive(3, false);
        let (mut driver, seen) = started(&sim);
        assert_eq!(driver.node_info(3).unwrap().liveness, Liveness::Dead);

        sim.set_responsive(3, true);
        driver.test_node(3).unwrap();
        assert!(driver
            .run_until(Duration::from_secs(2), |d| d.node_info(3).unwrap().liveness == Liveness::Alive)
            .unwrap());
        let codes: Vec<_> = seen.lock().unwrap().iter().filter_map(|n| n.code).collect();
        assert!(codes.contains(&NotificationCode::Alive));
        assert!(codes.contains(&NotificationCode::NoOperation));
    }

    fn timeouts(seen: &Arc<Mutex<Vec<Notification>>>) -> Vec<u64> {
        seen.lock()
            .unwrap()
            .iter()
            .filter(|n| n.code == Some(NotificationCode::Timeout))
            .filter_map(Notification::transaction)
            .collect()
    }

    #[test]
    fn test_failed_read_back_clears_pending_write() {
        let sim = SimulatedController::new(HOME);
        sim.add_node(SimNode::switch(2));
        let (mut driver, seen) = started(&sim);
        let id = ValueId::new(2, COMMAND_CLASS_SWITCH_BINARY, 1, 0);
        let before = driver.get_value(&id).unwrap().payload().clone();

        let tx = driver.set_value(&id, ValuePayload::Bool(true)).unwrap();
        // The Set lands, then the node stops answering before the Get goes out.
        let node = sim.clone();
        driver.add_watcher(Arc::new(move |n: &Notification| {
            if n.code == Some(NotificationCode::MsgComplete) && n.transaction() == Some(tx) {
                node.set_responsive(2, false);
            }
        }));
        assert!(driver
            .run_until(Duration::from_secs(2), |d| {
                d.is_idle() && d.get_value(&id).is_ok_and(|v| v.pending().is_none())
            })
            .unwrap());

        let value = driver.get_value(&id).unwrap();
        assert_eq!(value.payload(), &before);
        let dropped = timeouts(&seen);
        assert_eq!(dropped.len(), 1);
        assert_ne!(dropped[0], tx);
        assert_eq!(driver.node_info(2).unwrap().liveness, Liveness::Alive);
    }

    #[test]
    fn test_failed_write_drops_its_read_back() {
        let sim = SimulatedController::new(HOME);
        sim.add_node(SimNode::switch(2));
        let (mut driver, seen) = started(&sim);
        let id = ValueId::new(2, COMMAND_CLASS_SWITCH_BINARY, 1, 0);

        sim.set_responsive(2, false);
        let tx = driver.set_value(&id, ValuePayload::Bool(true)).unwrap();
        assert!(driver.run_until(Duration::from_secs(2), |d| d.is_idle()).unwrap());

        assert_eq!(timeouts(&seen), vec![tx]);
        // The read-back went with it; only the Set timed out.
        assert!(driver.get_value(&id).unwrap().pending().is_none());
        assert_eq!(driver.node_info(2).unwrap().liveness, Liveness::Alive);
        assert_eq!(driver.shutdown().timed_out, vec![tx]);
    }

    #[test]
    fn test_remove_node_cancels_pending() {
        let sim = SimulatedController::new(HOME);
        sim.add_node(SimNode::sensor(4));
        let (mut driver, seen) = started(&sim);
        assert_eq!(driver.node_info(4).unwrap().liveness, Liveness::Asleep);

        let tx = driver.submit_command(4, COMMAND_CLASS_BASIC, &[0x01, 0xFF]).unwrap();
        driver.remove_node(4).unwrap();
        assert!(driver.node_info(4).is_none());
        assert!(kinds(&seen).contains(&NotificationType::NodeRemoved));

        let report = driver.shutdown();
        assert_eq!(report.cancelled, vec![tx]);
    }

    struct BrokenCache;

    impl NodeCache for BrokenCache {
        fn load(&mut self, home_id: u32) -> Result<Option<NetworkSnapshot>, CacheError> {
            Err(CacheError::HomeMismatch {
                expected: home_id,
                found: 0,
            })
        }

        fn save(&mut self, _snapshot: &NetworkSnapshot) -> Result<(), CacheError> {
            Ok(())
        }
    }

    #[test]
    fn test_bad_cache_raises_alert() {
        let sim = SimulatedController::new(HOME);
        let mut driver = Driver::new(fast_config(), sim.transport()).with_cache(Box::new(BrokenCache));
        let seen = recorder(&driver);
        driver.initialize().unwrap();
        assert!(driver
            .run_until(Duration::from_secs(2), |d| d.state() == DriverState::Ready)
            .unwrap());
        assert!(kinds(&seen).contains(&NotificationType::UserAlerts));
    }

    #[test]
    fn test_silent_controller_fails_driver() {
        let sim = SimulatedController::new(HOME);
        sim.set_silent(true);
        let mut driver = Driver::new(fast_config(), sim.transport());
        let seen = recorder(&driver);
        driver.initialize().unwrap();
        let failed = driver.run_until(Duration::from_secs(5), |d| d.state() == DriverState::Failed);
        assert!(matches!(failed, Ok(true) | Err(DriverError::Failed)));
        assert!(kinds(&seen).contains(&NotificationType::DriverFailed));
    }

    #[test]
    fn test_shutdown_emits_removed_once() {
        let sim = SimulatedController::new(HOME);
        let (mut driver, seen) = started(&sim);
        driver.shutdown();
        driver.shutdown();
        let removed = kinds(&seen)
            .into_iter()
            .filter(|k| *k == NotificationType::DriverRemoved)
            .count();
        assert_eq!(removed, 1);
        assert!(matches!(driver.poll(), Err(DriverError::ShuttingDown)));
    }
}
