//! Simulated controller and node network.
//!
//! [`SimulatedController`] answers serial API requests written to its
//! [`MockTransport`] the way a real controller would: ACK, response,
//! transmit callback, and node reports. Nodes can be made unresponsive or
//! put to sleep to exercise timeout, dead-node and wake-up handling.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::mock::MockTransport;
use crate::protocol::constants::*;
use crate::protocol::{ControlByte, DecodeEvent, Frame, FrameDecoder};

/// A simulated network node.
#[derive(Debug, Clone)]
pub struct SimNode {
    pub node_id: u8,
    pub listening: bool,
    pub routing: bool,
    pub basic: u8,
    pub generic: u8,
    pub specific: u8,
    pub command_classes: Vec<u8>,
    pub manufacturer_id: u16,
    pub product_type: u16,
    pub product_id: u16,
    /// Answers radio traffic at all.
    pub responsive: bool,
    /// Battery nodes only hear traffic while awake.
    pub awake: bool,
    pub basic_value: u8,
    pub switch_on: bool,
    pub level: u8,
    pub battery: u8,
    /// Tenths of a degree.
    pub temperature: i16,
    pub thermostat_mode: u8,
    pub wake_up_interval: u32,
    /// Parameter -> (size, value).
    pub config: BTreeMap<u8, (u8, i32)>,
}

impl SimNode {
    fn base(node_id: u8) -> Self {
        Self {
            node_id,
            listening: true,
            routing: true,
            basic: BASIC_TYPE_ROUTING_SLAVE,
            generic: 0x10,
            specific: 0x01,
            command_classes: vec![COMMAND_CLASS_MANUFACTURER_SPECIFIC, COMMAND_CLASS_VERSION],
            manufacturer_id: 0x0086,
            product_type: 0x0003,
            product_id: 0x0006,
            responsive: true,
            awake: true,
            basic_value: 0,
            switch_on: false,
            level: 0,
            battery: 100,
            temperature: 215,
            thermostat_mode: 0,
            wake_up_interval: 3600,
            config: BTreeMap::new(),
        }
    }

    /// Mains-powered on/off switch.
    pub fn switch(node_id: u8) -> Self {
        let mut node = Self::base(node_id);
        node.command_classes.extend([
            COMMAND_CLASS_BASIC,
            COMMAND_CLASS_SWITCH_BINARY,
            COMMAND_CLASS_CONFIGURATION,
        ]);
        node
    }

    /// Mains-powered dimmer.
    pub fn dimmer(node_id: u8) -> Self {
        let mut node = Self::base(node_id);
        node.generic = 0x11;
        node.command_classes.extend([COMMAND_CLASS_BASIC, COMMAND_CLASS_SWITCH_MULTILEVEL]);
        node
    }

    /// Battery-powered temperature sensor that sleeps.
    pub fn sensor(node_id: u8) -> Self {
        let mut node = Self::base(node_id);
        node.listening = false;
        node.routing = false;
        node.basic = BASIC_TYPE_SLAVE;
        node.generic = 0x21;
        node.awake = false;
        node.manufacturer_id = 0x010F;
        node.command_classes.extend([
            COMMAND_CLASS_SENSOR_MULTILEVEL,
            COMMAND_CLASS_BATTERY,
            COMMAND_CLASS_WAKE_UP,
        ]);
        node
    }

    /// Mains-powered thermostat.
    pub fn thermostat(node_id: u8) -> Self {
        let mut node = Self::base(node_id);
        node.generic = 0x08;
        node.command_classes.extend([
            COMMAND_CLASS_THERMOSTAT_MODE,
            COMMAND_CLASS_SENSOR_MULTILEVEL,
        ]);
        node
    }

    fn reachable(&self) -> bool {
        self.responsive && (self.listening || self.awake)
    }

    fn supports(&self, cc: u8) -> bool {
        cc == COMMAND_CLASS_NO_OPERATION || self.command_classes.contains(&cc)
    }

    fn capability_byte(&self) -> u8 {
        let mut cap = 0x10; // 40k baud
        if self.listening {
            cap |= NODE_CAPABILITY_LISTENING;
        }
        if self.routing {
            cap |= NODE_CAPABILITY_ROUTING;
        }
        cap
    }
}

#[derive(Debug)]
struct SimState {
    home_id: u32,
    controller_id: u8,
    nodes: BTreeMap<u8, SimNode>,
    /// Drop every request without even an ACK.
    silent: bool,
    /// Data frames handed to the host not yet ACKed.
    unacked_frames: usize,
    /// Host requests that arrived while replies were still unacknowledged.
    overlap_violations: usize,
    /// Command class payloads delivered to each node, in order.
    delivered: BTreeMap<u8, Vec<Vec<u8>>>,
    requests: Vec<Frame>,
}

/// In-process controller and node network.
#[derive(Clone)]
pub struct SimulatedController {
    state: Arc<Mutex<SimState>>,
    transport: MockTransport,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimulatedController {
    /// Create a network whose controller is node 1.
    pub fn new(home_id: u32) -> Self {
        let state = Arc::new(Mutex::new(SimState {
            home_id,
            controller_id: 1,
            nodes: BTreeMap::new(),
            silent: false,
            unacked_frames: 0,
            overlap_violations: 0,
            delivered: BTreeMap::new(),
            requests: Vec::new(),
        }));

        let transport = MockTransport::new();
        let responder_state = Arc::clone(&state);
        let mut decoder = FrameDecoder::new();
        transport.set_responder(move |data| {
            decoder.push(data);
            let mut replies = Vec::new();
            while let Some(event) = decoder.next_event() {
                let mut state = lock(&responder_state);
                match event {
                    DecodeEvent::Control(ControlByte::Ack) => {
                        state.unacked_frames = state.unacked_frames.saturating_sub(1);
                    }
                    DecodeEvent::Control(_) | DecodeEvent::ChecksumError => {}
                    DecodeEvent::Frame(frame) => {
                        if state.silent {
                            continue;
                        }
                        if state.unacked_frames > 0 {
                            state.overlap_violations += 1;
                        }
                        state.requests.push(frame.clone());
                        replies.push(vec![ACK]);
                        for reply in state.handle(&frame) {
                            if let Ok(bytes) = reply.encode() {
                                state.unacked_frames += 1;
                                replies.push(bytes);
                            }
                        }
                    }
                }
            }
            replies
        });

        Self { state, transport }
    }

    /// A clone of the transport the driver should use.
    pub fn transport(&self) -> MockTransport {
        self.transport.clone()
    }

    pub fn home_id(&self) -> u32 {
        lock(&self.state).home_id
    }

    pub fn add_node(&self, node: SimNode) {
        lock(&self.state).nodes.insert(node.node_id, node);
    }

    pub fn remove_node(&self, node_id: u8) {
        lock(&self.state).nodes.remove(&node_id);
    }

    /// Snapshot of a node's simulated state.
    pub fn node(&self, node_id: u8) -> Option<SimNode> {
        lock(&self.state).nodes.get(&node_id).cloned()
    }

    pub fn set_responsive(&self, node_id: u8, responsive: bool) {
        if let Some(node) = lock(&self.state).nodes.get_mut(&node_id) {
            node.responsive = responsive;
        }
    }

    /// Stop (or resume) answering the host entirely.
    pub fn set_silent(&self, silent: bool) {
        lock(&self.state).silent = silent;
    }

    /// Put a battery node to sleep without telling the host.
    pub fn sleep(&self, node_id: u8) {
        if let Some(node) = lock(&self.state).nodes.get_mut(&node_id) {
            node.awake = false;
        }
    }

    /// Wake a battery node and send its WakeUp Notification.
    pub fn wake_up(&self, node_id: u8) {
        if let Some(node) = lock(&self.state).nodes.get_mut(&node_id) {
            node.awake = true;
        }
        self.send_from_node(node_id, &[COMMAND_CLASS_WAKE_UP, 0x07]);
    }

    /// Node sends Basic Set to the controller (a button press, a motion event).
    pub fn send_basic_set(&self, node_id: u8, value: u8) {
        self.send_from_node(node_id, &[COMMAND_CLASS_BASIC, 0x01, value]);
    }

    /// Node announces it was factory reset.
    pub fn reset_locally(&self, node_id: u8) {
        self.send_from_node(node_id, &[COMMAND_CLASS_DEVICE_RESET_LOCALLY, 0x01]);
    }

    /// Queue an unsolicited application command from `node_id`.
    pub fn send_from_node(&self, node_id: u8, data: &[u8]) {
        let frame = application_command(node_id, data);
        lock(&self.state).unacked_frames += 1;
        self.transport.queue_frame(&frame);
    }

    /// Command class payloads delivered to `node_id`, oldest first.
    pub fn delivered(&self, node_id: u8) -> Vec<Vec<u8>> {
        lock(&self.state)
            .delivered
            .get(&node_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Every request frame the host sent.
    pub fn requests(&self) -> Vec<Frame> {
        lock(&self.state).requests.clone()
    }

    /// Requests that arrived before the host acknowledged earlier replies.
    pub fn overlap_violations(&self) -> usize {
        lock(&self.state).overlap_violations
    }
}

fn application_command(node_id: u8, data: &[u8]) -> Frame {
    let mut payload = vec![0x00, node_id, data.len() as u8];
    payload.extend_from_slice(data);
    Frame::request(FUNC_ID_APPLICATION_COMMAND_HANDLER, payload)
}

impl SimState {
    fn handle(&mut self, frame: &Frame) -> Vec<Frame> {
        match frame.function {
            FUNC_ID_ZW_GET_VERSION => {
                let mut payload = b"Z-Wave 4.54\0".to_vec();
                payload.push(0x01);
                vec![Frame::response(FUNC_ID_ZW_GET_VERSION, payload)]
            }
            FUNC_ID_ZW_MEMORY_GET_ID => {
                let mut payload = self.home_id.to_be_bytes().to_vec();
                payload.push(self.controller_id);
                vec![Frame::response(FUNC_ID_ZW_MEMORY_GET_ID, payload)]
            }
            FUNC_ID_SERIAL_API_GET_CAPABILITIES => {
                let mut payload = vec![0x01, 0x02, 0x00, 0x86, 0x00, 0x01, 0x00, 0x5A];
                payload.extend([0u8; 32]);
                vec![Frame::response(FUNC_ID_SERIAL_API_GET_CAPABILITIES, payload)]
            }
            FUNC_ID_SERIAL_API_GET_INIT_DATA => {
                let mut bitmask = [0u8; NODE_BITMASK_LEN];
                let ids = std::iter::once(self.controller_id).chain(self.nodes.keys().copied());
                for id in ids {
                    let bit = (id - 1) as usize;
                    bitmask[bit / 8] |= 1 << (bit % 8);
                }
                let mut payload = vec![0x05, 0x08, NODE_BITMASK_LEN as u8];
                payload.extend(bitmask);
                payload.extend([0x05, 0x00]);
                vec![Frame::response(FUNC_ID_SERIAL_API_GET_INIT_DATA, payload)]
            }
            FUNC_ID_ZW_GET_NODE_PROTOCOL_INFO => {
                let node_id = frame.payload.first().copied().unwrap_or(0);
                let payload = if node_id == self.controller_id {
                    vec![
                        NODE_CAPABILITY_LISTENING | NODE_CAPABILITY_ROUTING | 0x10,
                        0x00,
                        0x00,
                        BASIC_TYPE_STATIC_CONTROLLER,
                        0x02,
                        0x07,
                    ]
                } else {
                    match self.nodes.get(&node_id) {
                        Some(node) => vec![
                            node.capability_byte(),
                            0x00,
                            0x00,
                            node.basic,
                            node.generic,
                            node.specific,
                        ],
                        None => vec![0; 6],
                    }
                };
                vec![Frame::response(FUNC_ID_ZW_GET_NODE_PROTOCOL_INFO, payload)]
            }
            FUNC_ID_ZW_REQUEST_NODE_INFO => {
                let node_id = frame.payload.first().copied().unwrap_or(0);
                let mut replies = vec![Frame::response(FUNC_ID_ZW_REQUEST_NODE_INFO, vec![1])];
                match self.nodes.get(&node_id).filter(|n| n.reachable()) {
                    Some(node) => {
                        let mut payload = vec![
                            UPDATE_STATE_NODE_INFO_RECEIVED,
                            node_id,
                            (node.command_classes.len() + 3) as u8,
                            node.basic,
                            node.generic,
                            node.specific,
                        ];
                        payload.extend(&node.command_classes);
                        replies.push(Frame::request(FUNC_ID_ZW_APPLICATION_UPDATE, payload));
                    }
                    None => replies.push(Frame::request(
                        FUNC_ID_ZW_APPLICATION_UPDATE,
                        vec![UPDATE_STATE_NODE_INFO_REQ_FAILED, 0, 0],
                    )),
                }
                replies
            }
            FUNC_ID_ZW_SEND_DATA => self.handle_send_data(&frame.payload),
            _ => Vec::new(),
        }
    }

    fn handle_send_data(&mut self, payload: &[u8]) -> Vec<Frame> {
        let node_id = payload.first().copied().unwrap_or(0);
        let len = payload.get(1).copied().unwrap_or(0) as usize;
        let data = payload.get(2..2 + len).unwrap_or(&[]).to_vec();
        let callback_id = payload.last().copied().unwrap_or(0);

        let mut replies = vec![Frame::response(FUNC_ID_ZW_SEND_DATA, vec![1])];
        let Some(node) = self.nodes.get_mut(&node_id).filter(|n| n.reachable()) else {
            replies.push(Frame::request(
                FUNC_ID_ZW_SEND_DATA,
                vec![callback_id, TRANSMIT_COMPLETE_NO_ACK],
            ));
            return replies;
        };

        replies.push(Frame::request(
            FUNC_ID_ZW_SEND_DATA,
            vec![callback_id, TRANSMIT_COMPLETE_OK],
        ));
        self.delivered.entry(node_id).or_default().push(data.clone());

        if let Some(report) = node.apply(&data, self.controller_id) {
            replies.push(application_command(node_id, &report));
        }
        replies
    }
}

impl SimNode {
    /// Apply a command; return the report payload for Gets.
    fn apply(&mut self, data: &[u8], controller_id: u8) -> Option<Vec<u8>> {
        let (&cc, rest) = data.split_first()?;
        if !self.supports(cc) {
            return None;
        }
        let cmd = rest.first().copied().unwrap_or(0);
        let arg = |i: usize| rest.get(i).copied().unwrap_or(0);

        match (cc, cmd) {
            (COMMAND_CLASS_BASIC, 0x01) => {
                self.basic_value = arg(1);
                self.switch_on = arg(1) != 0;
                self.level = arg(1);
                None
            }
            (COMMAND_CLASS_BASIC, 0x02) => Some(vec![cc, 0x03, self.basic_value]),
            (COMMAND_CLASS_SWITCH_BINARY, 0x01) => {
                self.switch_on = arg(1) != 0;
                None
            }
            (COMMAND_CLASS_SWITCH_BINARY, 0x02) => {
                Some(vec![cc, 0x03, if self.switch_on { 0xFF } else { 0x00 }])
            }
            (COMMAND_CLASS_SWITCH_MULTILEVEL, 0x01) => {
                self.level = arg(1);
                None
            }
            (COMMAND_CLASS_SWITCH_MULTILEVEL, 0x02) => Some(vec![cc, 0x03, self.level]),
            (COMMAND_CLASS_SENSOR_MULTILEVEL, 0x04) => {
                let [hi, lo] = self.temperature.to_be_bytes();
                // Air temperature, precision 1, scale Celsius, 2 bytes.
                Some(vec![cc, 0x05, 0x01, 0x22, hi, lo])
            }
            (COMMAND_CLASS_THERMOSTAT_MODE, 0x01) => {
                self.thermostat_mode = arg(1);
                None
            }
            (COMMAND_CLASS_THERMOSTAT_MODE, 0x02) => Some(vec![cc, 0x03, self.thermostat_mode]),
            (COMMAND_CLASS_CONFIGURATION, 0x04) => {
                let param = arg(1);
                let size = arg(2);
                let bytes = rest.get(3..3 + size as usize).unwrap_or(&[]);
                let value = bytes.iter().fold(0i32, |acc, &b| (acc << 8) | b as i32);
                self.config.insert(param, (size, value));
                None
            }
            (COMMAND_CLASS_CONFIGURATION, 0x05) => {
                let param = arg(1);
                let (size, value) = self.config.get(&param).copied().unwrap_or((1, 0));
                let size = size.clamp(1, 4);
                let mut report = vec![cc, 0x06, param, size];
                report.extend(&value.to_be_bytes()[4 - size as usize..]);
                Some(report)
            }
            (COMMAND_CLASS_MANUFACTURER_SPECIFIC, 0x04) => {
                let mut report = vec![cc, 0x05];
                report.extend(self.manufacturer_id.to_be_bytes());
                report.extend(self.product_type.to_be_bytes());
                report.extend(self.product_id.to_be_bytes());
                Some(report)
            }
            (COMMAND_CLASS_BATTERY, 0x02) => Some(vec![cc, 0x03, self.battery]),
            (COMMAND_CLASS_WAKE_UP, 0x04) => {
                self.wake_up_interval =
                    u32::from_be_bytes([0, arg(1), arg(2), arg(3)]);
                None
            }
            (COMMAND_CLASS_WAKE_UP, 0x05) => {
                let bytes = self.wake_up_interval.to_be_bytes();
                Some(vec![cc, 0x06, bytes[1], bytes[2], bytes[3], controller_id])
            }
            (COMMAND_CLASS_WAKE_UP, 0x08) => {
                self.awake = false;
                None
            }
            (COMMAND_CLASS_VERSION, 0x11) => Some(vec![cc, 0x12, 0x03, 0x04, 0x05, 0x01, 0x02]),
            _ => None,
        }
    }
}
