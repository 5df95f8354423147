//! Outgoing serial API messages and the replies they wait for.

use std::fmt;

use super::constants::*;
use super::frame::{Frame, hex_dump};

/// A reply a message must see before its transaction is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// Controller response frame for `function`.
    Response(u8),
    /// Asynchronous callback request carrying the message's callback id.
    Callback(u8),
    /// Application update about `node_id` (node information frame).
    NodeUpdate(u8),
    /// Application command from `node_id` in `command_class`.
    Report { node_id: u8, command_class: u8 },
}

/// Outcome of checking a received frame against an expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMatch {
    /// Frame is unrelated.
    NoMatch,
    /// Expectation satisfied.
    Matched,
    /// Frame answers the expectation with a failure (NoAck, rejected, ...).
    Failed,
}

impl Expectation {
    /// Check `frame` against this expectation.
    ///
    /// `callback_id` is the id the message was last sent with.
    pub fn check(&self, frame: &Frame, callback_id: Option<u8>) -> ReplyMatch {
        match *self {
            Expectation::Response(function) => {
                if !frame.is_response() || frame.function != function {
                    return ReplyMatch::NoMatch;
                }
                // Functions that queue work answer with a single accepted flag.
                let accepted = match function {
                    FUNC_ID_ZW_SEND_DATA | FUNC_ID_ZW_REQUEST_NODE_INFO => {
                        frame.payload.first().copied().unwrap_or(0) != 0
                    }
                    _ => true,
                };
                if accepted {
                    ReplyMatch::Matched
                } else {
                    ReplyMatch::Failed
                }
            }
            Expectation::Callback(function) => {
                if !frame.is_request() || frame.function != function {
                    return ReplyMatch::NoMatch;
                }
                match (frame.payload.first(), callback_id) {
                    (Some(&id), Some(expected)) if id == expected => {
                        match frame.payload.get(1).copied() {
                            Some(TRANSMIT_COMPLETE_OK) => ReplyMatch::Matched,
                            _ => ReplyMatch::Failed,
                        }
                    }
                    _ => ReplyMatch::NoMatch,
                }
            }
            Expectation::NodeUpdate(node_id) => {
                if !frame.is_request() || frame.function != FUNC_ID_ZW_APPLICATION_UPDATE {
                    return ReplyMatch::NoMatch;
                }
                match (frame.payload.first().copied(), frame.payload.get(1).copied()) {
                    (Some(UPDATE_STATE_NODE_INFO_RECEIVED), Some(id)) if id == node_id => {
                        ReplyMatch::Matched
                    }
                    // The controller does not say which node failed.
                    (Some(UPDATE_STATE_NODE_INFO_REQ_FAILED), _) => ReplyMatch::Failed,
                    _ => ReplyMatch::NoMatch,
                }
            }
            Expectation::Report {
                node_id,
                command_class,
            } => {
                if !frame.is_request() || frame.function != FUNC_ID_APPLICATION_COMMAND_HANDLER {
                    return ReplyMatch::NoMatch;
                }
                match (frame.payload.get(1), frame.payload.get(3)) {
                    (Some(&node), Some(&cc)) if node == node_id && cc == command_class => {
                        ReplyMatch::Matched
                    }
                    _ => ReplyMatch::NoMatch,
                }
            }
        }
    }
}

/// An outgoing serial API request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub function: u8,
    pub payload: Vec<u8>,
    /// Node this message talks to, if any.
    pub target: Option<u8>,
    /// Replies to wait for, in order.
    pub expect: Vec<Expectation>,
    /// Whether a callback id is appended on every send.
    pub uses_callback: bool,
    /// Short label for logs.
    pub label: String,
}

impl Message {
    /// Controller-local call answered by a single response frame.
    pub fn controller(function: u8, payload: Vec<u8>, label: impl Into<String>) -> Self {
        Self {
            function,
            payload,
            target: None,
            expect: vec![Expectation::Response(function)],
            uses_callback: false,
            label: label.into(),
        }
    }

    pub fn get_version() -> Self {
        Self::controller(FUNC_ID_ZW_GET_VERSION, vec![], "GetVersion")
    }

    pub fn memory_get_id() -> Self {
        Self::controller(FUNC_ID_ZW_MEMORY_GET_ID, vec![], "MemoryGetId")
    }

    pub fn get_capabilities() -> Self {
        Self::controller(FUNC_ID_SERIAL_API_GET_CAPABILITIES, vec![], "GetCapabilities")
    }

    pub fn get_init_data() -> Self {
        Self::controller(FUNC_ID_SERIAL_API_GET_INIT_DATA, vec![], "GetInitData")
    }

    /// Protocol info is held by the controller; the node is not contacted.
    pub fn get_node_protocol_info(node_id: u8) -> Self {
        let mut msg = Self::controller(
            FUNC_ID_ZW_GET_NODE_PROTOCOL_INFO,
            vec![node_id],
            "GetNodeProtocolInfo",
        );
        msg.target = Some(node_id);
        msg
    }

    /// Ask a node for its node information frame.
    pub fn request_node_info(node_id: u8) -> Self {
        Self {
            function: FUNC_ID_ZW_REQUEST_NODE_INFO,
            payload: vec![node_id],
            target: Some(node_id),
            expect: vec![
                Expectation::Response(FUNC_ID_ZW_REQUEST_NODE_INFO),
                Expectation::NodeUpdate(node_id),
            ],
            uses_callback: false,
            label: "RequestNodeInfo".into(),
        }
    }

    /// Send a command class payload to a node.
    pub fn send_data(node_id: u8, data: Vec<u8>) -> Self {
        let label = match data.first() {
            Some(cc) => format!("SendData cc=0x{:02X}", cc),
            None => "SendData".to_string(),
        };
        let mut payload = Vec::with_capacity(data.len() + 3);
        payload.push(node_id);
        payload.push(data.len() as u8);
        payload.extend_from_slice(&data);
        payload.push(TRANSMIT_OPTIONS);

        Self {
            function: FUNC_ID_ZW_SEND_DATA,
            payload,
            target: Some(node_id),
            expect: vec![
                Expectation::Response(FUNC_ID_ZW_SEND_DATA),
                Expectation::Callback(FUNC_ID_ZW_SEND_DATA),
            ],
            uses_callback: true,
            label,
        }
    }

    /// Send a Get and wait for the node's report.
    pub fn send_data_with_report(node_id: u8, data: Vec<u8>, report_class: u8) -> Self {
        let mut msg = Self::send_data(node_id, data);
        msg.expect.push(Expectation::Report {
            node_id,
            command_class: report_class,
        });
        msg
    }

    /// Command class payload of a SendData, if this is one.
    pub fn command_data(&self) -> Option<&[u8]> {
        if self.function != FUNC_ID_ZW_SEND_DATA {
            return None;
        }
        let len = *self.payload.get(1)? as usize;
        self.payload.get(2..2 + len)
    }

    /// Build the frame for one transmission attempt.
    pub fn to_frame(&self, callback_id: Option<u8>) -> Frame {
        let mut payload = self.payload.clone();
        if self.uses_callback {
            payload.push(callback_id.unwrap_or(0));
        }
        Frame::request(self.function, payload)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            Some(node) => write!(f, "{} node={} [{}]", self.label, node, hex_dump(&self.payload)),
            None => write!(f, "{} [{}]", self.label, hex_dump(&self.payload)),
        }
    }
}
