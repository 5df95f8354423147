//! Controller handshake handlers (GetVersion, MemoryGetId, GetCapabilities,
//! GetInitData, GetNodeProtocolInfo).

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, info, warn};

use crate::node::ProtocolInfo;
use crate::protocol::Frame;
use crate::protocol::constants::*;

use super::{HandleResult, HandlerContext};

/// What the local controller said about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerInfo {
    pub home_id: u32,
    pub node_id: u8,
    /// Library version string, e.g. "Z-Wave 4.54".
    pub library_version: String,
    pub library_type: u8,
    /// Serial API application version, "major.minor".
    pub api_version: String,
    pub manufacturer_id: u16,
    pub product_type: u16,
    pub product_id: u16,
    pub init_capabilities: u8,
}

/// GetVersion - NUL-terminated library string, then library type.
pub fn handle_version(frame: &Frame, ctx: &mut HandlerContext<'_>) -> HandleResult {
    let payload = &frame.payload;
    let end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
    ctx.controller.library_version = String::from_utf8_lossy(&payload[..end]).trim().to_string();
    ctx.controller.library_type = payload.get(end + 1).copied().unwrap_or(0);
    info!(
        version = %ctx.controller.library_version,
        library_type = ctx.controller.library_type,
        "Controller library"
    );
    HandleResult::Continue
}

/// MemoryGetId - Home ID and our own node id.
pub fn handle_memory_get_id(frame: &Frame, ctx: &mut HandlerContext<'_>) -> HandleResult {
    let &[a, b, c, d, node_id, ..] = frame.payload.as_slice() else {
        warn!(len = frame.payload.len(), "Short MemoryGetId response");
        return HandleResult::Continue;
    };
    let home_id = BigEndian::read_u32(&[a, b, c, d]);
    ctx.controller.home_id = home_id;
    ctx.controller.node_id = node_id;
    info!(home_id = format!("{:08X}", home_id), node = node_id, "Home ID");
    HandleResult::HomeId(home_id)
}

/// GetCapabilities - serial API version and controller identity.
pub fn handle_capabilities(frame: &Frame, ctx: &mut HandlerContext<'_>) -> HandleResult {
    let payload = &frame.payload;
    if payload.len() < 8 {
        warn!(len = payload.len(), "Short GetCapabilities response");
        return HandleResult::Continue;
    }
    let info = &mut *ctx.controller;
    info.api_version = format!("{}.{:02}", payload[0], payload[1]);
    info.manufacturer_id = BigEndian::read_u16(&payload[2..4]);
    info.product_type = BigEndian::read_u16(&payload[4..6]);
    info.product_id = BigEndian::read_u16(&payload[6..8]);
    debug!(
        api = %info.api_version,
        manufacturer = format!("{:04X}", info.manufacturer_id),
        product_type = format!("{:04X}", info.product_type),
        product_id = format!("{:04X}", info.product_id),
        "Controller capabilities"
    );
    HandleResult::Continue
}

/// GetInitData - bitmask of node ids known to the controller.
pub fn handle_init_data(frame: &Frame, ctx: &mut HandlerContext<'_>) -> HandleResult {
    let payload = &frame.payload;
    let (Some(&capabilities), Some(&len)) = (payload.get(1), payload.get(2)) else {
        warn!(len = payload.len(), "Short GetInitData response");
        return HandleResult::Continue;
    };
    ctx.controller.init_capabilities = capabilities;

    let len = (len as usize).min(NODE_BITMASK_LEN);
    let bitmask = payload.get(3..3 + len).unwrap_or(&[]);
    let ids = node_ids(bitmask);
    info!(count = ids.len(), nodes = ?ids, "Controller node list");
    HandleResult::NodeList(ids)
}

fn node_ids(bitmask: &[u8]) -> Vec<u8> {
    bitmask
        .iter()
        .enumerate()
        .flat_map(|(byte, bits)| {
            (0..8usize)
                .filter(move |bit| bits & (1u8 << bit) != 0)
                .map(move |bit| (byte * 8 + bit + 1) as u8)
        })
        .filter(|id| *id <= MAX_NODE_ID)
        .collect()
}

/// GetNodeProtocolInfo - the response does not repeat the node id, so it
/// belongs to the in-flight request.
pub fn handle_protocol_info(frame: &Frame, ctx: &mut HandlerContext<'_>) -> HandleResult {
    let Some(node_id) = ctx.in_flight_target(FUNC_ID_ZW_GET_NODE_PROTOCOL_INFO) else {
        warn!("Protocol info response with no request in flight");
        return HandleResult::Continue;
    };
    let Some(node) = ctx.registry.get_mut(node_id) else {
        return HandleResult::Continue;
    };

    match ProtocolInfo::from_bytes(&frame.payload) {
        Some(info) => {
            node.apply_protocol_info(&info);
            debug!(
                node = node_id,
                listening = info.listening,
                routing = info.routing,
                baud = info.max_baud_rate,
                generic = format!("0x{:02X}", info.generic),
                "Protocol info"
            );
            HandleResult::ProtocolInfo(node_id)
        }
        None => {
            warn!(node = node_id, "Controller has no protocol info for node");
            HandleResult::QueryFailed(node_id)
        }
    }
}
