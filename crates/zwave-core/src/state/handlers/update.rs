//! Application updates: node information frames and membership changes.

use tracing::{debug, info, warn};

use crate::command_class;
use crate::protocol::Frame;
use crate::protocol::constants::*;

use super::{HandleResult, HandlerContext};

/// ApplicationUpdate - `[state, node, length, basic, generic, specific, classes...]`.
pub fn handle_application_update(frame: &Frame, ctx: &mut HandlerContext<'_>) -> HandleResult {
    let payload = &frame.payload;
    let (Some(&state), Some(&node_id)) = (payload.first(), payload.get(1)) else {
        warn!(len = payload.len(), "Short application update");
        return HandleResult::Continue;
    };

    match state {
        UPDATE_STATE_NODE_INFO_RECEIVED => handle_node_info(payload, node_id, ctx),
        UPDATE_STATE_NODE_INFO_REQ_FAILED => {
            // Answered through the dispatcher as a failed attempt.
            debug!("Node information request failed");
            HandleResult::Continue
        }
        UPDATE_STATE_NEW_ID_ASSIGNED => {
            info!(node = node_id, "Node joined the network");
            HandleResult::NodeJoined(node_id)
        }
        UPDATE_STATE_DELETE_DONE => {
            info!(node = node_id, "Node left the network");
            HandleResult::NodeLeft(node_id)
        }
        other => {
            debug!(state = format!("0x{:02X}", other), node = node_id, "Unhandled application update");
            HandleResult::Continue
        }
    }
}

fn handle_node_info(payload: &[u8], node_id: u8, ctx: &mut HandlerContext<'_>) -> HandleResult {
    let len = payload.get(2).copied().unwrap_or(0) as usize;
    // Length counts the three device class bytes.
    let Some(classes) = payload.get(6..3 + len.max(3)) else {
        warn!(node = node_id, len, "Truncated node information frame");
        return HandleResult::Continue;
    };
    let supported: Vec<u8> = classes
        .iter()
        .copied()
        .take_while(|cc| *cc != COMMAND_CLASS_MARK)
        .collect();

    if !ctx.registry.contains(node_id) {
        debug!(node = node_id, "Node information from unknown node ignored");
        return HandleResult::Continue;
    }
    ctx.heard_from(node_id);

    let new_classes: Vec<u8> = match ctx.registry.get_mut(node_id) {
        Some(node) => {
            let added = supported
                .iter()
                .copied()
                .filter(|cc| !node.supports(*cc))
                .collect();
            node.command_classes = supported.clone();
            added
        }
        None => return HandleResult::Continue,
    };

    debug!(
        node = node_id,
        classes = %supported
            .iter()
            .map(|cc| command_class::name_of(*cc))
            .collect::<Vec<_>>()
            .join(","),
        "Node information"
    );

    for cc in new_classes.into_iter().filter_map(command_class::lookup) {
        for value in cc.create_values(node_id) {
            ctx.add_value(value);
        }
    }
    HandleResult::Continue
}
