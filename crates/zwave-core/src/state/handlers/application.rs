//! Application commands: reports and unsolicited commands sent by nodes.

use tracing::{debug, info, trace, warn};

use crate::command_class::{self, CommandEvent, manufacturer_specific};
use crate::notification::{Notification, NotificationPayload, NotificationType};
use crate::protocol::Frame;
use crate::protocol::constants::*;

use super::{HandleResult, HandlerContext};

/// ApplicationCommandHandler - `[status, node, length, class, command...]`.
pub fn handle_application_command(frame: &Frame, ctx: &mut HandlerContext<'_>) -> HandleResult {
    let payload = &frame.payload;
    let (Some(&node_id), Some(&len)) = (payload.get(1), payload.get(2)) else {
        warn!(len = payload.len(), "Short application command");
        return HandleResult::Continue;
    };
    let Some((&cc_id, data)) = payload
        .get(3..3 + len as usize)
        .and_then(|command| command.split_first())
    else {
        warn!(node = node_id, len, "Truncated application command");
        return HandleResult::Continue;
    };

    if !ctx.registry.contains(node_id) {
        debug!(node = node_id, "Command from unknown node ignored");
        return HandleResult::Continue;
    }
    ctx.heard_from(node_id);

    let Some(cc) = command_class::lookup(cc_id) else {
        trace!(node = node_id, cc = format!("0x{:02X}", cc_id), "Unsupported command class");
        return HandleResult::Continue;
    };

    let mut result = HandleResult::Continue;
    for event in cc.decode(node_id, data) {
        match event {
            CommandEvent::Value { index, payload } => {
                let id = command_class::value_id(node_id, cc_id, index);
                ctx.report_value(id, payload);
            }
            CommandEvent::NewValue(value) => {
                let id = value.id;
                if ctx.values.contains(&id) {
                    if let Some(size) = value.size() {
                        ctx.values.set_size(&id, size);
                    }
                    ctx.report_value(id, value.payload().clone());
                } else {
                    ctx.add_value(value);
                }
            }
            CommandEvent::Naming {
                manufacturer_id,
                product_type,
                product_id,
            } => apply_naming(ctx, node_id, manufacturer_id, product_type, product_id),
            CommandEvent::WakeUpNotification => {
                debug!(node = node_id, "Wake-up notification");
                result = HandleResult::WakeUp(node_id);
            }
            CommandEvent::NodeEvent(level) => {
                ctx.emit(
                    Notification::new(NotificationType::NodeEvent, ctx.controller.home_id, node_id)
                        .payload(NotificationPayload::Event(level)),
                );
            }
            CommandEvent::ResetLocally => {
                info!(node = node_id, "Node was reset locally");
                result = HandleResult::NodeReset(node_id);
            }
        }
    }
    result
}

fn apply_naming(
    ctx: &mut HandlerContext<'_>,
    node_id: u8,
    manufacturer_id: u16,
    product_type: u16,
    product_id: u16,
) {
    let Some(node) = ctx.registry.get_mut(node_id) else {
        return;
    };
    node.manufacturer_id = Some(manufacturer_id);
    node.product_type = Some(product_type);
    node.product_id = Some(product_id);
    node.manufacturer_name = manufacturer_specific::manufacturer_name(manufacturer_id)
        .map(str::to_string)
        .unwrap_or_else(|| format!("Unknown: id={:04X}", manufacturer_id));
    node.product_name = manufacturer_specific::product_name(product_type, product_id);
    info!(node = node_id, name = %node.display_name(), "Node naming");
}

#[cfg(test)]
mod tests {
    use super::super::tests::Fixture;
    use super::*;
    use crate::node::Node;
    use crate::value::{ValueId, ValuePayload};

    fn command(node: u8, data: &[u8]) -> Frame {
        let mut payload = vec![0x00, node, data.len() as u8];
        payload.extend_from_slice(data);
        Frame::request(FUNC_ID_APPLICATION_COMMAND_HANDLER, payload)
    }

    fn switch_fixture() -> Fixture {
        let mut fx = Fixture::new().with_node(Node::new(2));
        for value in command_class::lookup(COMMAND_CLASS_SWITCH_BINARY).unwrap().create_values(2) {
            fx.values.add(value).unwrap();
        }
        fx
    }

    #[test]
    fn test_report_changes_then_refreshes() {
        let mut fx = switch_fixture();
        let report = command(2, &[COMMAND_CLASS_SWITCH_BINARY, 0x03, 0xFF]);
        fx.handle(&report, None);
        fx.handle(&report, None);
        assert_eq!(
            fx.kinds(),
            vec![NotificationType::ValueChanged, NotificationType::ValueRefreshed]
        );
        let id = ValueId::new(2, COMMAND_CLASS_SWITCH_BINARY, 1, 0);
        assert_eq!(fx.values.get(&id).unwrap().payload(), &ValuePayload::Bool(true));
    }

    #[test]
    fn test_config_report_adds_value_once() {
        let mut fx = Fixture::new().with_node(Node::new(2));
        let report = command(2, &[COMMAND_CLASS_CONFIGURATION, 0x06, 3, 1, 20]);
        fx.handle(&report, None);
        fx.handle(&report, None);
        assert_eq!(
            fx.kinds(),
            vec![NotificationType::ValueAdded, NotificationType::ValueRefreshed]
        );
    }

    #[test]
    fn test_naming_and_events() {
        let mut fx = Fixture::new().with_node(Node::new(2));
        fx.handle(
            &command(2, &[COMMAND_CLASS_MANUFACTURER_SPECIFIC, 0x05, 0x00, 0x86, 0x00, 0x03, 0x00, 0x06]),
            None,
        );
        assert_eq!(fx.registry.get(2).unwrap().manufacturer_name, "Aeotec");

        fx.handle(&command(2, &[COMMAND_CLASS_BASIC, 0x01, 0x63]), None);
        let last = fx.seen.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.kind, NotificationType::NodeEvent);
        assert_eq!(last.payload, Some(NotificationPayload::Event(0x63)));

        assert_eq!(
            fx.handle(&command(2, &[COMMAND_CLASS_WAKE_UP, 0x07]), None),
            HandleResult::WakeUp(2)
        );
        assert_eq!(
            fx.handle(&command(2, &[COMMAND_CLASS_DEVICE_RESET_LOCALLY, 0x01]), None),
            HandleResult::NodeReset(2)
        );
    }

    #[test]
    fn test_unknown_node_and_truncated_frames() {
        let mut fx = Fixture::new();
        assert_eq!(
            fx.handle(&command(9, &[COMMAND_CLASS_BASIC, 0x01, 0x00]), None),
            HandleResult::Continue
        );
        let truncated = Frame::request(FUNC_ID_APPLICATION_COMMAND_HANDLER, vec![0x00, 9, 5, 0x20]);
        assert_eq!(fx.handle(&truncated, None), HandleResult::Continue);
        assert!(fx.kinds().is_empty());
    }
}
