//! Frame handlers and the node interview state machine.

pub mod handlers;
pub mod query;

pub use handlers::{ControllerInfo, HandleResult, HandlerContext, handle_frame};
pub use query::{QueryMachine, stage_notification, stage_requests};
