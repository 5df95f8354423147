//! Protocol module - serial API framing and constants.

pub mod constants;
pub mod control;
pub mod frame;
pub mod message;

pub use constants::*;
pub use control::ControlByte;
pub use frame::{DecodeEvent, DecodeResult, Frame, FrameDecoder, FrameError, FrameType, decode};
pub use message::{Expectation, Message, ReplyMatch};
