//! Single-byte control codes (ACK / NAK / CAN).
//!
//! Control bytes are link-level acknowledgements. They are surfaced by the
//! decoder as separate events and never queued as transactions.

use std::fmt;

use super::constants::{ACK, CAN, NAK};

/// Link-level control byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlByte {
    /// Frame accepted.
    Ack,
    /// Frame rejected (bad checksum).
    Nak,
    /// Frame dropped (collision on the link).
    Can,
}

impl ControlByte {
    /// Parse a control byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            ACK => Some(Self::Ack),
            NAK => Some(Self::Nak),
            CAN => Some(Self::Can),
            _ => None,
        }
    }

    /// Wire value.
    pub fn as_byte(&self) -> u8 {
        match self {
            Self::Ack => ACK,
            Self::Nak => NAK,
            Self::Can => CAN,
        }
    }

    /// Whether the far side wants the last frame sent again.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Nak | Self::Can)
    }
}

impl fmt::Display for ControlByte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlByte::Ack => write!(f, "ACK"),
            ControlByte::Nak => write!(f, "NAK"),
            ControlByte::Can => write!(f, "CAN"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_bytes() {
        assert_eq!(ControlByte::from_byte(0x06), Some(ControlByte::Ack));
        assert_eq!(ControlByte::from_byte(0x15), Some(ControlByte::Nak));
        assert_eq!(ControlByte::from_byte(0x18), Some(ControlByte::Can));
        assert_eq!(ControlByte::from_byte(0x01), None);
    }

    #[test]
    fn test_rejection() {
        assert!(!ControlByte::Ack.is_rejection());
        assert!(ControlByte::Nak.is_rejection());
        assert!(ControlByte::Can.is_rejection());
        assert_eq!(ControlByte::Can.to_string(), "CAN");
    }
}
