//! Error types shared by the wire, protocol and runtime layers.
//!
//! Every error in this module is scoped to a single connection: the event
//! loop logs it and closes that connection, nothing else.

use std::io;
use thiserror::Error;

/// A read, write or seek that would cross the logical end of a ring view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("boundary violation: {requested} bytes at position {position} exceeds length {len}")]
pub struct BoundaryViolation {
    pub position: usize,
    pub requested: usize,
    pub len: usize,
}

/// Login handshake integrity failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HandshakeFault {
    #[error("client sent a zero seed")]
    ZeroSeed,
    #[error("first packet sent twice")]
    DuplicateFirstPacket,
    #[error("packet out of order for the current login phase")]
    OutOfOrder,
    #[error("unknown or mismatched session token")]
    InvalidAuthToken,
    #[error("server index out of range")]
    UnknownServer,
    #[error("character slot not available")]
    UnknownCharacter,
}

/// Connection-terminating conditions.
#[derive(Debug, Error)]
pub enum NetError {
    #[error(transparent)]
    Boundary(#[from] BoundaryViolation),

    #[error("unrecognized packet 0x{0:02X}")]
    UnknownOpcode(u8),

    #[error("invalid frame length {length} for packet 0x{opcode:02X}")]
    InvalidFrameLength { opcode: u8, length: usize },

    #[error("frame does not fit in the receive buffer")]
    FrameTooLarge,

    #[error("invalid client detected: {0}")]
    Handshake(#[from] HandshakeFault),

    #[error("send buffer overflow")]
    SendOverflow,

    #[error("outgoing packet of {length} bytes exceeds the length field")]
    PacketTooLong { length: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = NetError::from(BoundaryViolation {
            position: 10,
            requested: 4,
            len: 12,
        });
        assert_eq!(
            err.to_string(),
            "boundary violation: 4 bytes at position 10 exceeds length 12"
        );

        let err = NetError::UnknownOpcode(0x7f);
        assert_eq!(err.to_string(), "unrecognized packet 0x7F");

        let err = NetError::from(HandshakeFault::ZeroSeed);
        assert_eq!(err.to_string(), "invalid client detected: client sent a zero seed");
    }
}
