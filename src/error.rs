//! # Error Types
//!
//! Error handling for the protocol engine.
//!
//! The taxonomy follows the failure model of the protocol itself:
//! - **Transport errors** (I/O, EOF, exhausted server list): always fatal,
//!   surfaced to the caller.
//! - **Malformed-envelope errors**: recovered locally by stream
//!   resynchronization or datagram drop, never fatal.
//! - **Decrypt failures**: dropped locally; fatal only during the fixed
//!   early login packets.
//! - **Authentication errors**: fatal, reported with the server's reason.
//! - **Transaction expiry**: fatal only for important transactions.
//!
//! No error is used for ordinary control flow; every failure either recovers
//! locally or propagates exactly one fatal "connection lost" signal upward.

use std::io;
use thiserror::Error;

/// Primary error type for all protocol operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Server closed the connection")]
    ConnectionClosed,

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("No usable server left in the candidate list")]
    ServersExhausted,

    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Decryption failed")]
    Decrypt,

    #[error("Wrong password: {0}")]
    WrongPassword(String),

    #[error("Account needs activation")]
    NeedActivation,

    #[error("Captcha entry cancelled")]
    CaptchaCancelled,

    #[error("Unknown login reply code: 0x{0:02X}")]
    UnknownReply(u8),

    #[error("Token request rejected: 0x{0:02X}")]
    TokenRejected(u8),

    #[error("Hostname resolution failed: {0}")]
    Resolve(String),

    #[error("Proxy negotiation failed: {0}")]
    Proxy(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Client handle dropped")]
    Detached,
}

impl ProtocolError {
    /// Whether this error tears the connection down (as opposed to being
    /// recoverable by dropping a single packet).
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProtocolError::Malformed(_) | ProtocolError::Decrypt | ProtocolError::OversizedPacket(_)
        )
    }
}

/// Type alias for Results using ProtocolError.
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_per_packet_errors_are_recoverable() {
        assert!(!ProtocolError::Decrypt.is_fatal());
        assert!(!ProtocolError::Malformed("bad tag".into()).is_fatal());
        assert!(!ProtocolError::OversizedPacket(70000).is_fatal());

        assert!(ProtocolError::ConnectionClosed.is_fatal());
        assert!(ProtocolError::WrongPassword("denied".into()).is_fatal());
        assert!(ProtocolError::ServersExhausted.is_fatal());
    }
}
