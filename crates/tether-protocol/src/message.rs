//! Message types for the Tether tunnel protocol
//!
//! Messages are serialized into frames using the codec defined in
//! `codec.rs`. The frame header carries the stream a message belongs to;
//! registration and heartbeats use [`StreamId::CONTROL`](crate::StreamId::CONTROL).
//!
//! # Message Flow
//!
//! 1. Agent dials the tunnel endpoint and sends `Register` with its token
//! 2. Server answers with `RegisterAck`; from now on the connection is the
//!    device's virtual listening socket
//! 3. Server sends `StreamOpen` for every virtual connection it accepts on
//!    the device's behalf
//! 4. `Data` flows in both directions for that stream
//! 5. Either side ends the stream with `StreamClose`
//! 6. Both sides send `Heartbeat` periodically and answer with `HeartbeatAck`

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Current protocol version string, sent in `Register`.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Registration (agent → server)
    Register = 0x01,
    /// Registration acknowledgment
    RegisterAck = 0x02,
    /// A virtual connection was opened by the server
    StreamOpen = 0x03,
    /// Bytes for a virtual connection
    Data = 0x04,
    /// A virtual connection was closed
    StreamClose = 0x05,
    /// Heartbeat ping
    Heartbeat = 0x06,
    /// Heartbeat acknowledgment
    HeartbeatAck = 0x07,
    /// Error report
    Error = 0xFF,
}

impl MessageType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Register),
            0x02 => Some(Self::RegisterAck),
            0x03 => Some(Self::StreamOpen),
            0x04 => Some(Self::Data),
            0x05 => Some(Self::StreamClose),
            0x06 => Some(Self::Heartbeat),
            0x07 => Some(Self::HeartbeatAck),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }
}

/// Error codes for error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    /// Data arrived for a stream id that is not open
    StreamNotFound = 1,
    /// Stream id is already in use
    StreamExists = 2,
    /// Message not valid at this point of the exchange
    InvalidMessage = 3,
    /// The stream's reader fell behind and the stream was reset
    StreamOverflow = 4,
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Agent registration, the first frame on a new control connection.
    Register {
        /// Device token obtained from the authorization endpoint
        token: String,
        /// Device UID assigned by the server
        device_uid: String,
        /// Protocol version (`PROTOCOL_VERSION`)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },

    /// Registration acknowledgment
    RegisterAck {
        /// Whether registration was accepted
        accepted: bool,
        /// Reason if not accepted
        reason: Option<String>,
    },

    /// The server accepted a connection on behalf of the device
    StreamOpen {
        /// Address of the peer that originated the connection
        remote_addr: String,
    },

    /// Stream data
    Data(Bytes),

    /// Stream closed by the sender
    StreamClose,

    /// Heartbeat ping
    Heartbeat {
        /// Timestamp for latency measurement
        timestamp: u64,
    },

    /// Heartbeat acknowledgment
    HeartbeatAck {
        /// Echo of the original timestamp
        timestamp: u64,
    },

    /// Error report
    Error {
        /// Error code
        code: ErrorCode,
        /// Human-readable message
        message: String,
    },
}

impl Message {
    /// Get the message type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Register { .. } => MessageType::Register,
            Message::RegisterAck { .. } => MessageType::RegisterAck,
            Message::StreamOpen { .. } => MessageType::StreamOpen,
            Message::Data(_) => MessageType::Data,
            Message::StreamClose => MessageType::StreamClose,
            Message::Heartbeat { .. } => MessageType::Heartbeat,
            Message::HeartbeatAck { .. } => MessageType::HeartbeatAck,
            Message::Error { .. } => MessageType::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for msg_type in [
            MessageType::Register,
            MessageType::RegisterAck,
            MessageType::StreamOpen,
            MessageType::Data,
            MessageType::StreamClose,
            MessageType::Heartbeat,
            MessageType::HeartbeatAck,
            MessageType::Error,
        ] {
            let byte = msg_type.as_u8();
            let recovered = MessageType::from_u8(byte).unwrap();
            assert_eq!(recovered, msg_type);
        }
    }

    #[test]
    fn test_unknown_type_byte() {
        assert!(MessageType::from_u8(0x42).is_none());
    }

    #[test]
    fn test_message_type_of_variants() {
        assert_eq!(Message::StreamClose.message_type(), MessageType::StreamClose);
        assert_eq!(
            Message::StreamOpen {
                remote_addr: "10.0.0.1:4000".into()
            }
            .message_type(),
            MessageType::StreamOpen
        );
    }
}
