//! Protocol error types

use thiserror::Error;

use crate::message::MessageType;
use crate::stream::StreamId;

/// Errors that can occur while framing the control connection
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown message type
    #[error("Unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    /// Message type not allowed on the stream its header names
    #[error("{message_type:?} is not allowed on {stream_id}")]
    WrongStream {
        message_type: MessageType,
        stream_id: StreamId,
    },

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Header announced one message type, payload decoded as another
    #[error("Message type mismatch: header says {header:#04x}, payload is {payload:#04x}")]
    TypeMismatch { header: u8, payload: u8 },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
