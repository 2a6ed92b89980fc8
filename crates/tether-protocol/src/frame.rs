//! Frame header
//!
//! ```text
//!  0               4        5                8
//! +---------------+--------+----------------+
//! | stream id u32 | type u8| payload len u24|
//! +---------------+--------+----------------+
//! ```
//!
//! All fields are big-endian. Registration and heartbeats travel on
//! [`StreamId::CONTROL`] and stream traffic never does; a header breaking
//! that rule is rejected before its payload is read.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::message::MessageType;
use crate::stream::StreamId;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 8;

/// Largest payload the length field can announce
pub const MAX_PAYLOAD_SIZE: usize = 0x00FF_FFFF;

const LENGTH_BYTES: usize = 3;

/// Streams a message type may be sent on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Only the control stream
    Control,
    /// Only virtual streams
    Stream,
    /// Either; an error may concern the connection or a single stream
    Any,
}

impl Scope {
    /// Scope of a message type
    pub fn of(message_type: MessageType) -> Self {
        match message_type {
            MessageType::Register
            | MessageType::RegisterAck
            | MessageType::Heartbeat
            | MessageType::HeartbeatAck => Self::Control,
            MessageType::StreamOpen | MessageType::Data | MessageType::StreamClose => Self::Stream,
            MessageType::Error => Self::Any,
        }
    }

    /// Whether a frame in this scope may carry `stream_id`
    pub fn allows(self, stream_id: StreamId) -> bool {
        match self {
            Self::Control => stream_id.is_control(),
            Self::Stream => !stream_id.is_control(),
            Self::Any => true,
        }
    }
}

/// Routing and length information preceding every payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Stream this frame belongs to
    pub stream_id: StreamId,
    /// Type of message in the payload
    pub message_type: MessageType,
    /// Length of the payload in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(stream_id: StreamId, message_type: MessageType, payload_length: u32) -> Self {
        Self {
            stream_id,
            message_type,
            payload_length,
        }
    }

    /// Check that the message type may travel on this header's stream
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if Scope::of(self.message_type).allows(self.stream_id) {
            Ok(())
        } else {
            Err(ProtocolError::WrongStream {
                message_type: self.message_type,
                stream_id: self.stream_id,
            })
        }
    }

    /// Append the header to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u32(self.stream_id.as_u32());
        dst.put_u8(self.message_type.as_u8());
        dst.put_uint(u64::from(self.payload_length), LENGTH_BYTES);
    }

    /// Decode and validate a header.
    ///
    /// `Ok(None)` means more bytes are needed. `src` is only advanced when a
    /// valid header is returned.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut raw = &src[..HEADER_SIZE];
        let stream_id = StreamId::new(raw.get_u32());
        let type_byte = raw.get_u8();
        let payload_length = raw.get_uint(LENGTH_BYTES) as u32;

        let message_type =
            MessageType::from_u8(type_byte).ok_or(ProtocolError::UnknownMessageType(type_byte))?;
        let header = Self::new(stream_id, message_type, payload_length);
        header.validate()?;

        src.advance(HEADER_SIZE);
        Ok(Some(header))
    }
}
