//! tether-protocol: Wire protocol for the Tether reverse tunnel
//!
//! The device dials the server and then behaves as a listening socket:
//! the server opens virtual streams on the control connection and every
//! byte for every stream travels in a frame defined here.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod stream;

pub use codec::{Frame, FrameCodec};
pub use error::ProtocolError;
pub use frame::{FrameHeader, Scope, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{ErrorCode, Message, MessageType, PROTOCOL_VERSION};
pub use stream::StreamId;
