//! Collaborator traits
//!
//! The tunnel core talks to the rest of the device through these seams:
//! the server's authorization endpoint and the interactive session
//! subsystem that consumes raw streams.

mod auth;
mod session;

pub use auth::Authorizer;
pub use session::{BoxedStream, RawIo, SessionHandler};
