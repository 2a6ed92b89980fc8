//! Reverse tunnel to the server
//!
//! The control connection is dialed out by the device, registered, and then
//! used as a listener for virtual connections opened by the server.

mod connector;
mod error;
mod listener;
mod reconnect;
mod stream;
mod supervisor;

pub use connector::{DialOptions, Dialer, SshDialer, TcpDialer};
pub use error::{DialError, TunnelError};
pub use listener::{ListenerOptions, Registration, ReverseListener};
pub use reconnect::Backoff;
pub use stream::{StreamHandle, VirtualStream, MAX_DATA_CHUNK};
pub use supervisor::Supervisor;
