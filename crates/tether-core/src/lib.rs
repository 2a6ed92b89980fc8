//! tether-core: Core abstractions and configuration for Tether
//!
//! Shared types, collaborator traits and configuration used by the
//! device agent.

pub mod config;
pub mod error;
pub mod time;
pub mod traits;
pub mod types;

pub use error::{AuthError, ConfigError, SessionError};
pub use types::{AuthContext, ConnectionState, ServerInfo};
