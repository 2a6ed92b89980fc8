//! tether-agent: device agent for Tether
//!
//! The agent runs on a device behind NAT and keeps an outbound control
//! connection to the server. The server opens virtual connections over it,
//! which the agent answers as HTTP requests: interactive sessions are handed
//! to the shell as raw streams, everything else is proxied to a local HTTP
//! service.

pub mod agent;
pub mod auth;
pub mod bridge;
pub mod http;
pub mod registry;
pub mod router;
pub mod shell;
pub mod tunnel;

pub use agent::Agent;
