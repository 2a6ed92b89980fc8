//! Tunnel error types

use std::time::Duration;

use thiserror::Error;

use tether_protocol::ProtocolError;

/// Why a control connection could not be established
#[derive(Debug, Error)]
pub enum DialError {
    /// TCP connection to the tunnel endpoint failed
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Dialing plus negotiation exceeded the connect timeout
    #[error("Connection to {address} timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },

    /// SSH transport failure
    #[error("SSH transport error: {0}")]
    Ssh(String),

    /// The server refused the device key
    #[error("SSH authentication rejected for user '{0}'")]
    AuthRejected(String),

    /// The server refused the registration
    #[error("Registration rejected: {0}")]
    Rejected(String),

    /// The server answered the registration with something unexpected
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Framing error during negotiation
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Why an established control connection ended
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The server closed the control connection
    #[error("Control connection closed by server")]
    Closed,

    /// Nothing was received for too long
    #[error("No traffic from server for {0:?}")]
    KeepaliveTimeout(Duration),

    /// Framing error on the control connection
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The connection driver stopped unexpectedly
    #[error("Connection driver failed: {0}")]
    Driver(String),
}
