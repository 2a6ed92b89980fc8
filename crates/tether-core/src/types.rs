//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default port of the SSH endpoint when the server omits it
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Identity of the device as last confirmed by the server.
///
/// Written only by the identity refresh loop; everyone else reads
/// snapshots that may be one refresh behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    /// Device UID assigned by the server
    pub uid: String,
    /// Token presented when registering the control connection
    pub token: String,
    /// Namespace the device belongs to
    pub namespace: String,
    /// Tenant-visible device name used in the connection identifier
    pub tenant_name: String,
    /// Device name presented to session routing
    pub device_name: String,
    /// Host part of the SSH endpoint
    pub ssh_host: String,
    /// Port of the SSH endpoint
    pub ssh_port: u16,
}

impl AuthContext {
    /// SSH endpoint as `host:port`
    pub fn ssh_endpoint(&self) -> String {
        if self.ssh_host.contains(':') {
            format!("[{}]:{}", self.ssh_host, self.ssh_port)
        } else {
            format!("{}:{}", self.ssh_host, self.ssh_port)
        }
    }

    /// Human-readable identifier, e.g. `acme.device-42@ssh.example.com`
    pub fn connection_identifier(&self) -> String {
        // ssh_host never carries a port; IPv6 literals stay whole
        format!("{}.{}@{}", self.namespace, self.tenant_name, self.ssh_host)
    }
}

/// Build `{namespace}.{tenant_name}@{host}` with any port stripped from the endpoint
pub fn connection_identifier(namespace: &str, tenant_name: &str, ssh_endpoint: &str) -> String {
    format!("{}.{}@{}", namespace, tenant_name, strip_port(ssh_endpoint))
}

/// Host portion of `host[:port]`, accepting bracketed IPv6 literals
pub fn strip_port(endpoint: &str) -> &str {
    if let Some(rest) = endpoint.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    endpoint.split(':').next().unwrap_or(endpoint)
}

/// Split `host[:port]` into its parts, defaulting the port
pub fn split_host_port(endpoint: &str, default_port: u16) -> (String, u16) {
    let host = strip_port(endpoint).to_string();
    let port = endpoint
        .rsplit_once(':')
        .filter(|(h, _)| !h.is_empty() && (!endpoint.starts_with('[') || h.ends_with(']')))
        .and_then(|(_, p)| p.parse().ok())
        .unwrap_or(default_port);
    (host, port)
}

/// Public server information returned by `/info`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server version
    #[serde(default)]
    pub version: String,
    /// Public endpoints
    pub endpoints: Endpoints,
}

/// Endpoints advertised by the server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// HTTP API endpoint (`host[:port]`)
    #[serde(default)]
    pub api: String,
    /// SSH endpoint (`host[:port]`), also the tunnel endpoint
    pub ssh: String,
}

/// State of the control connection as seen by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting before the next attempt
    Idle,
    /// Dialing and negotiating
    Dialing,
    /// Serving virtual requests
    Listening,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Dialing => write!(f, "dialing"),
            ConnectionState::Listening => write!(f, "listening"),
        }
    }
}
