//! Agent configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::backoff::BackoffConfig;
use super::duration_secs;
use crate::error::ConfigError;

/// Log levels accepted by `log_level`.
pub const LOG_LEVELS: &[&str] = &["error", "warn", "warning", "info", "debug", "trace"];

/// Transport used for the control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// SSH session channel authenticated with the device key
    #[default]
    Ssh,
    /// Plain TCP, for networks that already provide transport security
    Tcp,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ssh" => Ok(Self::Ssh),
            "tcp" => Ok(Self::Tcp),
            other => Err(ConfigError::Invalid(format!(
                "unknown transport '{}', expected 'ssh' or 'tcp'",
                other
            ))),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Ssh => write!(f, "ssh"),
            TransportKind::Tcp => write!(f, "tcp"),
        }
    }
}

/// Configuration for the device agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Management server base URL (e.g. `https://cloud.example.com`)
    pub server_address: String,

    /// Path to the device private key
    pub private_key_path: PathBuf,

    /// Tenant the device is registered under
    pub tenant_id: String,

    /// Interval between keep-alive frames on the control connection.
    ///
    /// Directly affects idle bandwidth.
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,

    /// Hostname hint for the server (defaults to the system hostname)
    pub preferred_hostname: Option<String>,

    /// Identity hint for the server
    pub preferred_identity: Option<String>,

    /// Password hash for single-user mode (agent running unprivileged)
    pub single_user_password: Option<String>,

    /// Log level: error, warn(ing), info, debug, trace
    pub log_level: String,

    /// Control connection transport
    pub transport: TransportKind,

    /// Tunnel endpoint override; defaults to the SSH endpoint advertised by the server
    pub tunnel_address: Option<String>,

    /// Local HTTP service that proxied requests are forwarded to
    pub local_http_address: String,

    /// Bound for dialing and negotiation
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Period of the identity refresh loop
    #[serde(with = "duration_secs")]
    pub refresh_interval: Duration,

    /// Wait between reconnection attempts
    pub backoff: BackoffConfig,

    /// Shell spawned for interactive sessions (defaults to `$SHELL`)
    pub default_shell: Option<String>,

    /// Extra environment for interactive sessions
    pub default_env: Vec<(String, String)>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_address: String::new(),
            private_key_path: PathBuf::new(),
            tenant_id: String::new(),
            keepalive_interval: Duration::from_secs(30),
            preferred_hostname: None,
            preferred_identity: None,
            single_user_password: None,
            log_level: "info".to_string(),
            transport: TransportKind::default(),
            tunnel_address: None,
            local_http_address: "127.0.0.1:80".to_string(),
            connect_timeout: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(10 * 60),
            backoff: BackoffConfig::default(),
            default_shell: None,
            default_env: vec![("TERM".to_string(), "xterm-256color".to_string())],
        }
    }
}

impl AgentConfig {
    /// Hostname presented to the server
    pub fn hostname(&self) -> String {
        self.preferred_hostname
            .clone()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned())
    }

    /// Whether the agent runs in single-user mode
    pub fn is_single_user(&self) -> bool {
        self.single_user_password
            .as_deref()
            .is_some_and(|p| !p.is_empty())
    }

    /// Log level normalized for `tracing` filters
    pub fn tracing_level(&self) -> String {
        match self.log_level.to_ascii_lowercase().as_str() {
            "warning" => "warn".to_string(),
            other => other.to_string(),
        }
    }

    /// Check the configuration before any connection is attempted.
    ///
    /// `privileged` is whether the process runs as root; the single-user
    /// password must be set exactly when it does not.
    pub fn validate(&self, privileged: bool) -> Result<(), ConfigError> {
        if self.server_address.is_empty() {
            return Err(ConfigError::MissingField("server_address".to_string()));
        }
        if self.private_key_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("private_key_path".to_string()));
        }
        if self.tenant_id.is_empty() {
            return Err(ConfigError::MissingField("tenant_id".to_string()));
        }

        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }

        if self.keepalive_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "keepalive_interval must be greater than zero".to_string(),
            ));
        }
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "refresh_interval must be greater than zero".to_string(),
            ));
        }

        self.backoff.validate()?;

        if self.is_single_user() && !self.single_user_password.as_deref().is_some_and(is_argon2_phc) {
            return Err(ConfigError::Invalid(
                "single_user_password must be an Argon2 hash in PHC form ($argon2id$v=19$...)"
                    .to_string(),
            ));
        }

        match (privileged, self.is_single_user()) {
            (true, true) => Err(ConfigError::PrivilegeConflict(
                "the agent cannot run as root when single-user mode is enabled; \
                 unset TETHER_SINGLE_USER_PASSWORD"
                    .to_string(),
            )),
            (false, false) => Err(ConfigError::PrivilegeConflict(
                "running as a non-root user requires a single-user password \
                 (TETHER_SINGLE_USER_PASSWORD, an Argon2 hash such as `argon2 salt -id -e`)"
                    .to_string(),
            )),
            _ => Ok(()),
        }
    }
}

fn is_argon2_phc(hash: &str) -> bool {
    ["$argon2id$", "$argon2i$", "$argon2d$"]
        .iter()
        .any(|prefix| hash.starts_with(prefix))
}

/// Whether the current process runs with root privileges
#[cfg(unix)]
pub fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

/// Whether the current process runs with root privileges
#[cfg(not(unix))]
pub fn running_as_root() -> bool {
    false
}
