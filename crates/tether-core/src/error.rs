//! Core error types for Tether

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the authorization collaborator
#[derive(Error, Debug)]
pub enum AuthError {
    /// The server refused the device; retrying will not help
    #[error("Device rejected by server: {0}")]
    Rejected(String),

    /// The server could not be reached or answered unexpectedly
    #[error("Authorization failed: {0}")]
    Transient(String),

    /// The device key could not be used
    #[error("Device key error: {0}")]
    Key(String),
}

impl AuthError {
    /// Whether retrying later cannot succeed
    pub fn is_permanent(&self) -> bool {
        matches!(self, AuthError::Rejected(_) | AuthError::Key(_))
    }
}

/// Session registry errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    /// A live session already uses this id
    #[error("Session already exists: {0}")]
    AlreadyExists(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// Log level is not one of the supported names
    #[error("Invalid log level '{0}', expected one of error, warn, info, debug, trace")]
    InvalidLogLevel(String),

    /// Privilege and credential settings contradict each other
    #[error("{0}")]
    PrivilegeConflict(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}
