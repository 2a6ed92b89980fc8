//! Configuration management for Tether

mod agent;
mod backoff;
mod duration_secs;

pub use agent::{running_as_root, AgentConfig, TransportKind, LOG_LEVELS};
pub use backoff::BackoffConfig;

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("agent.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "server_address = \"https://cloud.example.com\"\ntenant_id = \"t1\"\nlog_level = \"debug\""
        )
        .unwrap();

        let config: AgentConfig = load_config(file.path()).unwrap();
        assert_eq!(config.server_address, "https://cloud.example.com");
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_load_config_missing_file() {
        let result: Result<AgentConfig, _> = load_config(Path::new("/nonexistent/tether.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "keepalive_interval = \"soon\"").unwrap();

        let result: Result<AgentConfig, _> = load_config(file.path());
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
