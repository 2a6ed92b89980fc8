//! Device key handling

use std::path::Path;

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;
use russh_keys::PublicKeyBase64;

use tether_core::AuthError;

/// Ensure a device key exists at `path`, generating one if needed
pub async fn ensure_device_key(path: &Path) -> Result<()> {
    if path.exists() {
        tracing::debug!("Using existing device key at {:?}", path);
        return Ok(());
    }

    tracing::info!("Generating new device key at {:?}", path);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let status = tokio::process::Command::new("ssh-keygen")
        .args([
            "-q",
            "-t",
            "ed25519",
            "-f",
            &path.to_string_lossy(),
            "-N",
            "", // No passphrase
            "-C",
            "tether-agent",
        ])
        .status()
        .await
        .context("Failed to run ssh-keygen")?;

    if !status.success() {
        anyhow::bail!("ssh-keygen failed with {}", status);
    }

    Ok(())
}

/// Load the device private key
pub fn load_device_key(path: &Path) -> Result<KeyPair, AuthError> {
    russh_keys::load_secret_key(path, None)
        .map_err(|e| AuthError::Key(format!("failed to load {}: {}", path.display(), e)))
}

/// Public half of the device key in OpenSSH `type base64` form
pub fn public_key_openssh(key: &KeyPair) -> Result<String, AuthError> {
    let public = key
        .clone_public_key()
        .map_err(|e| AuthError::Key(format!("failed to derive public key: {}", e)))?;
    Ok(format!("{} {}", public.name(), public.public_key_base64()))
}
