//! PTY-backed interactive sessions
//!
//! Each session gets a fresh login shell in a pseudo-terminal. Reading and
//! writing the PTY master is blocking, so both directions run on blocking
//! tasks and talk to the async side through channels.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use portable_pty::{native_pty_system, Child, CommandBuilder, PtySize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use tether_core::traits::{BoxedStream, SessionHandler};

use super::login::SingleUserCredential;

/// Chunks buffered between the PTY and the stream in each direction
const PTY_CHANNEL_CAPACITY: usize = 64;

/// Read size for both directions
const PTY_READ_CHUNK: usize = 4096;

/// Allowed shell paths (prevents arbitrary command execution)
const ALLOWED_SHELLS: &[&str] = &[
    "/bin/sh",
    "/bin/bash",
    "/bin/zsh",
    "/bin/dash",
    "/bin/ash",
    "/bin/ksh",
    "/usr/bin/sh",
    "/usr/bin/bash",
    "/usr/bin/zsh",
    "/usr/bin/dash",
    "/usr/bin/fish",
    "/usr/local/bin/bash",
    "/usr/local/bin/zsh",
];

/// Check a shell against the allow-list and `/etc/shells`, and that it exists
pub fn validate_shell_path(shell: &str) -> Result<String> {
    let listed = ALLOWED_SHELLS.contains(&shell) || in_etc_shells(shell);
    if !listed {
        anyhow::bail!(
            "Shell '{}' is not in the allowed shell list. Allowed shells: {:?}",
            shell,
            ALLOWED_SHELLS
        );
    }

    if !Path::new(shell).exists() {
        anyhow::bail!("Shell '{}' does not exist", shell);
    }

    Ok(shell.to_string())
}

fn in_etc_shells(shell: &str) -> bool {
    std::fs::read_to_string("/etc/shells")
        .map(|shells| {
            shells
                .lines()
                .map(str::trim)
                .any(|line| !line.starts_with('#') && line == shell)
        })
        .unwrap_or(false)
}

/// Serves sessions with a shell running in a PTY
pub struct PtyShell {
    default_shell: Option<String>,
    default_env: Vec<(String, String)>,
    device_name: RwLock<String>,
    credential: Option<SingleUserCredential>,
}

/// PTY handles for a spawned shell
struct SpawnedShell {
    child: Box<dyn Child + Send + Sync>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    // The master must outlive both handles
    _master: Box<dyn portable_pty::MasterPty + Send>,
}

impl PtyShell {
    /// Create a shell handler.
    ///
    /// `default_shell` falls back to `$SHELL`, then `/bin/sh`.
    pub fn new(default_shell: Option<String>, default_env: Vec<(String, String)>) -> Self {
        Self {
            default_shell,
            default_env,
            device_name: RwLock::new(String::new()),
            credential: None,
        }
    }

    /// Require `credential` from every session before spawning a shell
    pub fn with_credential(mut self, credential: SingleUserCredential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Device name exported to new sessions
    pub fn device_name(&self) -> String {
        self.device_name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn spawn(&self, session_id: &str) -> Result<SpawnedShell> {
        let requested = self
            .default_shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_string());
        let shell = validate_shell_path(&requested)
            .with_context(|| format!("Invalid shell requested: {}", requested))?;

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&shell);
        cmd.arg("-l");
        for (key, value) in &self.default_env {
            cmd.env(key, value);
        }
        cmd.env("TETHER_SESSION_ID", session_id);
        cmd.env("TETHER_DEVICE_NAME", self.device_name());

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn shell: {}", shell))?;
        // Only the child keeps the slave open, so reads see EOF when it exits
        drop(pair.slave);

        tracing::info!(
            "Spawned {} for session {} (pid {:?})",
            shell,
            session_id,
            child.process_id()
        );

        let reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("Failed to take PTY writer")?;

        Ok(SpawnedShell {
            child,
            reader,
            writer,
            _master: pair.master,
        })
    }
}

#[async_trait]
impl SessionHandler for PtyShell {
    async fn handle(&self, mut stream: BoxedStream, session_id: &str) -> Result<()> {
        if let Some(credential) = &self.credential {
            credential.challenge(&mut stream, session_id).await?;
        }

        let SpawnedShell {
            mut child,
            reader,
            writer,
            _master,
        } = self.spawn(session_id)?;

        let (output_tx, mut output_rx) = mpsc::channel(PTY_CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(PTY_CHANNEL_CAPACITY);
        spawn_pty_reader(session_id.to_string(), reader, output_tx);
        spawn_pty_writer(writer, input_rx);

        let (mut stream_read, mut stream_write) = tokio::io::split(stream);

        let input = async {
            let mut buf = vec![0u8; PTY_READ_CHUNK];
            loop {
                let n = stream_read.read(&mut buf).await?;
                if n == 0 || input_tx.send(buf[..n].to_vec()).await.is_err() {
                    return Ok::<(), std::io::Error>(());
                }
            }
        };

        let output = async {
            while let Some(data) = output_rx.recv().await {
                stream_write.write_all(&data).await?;
            }
            stream_write.shutdown().await
        };

        let result: std::io::Result<()> = tokio::select! {
            r = input => r,
            r = output => r,
        };

        let status = tokio::task::spawn_blocking(move || {
            let _ = child.kill();
            child.wait()
        })
        .await
        .context("Failed to reap shell")?;
        match status {
            Ok(status) => tracing::debug!(
                "Shell for session {} exited with code {}",
                session_id,
                status.exit_code()
            ),
            Err(e) => tracing::warn!("Failed to wait for shell of session {}: {}", session_id, e),
        }

        result.context("Session stream failed")
    }

    fn set_device_name(&self, name: &str) {
        *self
            .device_name
            .write()
            .unwrap_or_else(PoisonError::into_inner) = name.to_string();
    }
}

/// Copy PTY output into the channel until the PTY closes
fn spawn_pty_reader(
    session_id: String,
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<Vec<u8>>,
) {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; PTY_READ_CHUNK];

        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // EIO once the shell is gone
                    tracing::debug!("PTY reader closed for session {}: {}", session_id, e);
                    break;
                }
            }
        }
    });
}

/// Copy channel input into the PTY until the channel closes
fn spawn_pty_writer(mut writer: Box<dyn Write + Send>, mut rx: mpsc::Receiver<Vec<u8>>) {
    tokio::task::spawn_blocking(move || {
        while let Some(data) = rx.blocking_recv() {
            if writer.write_all(&data).and_then(|_| writer.flush()).is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_validate_shell_path() {
        assert!(validate_shell_path("/bin/sh").is_ok());
        assert!(validate_shell_path("/tmp/not-a-shell").is_err());
        assert!(validate_shell_path("sh").is_err());
    }

    #[test]
    fn test_device_name() {
        let shell = PtyShell::new(None, Vec::new());
        assert_eq!(shell.device_name(), "");
        shell.set_device_name("device-42");
        assert_eq!(shell.device_name(), "device-42");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_session_round_trip() {
        let shell = PtyShell::new(Some("/bin/sh".to_string()), Vec::new());
        shell.set_device_name("device-42");

        let (mut client, server) = tokio::io::duplex(16 * 1024);
        let session = tokio::spawn(async move { shell.handle(Box::new(server), "abc").await });

        client
            .write_all(b"echo \"tether-$((40 + 2))-$TETHER_DEVICE_NAME\"; exit\n")
            .await
            .unwrap();

        let mut output = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(10), async {
            let mut buf = [0u8; 1024];
            loop {
                let n = client.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                output.extend_from_slice(&buf[..n]);
            }
        });
        read.await.unwrap();

        let output = String::from_utf8_lossy(&output);
        assert!(output.contains("tether-42-device-42"), "{}", output);

        drop(client);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_single_user_denies_shell_without_password() {
        let credential =
            SingleUserCredential::new(crate::shell::login::tests::hash("s3cret")).unwrap();
        let shell = PtyShell::new(Some("/bin/sh".to_string()), Vec::new()).with_credential(credential);

        let (mut client, server) = tokio::io::duplex(16 * 1024);
        client
            .write_all(b"guess\necho spawned\nexit\necho spawned\n")
            .await
            .unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            shell.handle(Box::new(server), "abc"),
        )
        .await
        .unwrap();
        assert!(result.is_err());

        let mut transcript = Vec::new();
        client.read_to_end(&mut transcript).await.unwrap();
        let transcript = String::from_utf8_lossy(&transcript);
        assert_eq!(transcript.matches("Permission denied").count(), 3);
        assert!(!transcript.contains("spawned"));
    }
}
