//! Single-user login
//!
//! A device running the agent without root privileges only serves its own
//! user. Sessions then have to present the configured password before a
//! shell is spawned.

use anyhow::{Context, Result};
use argon2::password_hash::{PasswordHash, PasswordVerifier};
use argon2::Argon2;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Password attempts allowed per session
pub const MAX_LOGIN_ATTEMPTS: usize = 3;

/// Longest password line accepted
const MAX_PASSWORD_LEN: usize = 1024;

/// Password required to open a session in single-user mode.
///
/// Holds an Argon2 hash in PHC string form, e.g. `$argon2id$v=19$...`.
#[derive(Clone)]
pub struct SingleUserCredential {
    hash: String,
}

impl std::fmt::Debug for SingleUserCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SingleUserCredential(..)")
    }
}

impl SingleUserCredential {
    /// Parse the configured password hash
    pub fn new(hash: impl Into<String>) -> Result<Self> {
        let hash = hash.into();
        let parsed = PasswordHash::new(&hash)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .context("Invalid single-user password hash")?;
        argon2::Algorithm::try_from(parsed.algorithm)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .context("Single-user password must be an Argon2 hash")?;
        Ok(Self { hash })
    }

    /// Check a password against the hash
    pub fn verify(&self, password: &[u8]) -> bool {
        match PasswordHash::new(&self.hash) {
            Ok(parsed) => Argon2::default().verify_password(password, &parsed).is_ok(),
            Err(_) => false,
        }
    }

    /// Prompt on the stream until the password matches or attempts run out.
    ///
    /// Input is not echoed.
    pub async fn challenge<S>(&self, stream: &mut S, session_id: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        for attempt in 1..=MAX_LOGIN_ATTEMPTS {
            stream.write_all(b"Password: ").await?;
            stream.flush().await?;

            let password = match read_password(stream).await? {
                Some(password) => password,
                None => anyhow::bail!("Session {} closed during login", session_id),
            };

            if self.verify(&password) {
                stream.write_all(b"\r\n").await?;
                tracing::info!("Session {} authenticated", session_id);
                return Ok(());
            }

            tracing::warn!(
                "Wrong password for session {} (attempt {}/{})",
                session_id,
                attempt,
                MAX_LOGIN_ATTEMPTS
            );
            stream.write_all(b"\r\nPermission denied\r\n").await?;
        }

        stream.shutdown().await.ok();
        anyhow::bail!("Session {} failed to authenticate", session_id)
    }
}

/// Read one line; `None` on EOF before any input.
///
/// Line breaks before the first character are skipped so `\r\n` from the
/// previous attempt does not count as an empty password.
async fn read_password<S>(stream: &mut S) -> Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        if stream.read(&mut byte).await? == 0 {
            return Ok((!line.is_empty()).then_some(line));
        }
        match byte[0] {
            b'\r' | b'\n' if line.is_empty() => continue,
            b'\r' | b'\n' => return Ok(Some(line)),
            // DEL and backspace
            0x7f | 0x08 => {
                line.pop();
            }
            b => {
                if line.len() >= MAX_PASSWORD_LEN {
                    anyhow::bail!("Password line too long");
                }
                line.push(b);
            }
        }
    }
}
