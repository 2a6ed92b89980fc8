//! Session subsystem trait

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A full-duplex byte stream
pub trait RawIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawIo for T {}

/// Owned raw stream handed to the session subsystem
pub type BoxedStream = Box<dyn RawIo>;

/// Consumer of raw session streams (terminal, SFTP, ...)
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Serve one interactive session until it ends.
    ///
    /// The stream is closed by the caller once this returns, whatever the
    /// outcome.
    async fn handle(&self, stream: BoxedStream, session_id: &str) -> anyhow::Result<()>;

    /// Update the device name shown to session users
    fn set_device_name(&self, _name: &str) {}
}
