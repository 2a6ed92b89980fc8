//! Outbound control connection dialers
//!
//! A dialer establishes the transport to the tunnel endpoint and registers
//! the device on it, yielding a [`ReverseListener`]. Dialing and
//! registration together are bounded by the connect timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Config, Handle, Msg};
use russh::{Channel, ChannelId, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use tether_core::AuthContext;

use super::error::DialError;
use super::listener::{ListenerOptions, Registration, ReverseListener};

/// Buffer of the in-memory pipe between the SSH channel and the listener
const CHANNEL_PIPE_CAPACITY: usize = 64 * 1024;

/// Read size when pumping listener output into the SSH channel
const CHANNEL_WRITE_CHUNK: usize = 32 * 1024;

/// Establishes registered control connections
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial the tunnel endpoint and register with the given credentials
    async fn dial(&self, auth: &AuthContext) -> Result<ReverseListener, DialError>;
}

/// Settings shared by all dialers
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Fixed tunnel endpoint; the advertised SSH endpoint is used otherwise
    pub tunnel_address: Option<String>,
    /// Bound for dialing plus registration
    pub connect_timeout: Duration,
    /// Options for the resulting listener
    pub listener: ListenerOptions,
}

impl DialOptions {
    /// Endpoint to dial for the given identity
    pub fn address_for(&self, auth: &AuthContext) -> String {
        self.tunnel_address
            .clone()
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| auth.ssh_endpoint())
    }
}

impl From<&AuthContext> for Registration {
    fn from(auth: &AuthContext) -> Self {
        Self {
            token: auth.token.clone(),
            device_uid: auth.uid.clone(),
        }
    }
}

/// Plain TCP dialer
pub struct TcpDialer {
    options: DialOptions,
}

impl TcpDialer {
    /// Create a TCP dialer
    pub fn new(options: DialOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, auth: &AuthContext) -> Result<ReverseListener, DialError> {
        let address = self.options.address_for(auth);
        let timeout = self.options.connect_timeout;
        tracing::debug!("Connecting to {} over TCP", address);

        let attempt = async {
            let stream = TcpStream::connect(&address)
                .await
                .map_err(|source| DialError::Connect {
                    address: address.clone(),
                    source,
                })?;
            let _ = stream.set_nodelay(true);

            ReverseListener::negotiate(stream, auth.into(), self.options.listener.clone()).await
        };

        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| DialError::Timeout {
                address: address.clone(),
                timeout,
            })?
    }
}

/// Dialer carrying the control connection over an SSH session channel
/// authenticated with the device key
pub struct SshDialer {
    options: DialOptions,
    key: Arc<KeyPair>,
}

impl SshDialer {
    /// Create an SSH dialer
    pub fn new(options: DialOptions, key: Arc<KeyPair>) -> Self {
        Self { options, key }
    }

    async fn open_channel(&self, address: &str, user: &str) -> Result<DuplexStream, DialError> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let handler = ClientHandler {
            inbound: Some(inbound_tx),
        };

        let mut session = client::connect(Arc::new(Config::default()), address, handler)
            .await
            .map_err(|e| DialError::Ssh(format!("failed to connect to {}: {}", address, e)))?;

        tracing::debug!("Authenticating as '{}'", user);
        let authenticated = session
            .authenticate_publickey(user, Arc::clone(&self.key))
            .await
            .map_err(|e| DialError::Ssh(format!("authentication error: {}", e)))?;
        if !authenticated {
            return Err(DialError::AuthRejected(user.to_string()));
        }

        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| DialError::Ssh(format!("failed to open session channel: {}", e)))?;

        let (local, remote) = tokio::io::duplex(CHANNEL_PIPE_CAPACITY);
        let (remote_read, remote_write) = tokio::io::split(remote);

        tokio::spawn(feed_inbound(inbound_rx, remote_write));
        tokio::spawn(pump_outbound(remote_read, channel, session));

        Ok(local)
    }
}

#[async_trait]
impl Dialer for SshDialer {
    async fn dial(&self, auth: &AuthContext) -> Result<ReverseListener, DialError> {
        let address = self.options.address_for(auth);
        let timeout = self.options.connect_timeout;
        tracing::debug!("Connecting to {} over SSH", address);

        let attempt = async {
            let io = self.open_channel(&address, &auth.uid).await?;
            ReverseListener::negotiate(io, auth.into(), self.options.listener.clone()).await
        };

        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| DialError::Timeout {
                address: address.clone(),
                timeout,
            })?
    }
}

/// Copy channel data received by the SSH handler into the pipe
async fn feed_inbound(
    mut inbound: mpsc::UnboundedReceiver<Bytes>,
    mut pipe: WriteHalf<DuplexStream>,
) {
    while let Some(data) = inbound.recv().await {
        if pipe.write_all(&data).await.is_err() {
            return;
        }
    }
    let _ = pipe.shutdown().await;
}

/// Copy listener output into the SSH channel until the listener lets go
async fn pump_outbound(
    mut pipe: ReadHalf<DuplexStream>,
    channel: Channel<Msg>,
    session: Handle<ClientHandler>,
) {
    let mut buf = vec![0u8; CHANNEL_WRITE_CHUNK];

    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Err(e) = channel.data(&buf[..n]).await {
                    tracing::debug!("SSH channel write failed: {}", e);
                    break;
                }
            }
        }
    }

    let _ = channel.eof().await;
    let _ = session
        .disconnect(Disconnect::ByApplication, "closing", "en")
        .await;
}

/// SSH client handler for the control channel
struct ClientHandler {
    /// Channel data destined for the listener; dropped on close
    inbound: Option<mpsc::UnboundedSender<Bytes>>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    /// The server is identified by the management API that handed out the
    /// endpoint; the key is logged for diagnostics only.
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Server host key: {}", server_public_key.fingerprint());
        Ok(true)
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        if let Some(inbound) = &self.inbound {
            if inbound.send(Bytes::copy_from_slice(data)).is_err() {
                self.inbound = None;
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Control channel EOF");
        self.inbound = None;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        _channel: ChannelId,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Control channel closed");
        self.inbound = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tether_protocol::{Frame, FrameCodec, Message};
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    fn auth() -> AuthContext {
        AuthContext {
            uid: "uid-1".into(),
            token: "tok".into(),
            namespace: "acme".into(),
            tenant_name: "dev".into(),
            device_name: "dev".into(),
            ssh_host: "ssh.example.com".into(),
            ssh_port: 22,
        }
    }

    fn options(address: String, timeout: Duration) -> DialOptions {
        DialOptions {
            tunnel_address: Some(address),
            connect_timeout: timeout,
            listener: ListenerOptions::default(),
        }
    }

    #[test]
    fn test_address_defaults_to_ssh_endpoint() {
        let options = DialOptions {
            tunnel_address: None,
            connect_timeout: Duration::from_secs(1),
            listener: ListenerOptions::default(),
        };
        assert_eq!(options.address_for(&auth()), "ssh.example.com:22");

        let options = DialOptions {
            tunnel_address: Some("10.0.0.1:7000".into()),
            ..options
        };
        assert_eq!(options.address_for(&auth()), "10.0.0.1:7000");
    }

    #[tokio::test]
    async fn test_tcp_dial_registers() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = server.local_addr().unwrap().to_string();

        let accept = tokio::spawn(async move {
            let (socket, _) = server.accept().await.unwrap();
            let mut framed = Framed::new(socket, FrameCodec::new());
            let frame = framed.next().await.unwrap().unwrap();
            let Message::Register { token, device_uid, .. } = frame.message else {
                panic!("expected Register");
            };
            framed
                .send(Frame::control(Message::RegisterAck {
                    accepted: true,
                    reason: None,
                }))
                .await
                .unwrap();
            (token, device_uid, framed)
        });

        let dialer = TcpDialer::new(options(address, Duration::from_secs(5)));
        let _listener = dialer.dial(&auth()).await.unwrap();

        let (token, uid, _framed) = accept.await.unwrap();
        assert_eq!(token, "tok");
        assert_eq!(uid, "uid-1");
    }

    #[tokio::test]
    async fn test_tcp_dial_refused() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = server.local_addr().unwrap().to_string();
        drop(server);

        let dialer = TcpDialer::new(options(address, Duration::from_secs(5)));
        assert!(matches!(
            dialer.dial(&auth()).await,
            Err(DialError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn test_tcp_dial_times_out_on_silent_server() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = server.local_addr().unwrap().to_string();

        let _hold = tokio::spawn(async move {
            let (socket, _) = server.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(socket);
        });

        let dialer = TcpDialer::new(options(address, Duration::from_millis(200)));
        assert!(matches!(
            dialer.dial(&auth()).await,
            Err(DialError::Timeout { .. })
        ));
    }
}
