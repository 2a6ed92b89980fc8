//! HTTP proxy bridge
//!
//! Forwards one virtual request to the local HTTP service and streams the
//! raw response back. The local service is dialed fresh for every request
//! and always asked to close the connection afterwards.

use std::io;
use std::time::Duration;

use http::header::{HeaderName, CONNECTION};
use http::{StatusCode, Uri};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::http::{HijackError, RequestHead, VirtualRequest};
use crate::tunnel::VirtualStream;

/// Header carrying the path and query to request from the local service
pub const X_PATH: &str = "x-path";

/// Header carrying the namespace of the requesting user
pub const X_NAMESPACE: &str = "x-namespace";

/// Connection-scoped headers replaced by `Connection: close`
const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "proxy-connection"];

/// Where and how to reach the local HTTP service
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address of the local service
    pub local_address: String,
    /// Bound for connecting to it
    pub connect_timeout: Duration,
}

/// Failures before the client connection is taken over
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("missing X-Path header")]
    MissingPath,

    #[error("failed to parse URL {0:?}")]
    InvalidPath(String),

    #[error("failed to connect to the HTTP server on device at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to the HTTP server on device at {0}")]
    ConnectTimeout(String),

    #[error("failed to write request to the server on device: {0}")]
    Write(#[source] io::Error),

    #[error("failed to hijack connection: {0}")]
    Hijack(#[from] HijackError),
}

impl ProxyError {
    /// Status returned to the client
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MissingPath => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Serve one proxied request end to end.
pub async fn proxy(mut request: VirtualRequest<VirtualStream>, config: &ProxyConfig) {
    let remote = request.remote_addr().to_string();
    let namespace = request.head().header(X_NAMESPACE).to_string();
    let path = request.head().header(X_PATH).to_string();

    let (client, upstream) = match connect(&mut request, config).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(
                remote = %remote,
                namespace = %namespace,
                path = %path,
                "Proxy request failed: {}",
                e
            );
            let body = format!(
                "{} (remote: {}, namespace: {}, path: {})",
                e, remote, namespace, path
            );
            let _ = request.respond(e.status(), &body).await;
            return;
        }
    };

    match exchange(client, upstream).await {
        Ok(bytes) => tracing::debug!(path = %path, "Proxied {} response bytes", bytes),
        Err(e) if is_disconnect(&e) => {
            tracing::debug!(remote = %remote, path = %path, "Proxy exchange cut short: {}", e)
        }
        Err(e) => tracing::warn!(
            remote = %remote,
            namespace = %namespace,
            path = %path,
            "Failed to copy response from device service to client: {}",
            e
        ),
    }
}

/// Dial the local service, forward the head and take over the client.
async fn connect(
    request: &mut VirtualRequest<VirtualStream>,
    config: &ProxyConfig,
) -> Result<(VirtualStream, TcpStream), ProxyError> {
    let target = resolve_target(request.head().header(X_PATH))?;

    let mut upstream = tokio::time::timeout(
        config.connect_timeout,
        TcpStream::connect(&config.local_address),
    )
    .await
    .map_err(|_| ProxyError::ConnectTimeout(config.local_address.clone()))?
    .map_err(|source| ProxyError::Connect {
        address: config.local_address.clone(),
        source,
    })?;

    let head = rewrite_head(request.head(), &target);
    upstream.write_all(&head).await.map_err(ProxyError::Write)?;
    if !request.buffered().is_empty() {
        upstream
            .write_all(request.buffered())
            .await
            .map_err(ProxyError::Write)?;
    }

    // The buffered body went out with the head
    let (client, _) = request.hijack()?.into_parts();
    Ok((client, upstream))
}

/// Path and query to request from the local service
fn resolve_target(x_path: &str) -> Result<String, ProxyError> {
    if x_path.is_empty() {
        return Err(ProxyError::MissingPath);
    }

    let candidate = if x_path.starts_with('/') || x_path.contains("://") {
        x_path.to_string()
    } else {
        format!("/{}", x_path)
    };

    let uri: Uri = candidate
        .parse()
        .map_err(|_| ProxyError::InvalidPath(x_path.to_string()))?;

    Ok(uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| pq.starts_with('/'))
        .unwrap_or("/")
        .to_string())
}

/// Request head for the local service with the target replaced
fn rewrite_head(head: &RequestHead, target: &str) -> Vec<u8> {
    let mut out = format!("{} {} HTTP/1.{}\r\n", head.method, target, head.version).into_bytes();

    for (name, value) in head.headers.iter() {
        if is_hop_by_hop(name) {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(CONNECTION.as_str().as_bytes());
    out.extend_from_slice(b": close\r\n\r\n");
    out
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Copy the response to the client while streaming the rest of the request
/// body upstream. Finishes when the local service is done answering.
async fn exchange<C>(client: C, upstream: TcpStream) -> io::Result<u64>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let upload = async {
        if let Err(e) = tokio::io::copy(&mut client_read, &mut upstream_write).await {
            tracing::trace!("Request body upload stopped: {}", e);
        }
        let _ = upstream_write.shutdown().await;
        std::future::pending::<io::Result<u64>>().await
    };

    let download = async {
        let n = tokio::io::copy(&mut upstream_read, &mut client_write).await?;
        client_write.shutdown().await?;
        Ok::<_, io::Error>(n)
    };

    tokio::select! {
        result = download => result,
        result = upload => result,
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}
