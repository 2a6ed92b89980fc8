//! Virtual HTTP requests
//!
//! Every virtual connection carries exactly one HTTP/1.x request. Only the
//! head is parsed; the connection stays owned by the request until it is
//! either answered or hijacked, and any body bytes read past the head are
//! handed over with the hijacked stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Upper bound for a request head
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Upper bound for the number of request headers
const MAX_HEADERS: usize = 64;

/// Failure to read a request head
#[derive(Debug, Error)]
pub enum RequestError {
    /// The peer closed the connection before sending anything
    #[error("connection closed before a request was sent")]
    Empty,

    /// The peer closed the connection in the middle of the head
    #[error("connection closed in the middle of the request head")]
    Incomplete,

    /// The head exceeds [`MAX_HEAD_SIZE`]
    #[error("request head exceeds {MAX_HEAD_SIZE} bytes")]
    HeadTooLarge,

    /// Not a valid HTTP/1.x request head
    #[error("malformed request: {0}")]
    Malformed(String),

    /// I/O error on the virtual connection
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<httparse::Error> for RequestError {
    fn from(e: httparse::Error) -> Self {
        RequestError::Malformed(e.to_string())
    }
}

/// Failure to take over the raw connection
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HijackError {
    /// The connection was already used to write a response
    #[error("connection does not support hijacking after a response was written")]
    Unsupported,

    /// The connection was hijacked before
    #[error("connection already hijacked")]
    AlreadyHijacked,
}

/// Parsed request line and headers
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method
    pub method: Method,
    /// Raw request target as sent
    pub target: String,
    /// Minor HTTP version (`0` or `1`)
    pub version: u8,
    /// Request headers
    pub headers: HeaderMap,
}

impl RequestHead {
    fn from_parsed(req: &httparse::Request<'_, '_>) -> Result<Self, RequestError> {
        let method = req
            .method
            .ok_or_else(|| RequestError::Malformed("missing method".to_string()))?;
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| RequestError::Malformed(e.to_string()))?;
        let target = req
            .path
            .ok_or_else(|| RequestError::Malformed("missing request target".to_string()))?
            .to_string();

        let mut headers = HeaderMap::with_capacity(req.headers.len());
        for header in req.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|e| RequestError::Malformed(e.to_string()))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|e| RequestError::Malformed(e.to_string()))?;
            headers.append(name, value);
        }

        Ok(Self {
            method,
            target,
            version: req.version.unwrap_or(1),
            headers,
        })
    }

    /// Path component of the request target
    pub fn path(&self) -> &str {
        match self.target.find('?') {
            Some(i) => &self.target[..i],
            None => &self.target,
        }
    }

    /// Header value as text; empty if absent or not valid UTF-8
    pub fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }
}

enum Connection<S> {
    Open(S),
    Hijacked,
    Responded,
}

/// One request received on a virtual connection
pub struct VirtualRequest<S> {
    head: RequestHead,
    remote_addr: String,
    buffered: Bytes,
    conn: Connection<S>,
}

impl<S> VirtualRequest<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read and parse a request head from `stream`.
    pub async fn read_from(
        mut stream: S,
        remote_addr: impl Into<String>,
    ) -> Result<Self, RequestError> {
        let mut buf = BytesMut::with_capacity(4096);

        loop {
            if stream.read_buf(&mut buf).await? == 0 {
                return Err(if buf.is_empty() {
                    RequestError::Empty
                } else {
                    RequestError::Incomplete
                });
            }

            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut req = httparse::Request::new(&mut headers);
            let parsed = match req.parse(&buf)? {
                httparse::Status::Complete(len) => Some((RequestHead::from_parsed(&req)?, len)),
                httparse::Status::Partial => None,
            };

            match parsed {
                Some((head, len)) => {
                    buf.advance(len);
                    return Ok(Self {
                        head,
                        remote_addr: remote_addr.into(),
                        buffered: buf.freeze(),
                        conn: Connection::Open(stream),
                    });
                }
                None if buf.len() >= MAX_HEAD_SIZE => return Err(RequestError::HeadTooLarge),
                None => {}
            }
        }
    }

    /// Parsed request head
    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    /// Address of the client on the server side
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Body bytes read together with the head
    pub fn buffered(&self) -> &Bytes {
        &self.buffered
    }

    /// Take over the raw connection, including any buffered body bytes.
    pub fn hijack(&mut self) -> Result<RawStream<S>, HijackError> {
        match std::mem::replace(&mut self.conn, Connection::Hijacked) {
            Connection::Open(stream) => Ok(RawStream {
                prefix: std::mem::take(&mut self.buffered),
                inner: stream,
            }),
            Connection::Hijacked => Err(HijackError::AlreadyHijacked),
            Connection::Responded => {
                self.conn = Connection::Responded;
                Err(HijackError::Unsupported)
            }
        }
    }

    /// Write a plain-text response and close the connection.
    ///
    /// Does nothing if the connection was hijacked or answered already.
    pub async fn respond(&mut self, status: StatusCode, body: &str) -> io::Result<()> {
        let mut stream = match std::mem::replace(&mut self.conn, Connection::Responded) {
            Connection::Open(stream) => stream,
            other => {
                self.conn = other;
                return Ok(());
            }
        };

        let response = if body.is_empty() {
            encode_response(status, None, "")
        } else {
            // Plain-text error body, newline terminated
            encode_response(status, Some("text/plain; charset=utf-8"), &format!("{}\n", body))
        };

        stream.write_all(&response).await?;
        stream.shutdown().await
    }
}

fn encode_response(status: StatusCode, content_type: Option<&str>, body: &str) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    if let Some(content_type) = content_type {
        out.push_str(&format!("{}: {}\r\n", CONTENT_TYPE, content_type));
        out.push_str("x-content-type-options: nosniff\r\n");
    }
    out.push_str(&format!("{}: {}\r\n", CONTENT_LENGTH, body.len()));
    out.push_str("connection: close\r\n\r\n");
    out.push_str(body);
    out.into_bytes()
}

/// A hijacked connection.
///
/// Reads first drain the bytes that were buffered while parsing the head.
pub struct RawStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> RawStream<S> {
    /// The underlying connection
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Split into the connection and the buffered bytes not read yet
    pub fn into_parts(self) -> (S, Bytes) {
        (self.inner, self.prefix)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RawStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RawStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn request(raw: &[u8]) -> VirtualRequest<tokio::io::DuplexStream> {
        let (mut client, server) = duplex(64 * 1024);
        client.write_all(raw).await.unwrap();
        VirtualRequest::read_from(server, "203.0.113.9:1234").await.unwrap()
    }

    #[tokio::test]
    async fn test_parse_head_and_buffered_body() {
        let req = request(
            b"POST /ssh/http?x=1 HTTP/1.1\r\nHost: device\r\nX-Path: /status\r\nContent-Length: 4\r\n\r\nbody",
        )
        .await;

        assert_eq!(req.head().method, Method::POST);
        assert_eq!(req.head().target, "/ssh/http?x=1");
        assert_eq!(req.head().path(), "/ssh/http");
        assert_eq!(req.head().header("x-path"), "/status");
        assert_eq!(req.head().header("x-namespace"), "");
        assert_eq!(&req.buffered()[..], b"body");
        assert_eq!(req.remote_addr(), "203.0.113.9:1234");
    }

    #[tokio::test]
    async fn test_head_split_across_reads() {
        let (mut client, server) = duplex(1024);
        let reader = tokio::spawn(VirtualRequest::read_from(server, ""));

        client.write_all(b"GET /ssh/abc HT").await.unwrap();
        tokio::task::yield_now().await;
        client.write_all(b"TP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

        let req = reader.await.unwrap().unwrap();
        assert_eq!(req.head().path(), "/ssh/abc");
        assert!(req.buffered().is_empty());
    }

    #[tokio::test]
    async fn test_empty_and_incomplete() {
        let (client, server) = duplex(1024);
        drop(client);
        assert!(matches!(
            VirtualRequest::read_from(server, "").await,
            Err(RequestError::Empty)
        ));

        let (mut client, server) = duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        drop(client);
        assert!(matches!(
            VirtualRequest::read_from(server, "").await,
            Err(RequestError::Incomplete)
        ));
    }

    #[tokio::test]
    async fn test_head_too_large() {
        let (mut client, server) = duplex(64 * 1024);
        let mut raw = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_SIZE));
        client.write_all(&raw).await.unwrap();

        assert!(matches!(
            VirtualRequest::read_from(server, "").await,
            Err(RequestError::HeadTooLarge)
        ));
    }

    #[tokio::test]
    async fn test_hijack_yields_buffered_bytes_first() {
        let (mut client, server) = duplex(1024);
        client
            .write_all(b"GET /ssh/abc HTTP/1.1\r\n\r\nearly")
            .await
            .unwrap();
        let mut req = VirtualRequest::read_from(server, "").await.unwrap();

        let mut raw = req.hijack().unwrap();
        assert_eq!(req.hijack().err(), Some(HijackError::AlreadyHijacked));

        client.write_all(b" late").await.unwrap();
        let mut buf = [0u8; 10];
        raw.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early late");
    }

    #[tokio::test]
    async fn test_respond_plain_text_error() {
        let (mut client, server) = duplex(4096);
        client.write_all(b"GET /nope HTTP/1.1\r\n\r\n").await.unwrap();
        let mut req = VirtualRequest::read_from(server, "").await.unwrap();

        req.respond(StatusCode::NOT_FOUND, "404 page not found")
            .await
            .unwrap();
        assert_eq!(req.hijack().err(), Some(HijackError::Unsupported));

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(response.contains("content-type: text/plain; charset=utf-8\r\n"));
        assert!(response.contains("x-content-type-options: nosniff\r\n"));
        assert!(response.contains("content-length: 19\r\n"));
        assert!(response.ends_with("\r\n\r\n404 page not found\n"));
    }

    #[tokio::test]
    async fn test_empty_ok_response() {
        let (mut client, server) = duplex(4096);
        client
            .write_all(b"GET /ssh/close/abc HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut req = VirtualRequest::read_from(server, "").await.unwrap();
        req.respond(StatusCode::OK, "").await.unwrap();

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert_eq!(
            response,
            "HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
        );
    }
}
