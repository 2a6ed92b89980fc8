//! Virtual streams carried by the control connection
//!
//! A [`VirtualStream`] is what the reverse listener hands out for every
//! connection the server opens on the device's behalf. Reads are fed by
//! the connection driver; writes are queued as `Data` frames on the shared
//! outbound channel. A cloneable [`StreamHandle`] can close the stream from
//! outside the task that owns it.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use tether_protocol::StreamId;

/// Largest chunk of stream data put into a single frame
pub const MAX_DATA_CHUNK: usize = 32 * 1024;

/// Work queued for the connection driver by streams and handles
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Bytes written to a stream
    Data(StreamId, Bytes),
    /// The local side closed a stream
    Close(StreamId),
}

/// State shared between a stream, its handles and the driver
#[derive(Debug, Default)]
pub(crate) struct StreamState {
    closed: AtomicBool,
}

impl StreamState {
    /// Mark the stream closed; returns true only for the first caller
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Cloneable close capability for a virtual stream
#[derive(Debug, Clone)]
pub struct StreamHandle {
    id: StreamId,
    state: Arc<StreamState>,
    outbound: mpsc::Sender<Outbound>,
}

impl StreamHandle {
    pub(crate) fn new(id: StreamId, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            state: Arc::new(StreamState::default()),
            outbound,
        }
    }

    /// Stream id on the control connection
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Whether either side has closed the stream
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Whether both handles refer to the same stream
    pub fn same_stream(&self, other: &StreamHandle) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Close the stream. Idempotent.
    ///
    /// The reader sees EOF once the driver processes the close, writes
    /// fail immediately, and the server is sent a `StreamClose`.
    pub fn shutdown(&self) {
        if !self.state.mark_closed() {
            return;
        }

        match self.outbound.try_send(Outbound::Close(self.id)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(close)) => {
                // Queue is saturated; still enqueue behind the pending data
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let outbound = self.outbound.clone();
                    runtime.spawn(async move {
                        let _ = outbound.send(close).await;
                    });
                }
            }
            // Driver is gone, the whole connection is closed already
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub(crate) fn state(&self) -> &StreamState {
        &self.state
    }
}

/// One virtual connection accepted from the server
pub struct VirtualStream {
    handle: StreamHandle,
    remote_addr: String,
    inbound: mpsc::Receiver<Bytes>,
    pending: Bytes,
    writer: PollSender<Outbound>,
}

impl VirtualStream {
    pub(crate) fn new(
        handle: StreamHandle,
        remote_addr: String,
        inbound: mpsc::Receiver<Bytes>,
    ) -> Self {
        let writer = PollSender::new(handle.outbound.clone());
        Self {
            handle,
            remote_addr,
            inbound,
            pending: Bytes::new(),
            writer,
        }
    }

    /// Stream id on the control connection
    pub fn id(&self) -> StreamId {
        self.handle.id
    }

    /// Address of the peer that opened this connection on the server side
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// A handle that can close this stream from elsewhere
    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }
}

impl std::fmt::Debug for VirtualStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualStream")
            .field("id", &self.handle.id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.handle.is_closed())
            .finish()
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "virtual stream closed")
}

impl AsyncRead for VirtualStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match ready!(this.inbound.poll_recv(cx)) {
                Some(chunk) => this.pending = chunk,
                // Sender dropped: peer closed, local close processed, or connection lost
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for VirtualStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.handle.is_closed() {
            return Poll::Ready(Err(broken_pipe()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        ready!(this.writer.poll_reserve(cx)).map_err(|_| broken_pipe())?;

        // Closed while waiting for capacity
        if this.handle.is_closed() {
            this.writer.abort_send();
            return Poll::Ready(Err(broken_pipe()));
        }

        let n = buf.len().min(MAX_DATA_CHUNK);
        this.writer
            .send_item(Outbound::Data(this.handle.id, Bytes::copy_from_slice(&buf[..n])))
            .map_err(|_| broken_pipe())?;

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.handle.shutdown();
        Poll::Ready(Ok(()))
    }
}

impl Drop for VirtualStream {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}
