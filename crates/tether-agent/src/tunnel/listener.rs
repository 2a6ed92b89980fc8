//! Reverse listener over the control connection
//!
//! After registration the control connection behaves like the device's
//! listening socket: the server opens virtual streams on it and
//! [`ReverseListener::accept`] hands them out one by one. A single driver
//! task owns the connection, so stream bookkeeping needs no locks.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::Framed;

use tether_core::time::{current_time_millis, elapsed_since};
use tether_protocol::{ErrorCode, Frame, FrameCodec, Message, StreamId, PROTOCOL_VERSION};

use super::error::{DialError, TunnelError};
use super::stream::{Outbound, StreamHandle, VirtualStream};

/// Capacity of the outbound frame queue shared by all streams.
///
/// Writers wait for capacity, so this bounds memory when the uplink is
/// slower than the local producers.
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Data chunks buffered per stream before its reader is considered stuck.
///
/// A stream that falls this far behind is reset so one slow session never
/// stalls the connection or grows without bound.
const STREAM_INBOUND_CAPACITY: usize = 64;

/// Streams opened by the server but not yet accepted
const ACCEPT_BACKLOG: usize = 64;

/// Missed keep-alive periods before the connection is declared dead
const KEEPALIVE_TOLERANCE: u32 = 3;

/// Options for a negotiated listener
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// Interval between heartbeats sent to the server
    pub keepalive_interval: Duration,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

/// Credentials presented when registering the control connection
#[derive(Debug, Clone)]
pub struct Registration {
    /// Device token
    pub token: String,
    /// Device UID
    pub device_uid: String,
}

/// A control connection turned into a source of virtual connections
pub struct ReverseListener {
    incoming: mpsc::Receiver<VirtualStream>,
    driver: Option<JoinHandle<TunnelError>>,
}

impl ReverseListener {
    /// Register on an established transport and start serving it.
    pub async fn negotiate<T>(
        io: T,
        registration: Registration,
        options: ListenerOptions,
    ) -> Result<Self, DialError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut framed = Framed::new(io, FrameCodec::new());

        framed
            .send(Frame::control(Message::Register {
                token: registration.token,
                device_uid: registration.device_uid,
                version: Some(PROTOCOL_VERSION.to_string()),
            }))
            .await?;

        match framed.next().await {
            Some(Ok(Frame {
                message: Message::RegisterAck { accepted: true, .. },
                ..
            })) => {
                tracing::debug!("Registration accepted");
            }
            Some(Ok(Frame {
                message: Message::RegisterAck { accepted: false, reason },
                ..
            })) => {
                return Err(DialError::Rejected(
                    reason.unwrap_or_else(|| "no reason given".to_string()),
                ));
            }
            Some(Ok(frame)) => {
                return Err(DialError::Negotiation(format!(
                    "expected registration ack, got {:?}",
                    frame.message.message_type()
                )));
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(DialError::Negotiation(
                    "connection closed during registration".to_string(),
                ));
            }
        }

        Ok(Self::spawn(framed, options))
    }

    fn spawn<T>(framed: Framed<T, FrameCodec>, options: ListenerOptions) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, frames) = framed.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let (accept_tx, incoming) = mpsc::channel(ACCEPT_BACKLOG);

        let driver = Driver {
            sink,
            streams: HashMap::new(),
            outbound_tx,
            outbound_rx,
            accept_tx,
            keepalive: options.keepalive_interval,
        };

        Self {
            incoming,
            driver: Some(tokio::spawn(driver.run(frames))),
        }
    }

    /// Wait for the next virtual connection.
    ///
    /// Returns the reason once the control connection is gone; the
    /// listener never reconnects by itself.
    pub async fn accept(&mut self) -> Result<VirtualStream, TunnelError> {
        if let Some(stream) = self.incoming.recv().await {
            return Ok(stream);
        }

        match self.driver.take() {
            Some(driver) => match driver.await {
                Ok(reason) => Err(reason),
                Err(e) => Err(TunnelError::Driver(e.to_string())),
            },
            None => Err(TunnelError::Closed),
        }
    }
}

impl Drop for ReverseListener {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// Per-stream routing entry
struct Slot {
    inbound: mpsc::Sender<Bytes>,
    handle: StreamHandle,
}

/// Owns the control connection and all stream bookkeeping
struct Driver<T> {
    sink: SplitSink<Framed<T, FrameCodec>, Frame>,
    streams: HashMap<StreamId, Slot>,
    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: mpsc::Receiver<Outbound>,
    accept_tx: mpsc::Sender<VirtualStream>,
    keepalive: Duration,
}

impl<T> Driver<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn run(mut self, mut frames: SplitStream<Framed<T, FrameCodec>>) -> TunnelError {
        let period = self.keepalive;
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        let reason = loop {
            tokio::select! {
                frame = frames.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => break e.into(),
                        None => break TunnelError::Closed,
                    };
                    last_seen = Instant::now();
                    if let Err(e) = self.handle_frame(frame).await {
                        break e;
                    }
                }
                Some(outbound) = self.outbound_rx.recv() => {
                    if let Err(e) = self.handle_outbound(outbound).await {
                        break e;
                    }
                }
                _ = keepalive.tick() => {
                    let silent = last_seen.elapsed();
                    if silent >= period * KEEPALIVE_TOLERANCE {
                        break TunnelError::KeepaliveTimeout(silent);
                    }
                    let heartbeat = Message::Heartbeat { timestamp: current_time_millis() };
                    if let Err(e) = self.send(Frame::control(heartbeat)).await {
                        break e;
                    }
                }
            }
        };

        tracing::debug!(
            "Control connection driver stopping with {} open streams: {}",
            self.streams.len(),
            reason
        );
        for slot in self.streams.values() {
            slot.handle.state().mark_closed();
        }

        reason
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), TunnelError> {
        let id = frame.stream_id;

        match frame.message {
            Message::StreamOpen { remote_addr } => self.open_stream(id, remote_addr).await,

            Message::Data(data) => self.deliver(id, data).await,

            Message::StreamClose => {
                if let Some(slot) = self.streams.remove(&id) {
                    slot.handle.state().mark_closed();
                    tracing::debug!("Server closed {}", id);
                }
                Ok(())
            }

            Message::Heartbeat { timestamp } => {
                self.send(Frame::control(Message::HeartbeatAck { timestamp }))
                    .await
            }

            Message::HeartbeatAck { timestamp } => {
                tracing::trace!("Heartbeat round trip {:?}", elapsed_since(timestamp));
                Ok(())
            }

            Message::Error { code, message } => {
                tracing::warn!("Server reported error on {}: {:?} {}", id, code, message);
                Ok(())
            }

            other => {
                let kind = other.message_type();
                tracing::warn!("Unexpected {:?} from server on {}", kind, id);
                self.report(id, ErrorCode::InvalidMessage, format!("unexpected {:?}", kind))
                    .await
            }
        }
    }

    async fn open_stream(&mut self, id: StreamId, remote_addr: String) -> Result<(), TunnelError> {
        if self.streams.contains_key(&id) {
            tracing::warn!("Server opened {} which is already in use", id);
            return self
                .report(id, ErrorCode::StreamExists, format!("{} is already open", id))
                .await;
        }

        let handle = StreamHandle::new(id, self.outbound_tx.clone());
        let (inbound, inbound_rx) = mpsc::channel(STREAM_INBOUND_CAPACITY);
        let stream = VirtualStream::new(handle.clone(), remote_addr, inbound_rx);
        self.streams.insert(id, Slot { inbound, handle });

        tracing::trace!("Server opened {}", id);
        self.accept_tx
            .send(stream)
            .await
            .map_err(|_| TunnelError::Driver("listener dropped".to_string()))
    }

    /// Hand data to the stream's reader without ever waiting on it
    async fn deliver(&mut self, id: StreamId, data: Bytes) -> Result<(), TunnelError> {
        let Some(slot) = self.streams.get(&id) else {
            tracing::debug!("Dropping {} bytes for unknown {}", data.len(), id);
            return self
                .report(id, ErrorCode::StreamNotFound, format!("{} is not open", id))
                .await;
        };

        match slot.inbound.try_send(data) {
            Ok(()) => Ok(()),
            // A dropped reader already queued its own close
            Err(TrySendError::Closed(_)) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    "Resetting {}: reader is {} chunks behind",
                    id,
                    STREAM_INBOUND_CAPACITY
                );
                self.reset(id).await
            }
        }
    }

    /// Close one stream from the agent side after reporting an overflow.
    ///
    /// The reader still drains what was buffered, then sees EOF.
    async fn reset(&mut self, id: StreamId) -> Result<(), TunnelError> {
        if let Some(slot) = self.streams.remove(&id) {
            slot.handle.state().mark_closed();
        }
        self.report(
            id,
            ErrorCode::StreamOverflow,
            format!("{} reader fell behind", id),
        )
        .await?;
        self.send(Frame::close(id)).await
    }

    async fn report(
        &mut self,
        id: StreamId,
        code: ErrorCode,
        message: String,
    ) -> Result<(), TunnelError> {
        self.send(Frame::new(id, Message::Error { code, message })).await
    }

    async fn handle_outbound(&mut self, outbound: Outbound) -> Result<(), TunnelError> {
        match outbound {
            Outbound::Data(id, data) => {
                // Discard writes racing with a close from the server
                if self.streams.contains_key(&id) {
                    self.send(Frame::data(id, data)).await?;
                }
                Ok(())
            }
            Outbound::Close(id) => {
                if self.streams.remove(&id).is_some() {
                    tracing::trace!("Closing {}", id);
                    self.send(Frame::close(id)).await?;
                }
                Ok(())
            }
        }
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TunnelError> {
        self.sink.send(frame).await.map_err(TunnelError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    type ServerSide = Framed<DuplexStream, FrameCodec>;

    async fn accept_registration(server: &mut ServerSide, accepted: bool) {
        match server.next().await {
            Some(Ok(Frame {
                message: Message::Register { token, .. },
                ..
            })) => assert_eq!(token, "tok"),
            other => panic!("expected Register, got {:?}", other),
        }
        server
            .send(Frame::control(Message::RegisterAck {
                accepted,
                reason: (!accepted).then(|| "device not accepted".to_string()),
            }))
            .await
            .unwrap();
    }

    fn registration() -> Registration {
        Registration {
            token: "tok".to_string(),
            device_uid: "uid".to_string(),
        }
    }

    async fn connected_pair() -> (ReverseListener, ServerSide) {
        let (agent_io, server_io) = tokio::io::duplex(64 * 1024);
        let mut server = Framed::new(server_io, FrameCodec::new());

        let (listener, _) = tokio::join!(
            ReverseListener::negotiate(agent_io, registration(), ListenerOptions::default()),
            accept_registration(&mut server, true),
        );
        (listener.unwrap(), server)
    }

    #[tokio::test]
    async fn test_registration_rejected() {
        let (agent_io, server_io) = tokio::io::duplex(4096);
        let mut server = Framed::new(server_io, FrameCodec::new());

        let (result, _) = tokio::join!(
            ReverseListener::negotiate(agent_io, registration(), ListenerOptions::default()),
            accept_registration(&mut server, false),
        );

        match result {
            Err(DialError::Rejected(reason)) => assert_eq!(reason, "device not accepted"),
            other => panic!("expected rejection, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_accept_and_exchange_data() {
        let (mut listener, mut server) = connected_pair().await;

        server
            .send(Frame::new(
                StreamId::new(1),
                Message::StreamOpen {
                    remote_addr: "198.51.100.7:5000".to_string(),
                },
            ))
            .await
            .unwrap();
        server
            .send(Frame::data(StreamId::new(1), Bytes::from_static(b"ping")))
            .await
            .unwrap();

        let mut stream = listener.accept().await.unwrap();
        assert_eq!(stream.id(), StreamId::new(1));
        assert_eq!(stream.remote_addr(), "198.51.100.7:5000");

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        stream.write_all(b"pong").await.unwrap();
        let frame = server.next().await.unwrap().unwrap();
        assert_eq!(frame, Frame::data(StreamId::new(1), Bytes::from_static(b"pong")));

        drop(stream);
        let frame = server.next().await.unwrap().unwrap();
        assert_eq!(frame, Frame::close(StreamId::new(1)));
    }

    #[tokio::test]
    async fn test_server_close_gives_eof() {
        let (mut listener, mut server) = connected_pair().await;

        server
            .send(Frame::new(
                StreamId::new(5),
                Message::StreamOpen {
                    remote_addr: String::new(),
                },
            ))
            .await
            .unwrap();
        server.send(Frame::close(StreamId::new(5))).await.unwrap();

        let mut stream = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        assert!(stream.write_all(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_is_answered() {
        let (_listener, mut server) = connected_pair().await;

        server
            .send(Frame::control(Message::Heartbeat { timestamp: 77 }))
            .await
            .unwrap();

        let frame = server.next().await.unwrap().unwrap();
        assert_eq!(frame, Frame::control(Message::HeartbeatAck { timestamp: 77 }));
    }

    #[tokio::test]
    async fn test_accept_fails_when_connection_drops() {
        let (mut listener, server) = connected_pair().await;
        drop(server);

        assert!(matches!(listener.accept().await, Err(TunnelError::Closed)));
        assert!(matches!(listener.accept().await, Err(TunnelError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_timeout() {
        let (agent_io, server_io) = tokio::io::duplex(64 * 1024);
        let mut server = Framed::new(server_io, FrameCodec::new());
        let options = ListenerOptions {
            keepalive_interval: Duration::from_secs(30),
        };

        let (listener, _) = tokio::join!(
            ReverseListener::negotiate(agent_io, registration(), options),
            accept_registration(&mut server, true),
        );
        let mut listener = listener.unwrap();

        // Server stays silent but keeps its end open
        let result = listener.accept().await;
        assert!(matches!(result, Err(TunnelError::KeepaliveTimeout(d)) if d >= Duration::from_secs(90)));
        drop(server);
    }

    #[tokio::test]
    async fn test_duplicate_open_reports_error() {
        let (mut listener, mut server) = connected_pair().await;

        for _ in 0..2 {
            server
                .send(Frame::new(
                    StreamId::new(3),
                    Message::StreamOpen {
                        remote_addr: String::new(),
                    },
                ))
                .await
                .unwrap();
        }

        let _stream = listener.accept().await.unwrap();
        let frame = server.next().await.unwrap().unwrap();
        assert!(matches!(
            frame.message,
            Message::Error {
                code: ErrorCode::StreamExists,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_data_for_unknown_stream_reports_error() {
        let (mut listener, mut server) = connected_pair().await;

        server
            .send(Frame::data(StreamId::new(40), Bytes::from_static(b"late")))
            .await
            .unwrap();
        server.send(Frame::close(StreamId::new(40))).await.unwrap();
        server
            .send(Frame::new(
                StreamId::new(41),
                Message::StreamOpen {
                    remote_addr: String::new(),
                },
            ))
            .await
            .unwrap();

        let frame = server.next().await.unwrap().unwrap();
        assert_eq!(frame.stream_id, StreamId::new(40));
        assert!(matches!(
            frame.message,
            Message::Error {
                code: ErrorCode::StreamNotFound,
                ..
            }
        ));

        // A close for an unknown stream is silent
        let stream = listener.accept().await.unwrap();
        assert_eq!(stream.id(), StreamId::new(41));
    }

    #[tokio::test]
    async fn test_unexpected_message_reports_error() {
        let (_listener, mut server) = connected_pair().await;

        server
            .send(Frame::control(Message::RegisterAck {
                accepted: true,
                reason: None,
            }))
            .await
            .unwrap();

        let frame = server.next().await.unwrap().unwrap();
        assert!(frame.stream_id.is_control());
        assert!(matches!(
            frame.message,
            Message::Error {
                code: ErrorCode::InvalidMessage,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_slow_reader_is_reset_alone() {
        let (mut listener, mut server) = connected_pair().await;

        let open = |id: u32| {
            Frame::new(
                StreamId::new(id),
                Message::StreamOpen {
                    remote_addr: String::new(),
                },
            )
        };

        server.send(open(7)).await.unwrap();
        let mut slow = listener.accept().await.unwrap();

        // Nobody reads stream 7 while the server keeps sending
        for _ in 0..=STREAM_INBOUND_CAPACITY {
            server
                .send(Frame::data(StreamId::new(7), Bytes::from_static(b"chunk")))
                .await
                .unwrap();
        }

        let frame = server.next().await.unwrap().unwrap();
        assert_eq!(frame.stream_id, StreamId::new(7));
        assert!(matches!(
            frame.message,
            Message::Error {
                code: ErrorCode::StreamOverflow,
                ..
            }
        ));
        assert_eq!(server.next().await.unwrap().unwrap(), Frame::close(StreamId::new(7)));

        // Other streams and the control stream keep working
        server.send(open(9)).await.unwrap();
        server
            .send(Frame::data(StreamId::new(9), Bytes::from_static(b"ping")))
            .await
            .unwrap();
        let mut healthy = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        healthy.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server
            .send(Frame::control(Message::Heartbeat { timestamp: 5 }))
            .await
            .unwrap();
        assert_eq!(
            server.next().await.unwrap().unwrap(),
            Frame::control(Message::HeartbeatAck { timestamp: 5 })
        );

        // The reset stream drains what was buffered, then ends
        let mut buffered = Vec::new();
        slow.read_to_end(&mut buffered).await.unwrap();
        assert_eq!(buffered.len(), STREAM_INBOUND_CAPACITY * b"chunk".len());
        assert!(slow.write_all(b"x").await.is_err());

        // Dropping it does not close the stream a second time
        drop(slow);
        drop(healthy);
        assert_eq!(server.next().await.unwrap().unwrap(), Frame::close(StreamId::new(9)));
    }
}
