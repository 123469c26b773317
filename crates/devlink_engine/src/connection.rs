//! One TCP stream and the two tasks that own it.
//!
//! The stream is split. A reader task owns the read half and the read
//! buffer: it decodes, dispatches and queues replies. A writer task owns
//! the write half and drains the outbox under the write deadline. Reading
//! never waits on a write, so two peers pushing large frames at each other
//! both make progress.
//!
//! Everything else talks to the connection through a cloneable
//! [`ConnectionHandle`]. [`close`](ConnectionHandle::close) flips a watch
//! flag both tasks observe; whichever task ends first flips it for the
//! other. The writer runs the cleanup once the reader has stopped.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{self, FrameDecoder};
use crate::dispatcher::Dispatcher;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::message::Envelope;
use crate::session::SessionRegistry;

const READ_CHUNK: usize = 8 * 1024;

/// Process-unique identifier of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh id (`conn-<uuid>`).
    pub fn generate() -> Self {
        Self(format!("conn-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a connection came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionRole {
    /// Accepted by our listener.
    Accepted,
    /// Initiated by us via `dial`.
    Dialed,
}

/// Traffic counters of one connection.
///
/// Only the connection's own tasks write these; everyone else reads them.
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    messages: AtomicU64,
}

impl ConnectionCounters {
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Number of inbound frames that decoded successfully.
    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    fn record_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn record_out(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }
}

/// A frame waiting in a connection's outbox.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub(crate) frame: Vec<u8>,
    done: Option<oneshot::Sender<Result<(), EngineError>>>,
}

/// Limits applied to every connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub write_timeout: Duration,
    pub max_frame_len: usize,
    pub outbox_capacity: usize,
}

/// Cloneable handle to a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    id: ConnectionId,
    role: ConnectionRole,
    peer_addr: SocketAddr,
    write_timeout: Duration,
    outbox: mpsc::Sender<Outbound>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    counters: ConnectionCounters,
}

impl ConnectionHandle {
    /// Build a handle plus the receiving ends its owning tasks consume.
    pub(crate) fn new(
        id: ConnectionId,
        role: ConnectionRole,
        peer_addr: SocketAddr,
        limits: ConnectionLimits,
    ) -> (Self, mpsc::Receiver<Outbound>, watch::Receiver<bool>) {
        let (outbox, outbox_rx) = mpsc::channel(limits.outbox_capacity.max(1));
        let (close_tx, close_rx) = watch::channel(false);
        let handle = Self {
            inner: Arc::new(HandleInner {
                id,
                role,
                peer_addr,
                write_timeout: limits.write_timeout,
                outbox,
                closed: AtomicBool::new(false),
                close_tx,
                counters: ConnectionCounters::default(),
            }),
        };
        (handle, outbox_rx, close_rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    pub fn role(&self) -> ConnectionRole {
        self.inner.role
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn counters(&self) -> &ConnectionCounters {
        &self.inner.counters
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stamp, encode and write an envelope, waiting for the write to finish.
    ///
    /// The whole operation is bounded by the write deadline.
    pub async fn send(&self, mut envelope: Envelope) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::ConnectionClosed(self.id().clone()));
        }
        envelope.stamp();
        let frame = codec::encode(&envelope)?;
        let (done_tx, done_rx) = oneshot::channel();
        let outbound = Outbound {
            frame,
            done: Some(done_tx),
        };

        let deadline = self.inner.write_timeout;
        let closed = || EngineError::ConnectionClosed(self.id().clone());
        tokio::time::timeout(deadline, async {
            self.inner.outbox.send(outbound).await.map_err(|_| closed())?;
            done_rx.await.map_err(|_| closed())?
        })
        .await
        .map_err(|_| EngineError::Timeout(deadline))?
    }

    /// Queue an envelope behind whatever is already waiting, without waiting
    /// for the write. Waiting for outbox space is bounded by the write
    /// deadline.
    pub(crate) async fn queue(&self, mut envelope: Envelope) -> Result<(), EngineError> {
        envelope.stamp();
        let frame = codec::encode(&envelope)?;
        let deadline = self.inner.write_timeout;
        let outbound = Outbound { frame, done: None };
        match tokio::time::timeout(deadline, self.inner.outbox.send(outbound)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(EngineError::ConnectionClosed(self.id().clone())),
            Err(_) => Err(EngineError::Timeout(deadline)),
        }
    }

    /// Queue an envelope without waiting for it to be written.
    ///
    /// Fails immediately if the connection is closed or its outbox is full.
    pub fn post(&self, mut envelope: Envelope) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::ConnectionClosed(self.id().clone()));
        }
        envelope.stamp();
        let frame = codec::encode(&envelope)?;
        self.inner
            .outbox
            .try_send(Outbound { frame, done: None })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    EngineError::Transport(format!("Outbox of {} is full", self.id()))
                }
                mpsc::error::TrySendError::Closed(_) => {
                    EngineError::ConnectionClosed(self.id().clone())
                }
            })
    }

    /// Close the connection. Returns `true` for the call that closed it;
    /// later calls are no-ops.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.close_tx.send_replace(true);
        true
    }
}

/// Everything a connection's tasks need from the engine.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) bus: EventBus,
    pub(crate) limits: ConnectionLimits,
}

/// Register `stream` as a new session and start its reader and writer.
///
/// `greeting` is written before anything else on the connection: the
/// dialer's identity, or the listener's `connection_established`.
pub(crate) fn spawn(
    id: ConnectionId,
    stream: TcpStream,
    peer_addr: SocketAddr,
    role: ConnectionRole,
    ctx: &ConnectionContext,
    greeting: Option<Envelope>,
) -> ConnectionHandle {
    let (handle, outbox_rx, close_rx) =
        ConnectionHandle::new(id.clone(), role, peer_addr, ctx.limits);
    ctx.registry.register(handle.clone());
    info!(connection_id = %id, peer = %peer_addr, ?role, "Connection registered");
    ctx.bus.publish(EngineEvent::ConnectionOpened {
        connection_id: id,
        role,
        peer_addr,
    });

    let (read_half, write_half) = stream.into_split();
    let reader = ConnectionReader {
        handle: handle.clone(),
        read_half,
        close_rx: close_rx.clone(),
        buf: BytesMut::with_capacity(READ_CHUNK),
        decoder: FrameDecoder::new(ctx.limits.max_frame_len),
        ctx: ctx.clone(),
    };
    let writer = ConnectionWriter {
        handle: handle.clone(),
        write_half,
        outbox_rx,
        close_rx,
        ctx: ctx.clone(),
    };
    let reader_task = tokio::spawn(reader.run());
    tokio::spawn(writer.run(greeting, reader_task));
    handle
}

/// Read half: decode, dispatch, queue replies, publish events.
struct ConnectionReader {
    handle: ConnectionHandle,
    read_half: OwnedReadHalf,
    close_rx: watch::Receiver<bool>,
    buf: BytesMut,
    decoder: FrameDecoder,
    ctx: ConnectionContext,
}

impl ConnectionReader {
    async fn run(mut self) {
        let id = self.handle.id().clone();
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            tokio::select! {
                biased;

                _ = self.close_rx.changed() => break,

                read = self.read_half.read(&mut chunk) => match read {
                    Ok(0) => {
                        debug!(connection_id = %id, "Connection closed by peer");
                        break;
                    }
                    Ok(n) => {
                        self.handle.counters().record_in(n);
                        self.buf.extend_from_slice(&chunk[..n]);
                        if !self.drain_frames().await {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(connection_id = %id, error = %e, "Read error, closing connection");
                        break;
                    }
                },
            }
        }

        self.handle.close();
    }

    /// Decode and dispatch every complete frame in the buffer. Returns
    /// `false` when the connection must be torn down.
    ///
    /// Replies go through the outbox, so they reach the peer in order with
    /// everything else and never wait on this side's reads.
    async fn drain_frames(&mut self) -> bool {
        let id = self.handle.id().clone();
        loop {
            match self.decoder.decode(&mut self.buf) {
                Ok(Some(envelope)) => {
                    self.handle.counters().record_message();
                    let dispatch = self.ctx.dispatcher.dispatch(&id, envelope);
                    if let Some(reply) = dispatch.reply {
                        if let Err(e) = self.handle.queue(reply).await {
                            warn!(connection_id = %id, error = %e, "Failed to queue reply");
                            return false;
                        }
                    }
                    if let Some(event) = dispatch.event {
                        self.ctx.bus.publish(event);
                    }
                }
                Ok(None) => return true,
                Err(e) => {
                    warn!(connection_id = %id, error = %e, "Failed to decode frame");
                    let report = Envelope::error(e.wire_code(), e.to_string());
                    if !e.is_recoverable() {
                        // Wait for the report to go out before tearing down.
                        let _ = self.handle.send(report).await;
                        return false;
                    }
                    if self.handle.queue(report).await.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

/// Write half: greeting, then the outbox, then the exactly-once cleanup.
struct ConnectionWriter {
    handle: ConnectionHandle,
    write_half: OwnedWriteHalf,
    outbox_rx: mpsc::Receiver<Outbound>,
    close_rx: watch::Receiver<bool>,
    ctx: ConnectionContext,
}

impl ConnectionWriter {
    async fn run(mut self, greeting: Option<Envelope>, reader: JoinHandle<()>) {
        let id = self.handle.id().clone();

        let greeted = match greeting {
            Some(greeting) => match self.write_envelope(greeting).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(connection_id = %id, error = %e, "Failed to send greeting");
                    false
                }
            },
            None => true,
        };

        if greeted {
            loop {
                tokio::select! {
                    biased;

                    _ = self.close_rx.changed() => {
                        debug!(connection_id = %id, "Close requested");
                        break;
                    }

                    outbound = self.outbox_rx.recv() => {
                        let Some(outbound) = outbound else { break };
                        let result = self.write_frame(&outbound.frame).await;
                        let failed = result.is_err();
                        if let Err(e) = &result {
                            warn!(connection_id = %id, error = %e, "Write failed, closing connection");
                        }
                        if let Some(done) = outbound.done {
                            let _ = done.send(result);
                        }
                        if failed {
                            break;
                        }
                    }
                }
            }
        }

        self.finish(reader).await;
    }

    async fn write_envelope(&mut self, mut envelope: Envelope) -> Result<(), EngineError> {
        envelope.stamp();
        let frame = codec::encode(&envelope)?;
        self.write_frame(&frame).await
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), EngineError> {
        let deadline = self.ctx.limits.write_timeout;
        match tokio::time::timeout(deadline, self.write_half.write_all(frame)).await {
            Ok(Ok(())) => {
                self.handle.counters().record_out(frame.len());
                Ok(())
            }
            Ok(Err(e)) => Err(EngineError::Io(e)),
            Err(_) => Err(EngineError::Timeout(deadline)),
        }
    }

    /// Stop the reader, release the socket and drop the session, exactly once.
    async fn finish(mut self, reader: JoinHandle<()>) {
        let id = self.handle.id().clone();
        self.handle.close();

        self.outbox_rx.close();
        self.fail_pending();
        if let Err(e) = reader.await {
            warn!(connection_id = %id, error = %e, "Reader task failed");
        }
        self.fail_pending();

        let deadline = self.ctx.limits.write_timeout;
        let _ = tokio::time::timeout(deadline, self.write_half.shutdown()).await;

        if let Some(session) = self.ctx.registry.remove(&id) {
            info!(connection_id = %id, "Connection closed");
            self.ctx.bus.publish(EngineEvent::PeerDisconnected {
                connection_id: id,
                identity: session.identity,
            });
        } else {
            debug!(connection_id = %id, "Connection closed after session removal");
        }
    }

    fn fail_pending(&mut self) {
        while let Ok(outbound) = self.outbox_rx.try_recv() {
            if let Some(done) = outbound.done {
                let _ = done.send(Err(EngineError::ConnectionClosed(self.handle.id().clone())));
            }
        }
    }
}

/// A handle with no task behind it, plus the receiving ends a task would own.
#[cfg(test)]
pub(crate) fn test_handle(
    id: &str,
) -> (ConnectionHandle, mpsc::Receiver<Outbound>, watch::Receiver<bool>) {
    ConnectionHandle::new(
        ConnectionId::from_string(id),
        ConnectionRole::Accepted,
        "127.0.0.1:9000".parse().expect("valid test address"),
        ConnectionLimits {
            write_timeout: Duration::from_millis(200),
            max_frame_len: 1024,
            outbox_capacity: 2,
        },
    )
}
