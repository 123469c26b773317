//! Engine: the public facade of the connection engine.
//!
//! [`Engine`] owns:
//! - the TCP listener and its accept loop
//! - outbound dials
//! - the session registry shared with every connection
//! - the heartbeat supervisor
//! - the event bus handed in by the host application

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex as AsyncMutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::EngineConfig;
use crate::connection::{self, ConnectionContext, ConnectionId, ConnectionRole};
use crate::dispatcher::Dispatcher;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::heartbeat::{HeartbeatSupervisor, wait_for_shutdown};
use crate::identity::DeviceIdentity;
use crate::message::Envelope;
use crate::session::{Session, SessionRegistry};

/// Pause after a failed `accept` so a persistent error (e.g. out of file
/// descriptors) does not spin the accept loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Aggregate counters, recomputed from the session registry on every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub listening: bool,
    pub local_addr: Option<SocketAddr>,
    /// Every registered session, authenticated or not.
    pub total_sessions: usize,
    /// Authenticated sessions.
    pub active_sessions: usize,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub total_messages: u64,
}

/// The connection engine.
///
/// Create one per host. All methods take `&self`; share it behind an `Arc`.
pub struct Engine {
    identity: DeviceIdentity,
    config: EngineConfig,
    registry: Arc<SessionRegistry>,
    bus: EventBus,
    ctx: ConnectionContext,
    /// Accept loop task, present while listening.
    listener: AsyncMutex<Option<JoinHandle<()>>>,
    listen_addr: Mutex<Option<SocketAddr>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    /// `true` once shutdown has begun. Dial holds the read side while it
    /// registers a new connection so shutdown cannot miss it.
    stopped: RwLock<bool>,
}

impl Engine {
    /// Create an engine publishing on `bus`.
    pub fn new(identity: DeviceIdentity, config: EngineConfig, bus: EventBus) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), identity.clone()));
        let ctx = ConnectionContext {
            registry: Arc::clone(&registry),
            dispatcher,
            bus: bus.clone(),
            limits: config.limits(),
        };
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            identity,
            config,
            registry,
            bus,
            ctx,
            listener: AsyncMutex::new(None),
            listen_addr: Mutex::new(None),
            supervisor: Mutex::new(None),
            shutdown_tx,
            stopped: RwLock::new(false),
        }
    }

    /// Create an engine with its own bus sized by `config.event_capacity`.
    pub fn with_config(identity: DeviceIdentity, config: EngineConfig) -> Self {
        let bus = EventBus::new(config.event_capacity);
        Self::new(identity, config, bus)
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    /// Address the listener is bound to, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.stopped.read()
    }

    /// Copy of every session.
    pub fn sessions(&self) -> Vec<Session> {
        self.registry.snapshot()
    }

    pub fn session(&self, connection_id: &ConnectionId) -> Option<Session> {
        self.registry.get(connection_id)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Bind `config.bind_ip:port` and start accepting connections.
    ///
    /// Calling this while already listening is a no-op that returns the
    /// existing address. Port 0 binds an ephemeral port.
    pub async fn listen(&self, port: u16) -> Result<SocketAddr, EngineError> {
        let mut listener = self.listener.lock().await;
        if self.is_shut_down() {
            return Err(EngineError::ShutDown);
        }
        if listener.is_some() {
            if let Some(addr) = self.local_addr() {
                debug!(addr = %addr, "Already listening");
                return Ok(addr);
            }
        }

        let addr = SocketAddr::new(self.config.bind_ip, port);
        let tcp = TcpListener::bind(addr)
            .await
            .map_err(|source| EngineError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = tcp.local_addr()?;

        *self.listen_addr.lock() = Some(local_addr);
        self.bus.publish(EngineEvent::Listening { addr: local_addr });
        info!(addr = %local_addr, "Listening for connections");

        let task = tokio::spawn(accept_loop(
            tcp,
            self.ctx.clone(),
            self.config.max_sessions,
            self.shutdown_tx.subscribe(),
        ));
        *listener = Some(task);
        drop(listener);

        self.ensure_supervisor();
        Ok(local_addr)
    }

    /// Listen on `config.default_port`.
    pub async fn listen_default(&self) -> Result<SocketAddr, EngineError> {
        self.listen(self.config.default_port).await
    }

    /// Connect to `addr`, register the connection and send our identity.
    pub async fn dial(&self, addr: SocketAddr) -> Result<ConnectionId, EngineError> {
        if self.is_shut_down() {
            return Err(EngineError::ShutDown);
        }

        let mut shutdown = self.shutdown_tx.subscribe();
        let deadline = self.config.connect_timeout;
        debug!(addr = %addr, "Dialing");

        let stream = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => return Err(EngineError::ShutDown),
            res = tokio::time::timeout(deadline, TcpStream::connect(addr)) => match res {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return Err(EngineError::Transport(format!("Failed to connect to {addr}: {e}")));
                }
                Err(_) => return Err(EngineError::Timeout(deadline)),
            },
        };
        let peer_addr = stream.peer_addr().unwrap_or(addr);

        let id = ConnectionId::generate();
        {
            let stopped = self.stopped.read();
            if *stopped {
                return Err(EngineError::ShutDown);
            }
            connection::spawn(
                id.clone(),
                stream,
                peer_addr,
                ConnectionRole::Dialed,
                &self.ctx,
                Some(Envelope::identity(&self.identity)),
            );
        }
        info!(connection_id = %id, peer = %peer_addr, "Connected to peer");

        self.ensure_supervisor();
        Ok(id)
    }

    /// Stop listening, stop the supervisor, close every connection and
    /// close the event bus. Safe to call more than once.
    pub async fn shutdown(&self) {
        {
            let mut stopped = self.stopped.write();
            if *stopped {
                debug!("Engine already shut down");
                return;
            }
            *stopped = true;
        }
        info!("Shutting down engine");
        self.shutdown_tx.send_replace(true);

        let listener = self.listener.lock().await.take();
        if let Some(task) = listener {
            if let Err(e) = task.await {
                warn!("Accept loop ended abnormally: {e}");
            }
        }
        self.listen_addr.lock().take();

        let supervisor = self.supervisor.lock().take();
        if let Some(task) = supervisor {
            if let Err(e) = task.await {
                warn!("Heartbeat supervisor ended abnormally: {e}");
            }
        }

        let sessions = self.registry.drain();
        let count = sessions.len();
        for session in sessions {
            session.handle().close();
            self.bus.publish(EngineEvent::PeerDisconnected {
                connection_id: session.connection_id,
                identity: session.identity,
            });
        }

        self.bus.close();
        info!(closed = count, "Engine shut down");
    }

    fn ensure_supervisor(&self) {
        let stopped = self.stopped.read();
        if *stopped {
            return;
        }
        let mut slot = self.supervisor.lock();
        if slot.is_none() {
            let supervisor = HeartbeatSupervisor::new(
                Arc::clone(&self.registry),
                self.bus.clone(),
                self.config.heartbeat_interval,
                self.config.heartbeat_timeout,
            );
            *slot = Some(supervisor.spawn(self.shutdown_tx.subscribe()));
        }
    }

    // ── Messaging ────────────────────────────────────────────────────

    /// Send to one connection. Returns `false` if the connection is unknown
    /// or the write failed.
    pub async fn send(&self, connection_id: &ConnectionId, envelope: Envelope) -> bool {
        let Some(session) = self.registry.get(connection_id) else {
            debug!(connection_id = %connection_id, "Send to unknown connection");
            return false;
        };
        match session.handle().send(envelope).await {
            Ok(()) => true,
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Send failed");
                false
            }
        }
    }

    /// Send to the authenticated session of `device_id`.
    pub async fn send_to(&self, device_id: &str, envelope: Envelope) -> Result<(), EngineError> {
        let session = self
            .registry
            .find_authenticated(device_id)
            .ok_or_else(|| EngineError::PeerUnavailable(device_id.to_string()))?;
        session.handle().send(envelope).await
    }

    /// Send to every authenticated session except `excluding`, concurrently.
    /// Returns how many writes succeeded.
    pub async fn broadcast(&self, envelope: Envelope, excluding: Option<&ConnectionId>) -> usize {
        let targets: Vec<Session> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|s| s.is_authenticated() && Some(&s.connection_id) != excluding)
            .collect();

        let sends = targets.iter().map(|s| {
            let envelope = envelope.clone();
            async move { (s, s.handle().send(envelope).await) }
        });

        let mut delivered = 0;
        for (session, result) in join_all(sends).await {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    connection_id = %session.connection_id,
                    error = %e,
                    "Broadcast send failed"
                ),
            }
        }
        debug!(kind = %envelope.kind, delivered, targets = targets.len(), "Broadcast");
        delivered
    }

    /// Acknowledge `message_id` on a connection.
    pub async fn ack(&self, connection_id: &ConnectionId, message_id: &str) -> bool {
        self.send(connection_id, Envelope::ack(message_id)).await
    }

    /// Close one connection. Its task removes the session and publishes
    /// `PeerDisconnected`. Returns `false` if the connection is unknown or
    /// already closing.
    pub fn disconnect(&self, connection_id: &ConnectionId) -> bool {
        match self.registry.get(connection_id) {
            Some(session) => {
                info!(connection_id = %connection_id, "Disconnecting");
                session.handle().close()
            }
            None => false,
        }
    }

    pub fn stats(&self) -> EngineStats {
        let sessions = self.registry.snapshot();
        let local_addr = self.local_addr();
        EngineStats {
            listening: local_addr.is_some(),
            local_addr,
            total_sessions: sessions.len(),
            active_sessions: sessions.iter().filter(|s| s.is_authenticated()).count(),
            total_bytes_in: sessions.iter().map(Session::bytes_in).sum(),
            total_bytes_out: sessions.iter().map(Session::bytes_out).sum(),
            total_messages: sessions.iter().map(Session::message_count).sum(),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: ConnectionContext,
    max_sessions: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    if ctx.registry.len() >= max_sessions {
                        warn!(peer = %peer_addr, max_sessions, "Session limit reached, refusing connection");
                        tokio::spawn(refuse(stream, ctx.limits.write_timeout));
                        continue;
                    }
                    let id = ConnectionId::generate();
                    let greeting = Envelope::connection_established(id.as_str());
                    connection::spawn(id, stream, peer_addr, ConnectionRole::Accepted, &ctx, Some(greeting));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }

    info!("Listener stopped");
    ctx.bus.publish(EngineEvent::ListenerStopped);
}

/// Tell an over-limit peer why it is being dropped, then close.
async fn refuse(mut stream: TcpStream, deadline: Duration) {
    let mut envelope = Envelope::error("too_many_sessions", "Too many sessions");
    envelope.stamp();
    if let Ok(frame) = codec::encode(&envelope) {
        let _ = tokio::time::timeout(deadline, stream.write_all(&frame)).await;
    }
    let _ = tokio::time::timeout(deadline, stream.shutdown()).await;
}
