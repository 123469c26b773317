//! Typed event bus consumed by collaborators (UI, file transfer, discovery).
//!
//! The bus is created by the embedding application and handed to the
//! [`Engine`](crate::Engine) at construction. Every subscriber gets every
//! event published after it subscribed; a subscriber that falls more than
//! `capacity` events behind observes `RecvError::Lagged`.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::trace;

use crate::connection::{ConnectionId, ConnectionRole};
use crate::identity::DeviceIdentity;
use crate::message::Payload;

/// Something that happened inside the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The listener is accepting connections on `addr`.
    Listening { addr: SocketAddr },
    /// The listener was closed.
    ListenerStopped,
    /// A connection was registered (accepted or dialed).
    ConnectionOpened {
        connection_id: ConnectionId,
        role: ConnectionRole,
        peer_addr: SocketAddr,
    },
    /// A peer identified itself. Emitted once per connection.
    PeerAuthenticated {
        connection_id: ConnectionId,
        identity: DeviceIdentity,
    },
    /// A connection ended (peer close, I/O failure, explicit disconnect).
    PeerDisconnected {
        connection_id: ConnectionId,
        identity: Option<DeviceIdentity>,
    },
    /// A session was dropped for missing its heartbeat deadline.
    SessionEvicted {
        connection_id: ConnectionId,
        identity: Option<DeviceIdentity>,
    },
    FileTransfer {
        connection_id: ConnectionId,
        payload: Payload,
    },
    ScreenFrame {
        connection_id: ConnectionId,
        payload: Payload,
    },
    ControlCommand {
        connection_id: ConnectionId,
        payload: Payload,
    },
    ControlEvent {
        connection_id: ConnectionId,
        payload: Payload,
    },
    Notification {
        connection_id: ConnectionId,
        payload: Payload,
    },
    Clipboard {
        connection_id: ConnectionId,
        payload: Payload,
    },
    /// The peer acknowledged one of our messages.
    MessageAcknowledged {
        connection_id: ConnectionId,
        message_id: String,
    },
    /// The peer reported an error.
    PeerError {
        connection_id: ConnectionId,
        code: String,
        message: String,
    },
}

impl EngineEvent {
    /// Short kebab-case name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Listening { .. } => "listening",
            Self::ListenerStopped => "listener-stopped",
            Self::ConnectionOpened { .. } => "connection-opened",
            Self::PeerAuthenticated { .. } => "peer-authenticated",
            Self::PeerDisconnected { .. } => "peer-disconnected",
            Self::SessionEvicted { .. } => "session-evicted",
            Self::FileTransfer { .. } => "file-transfer",
            Self::ScreenFrame { .. } => "screen-frame",
            Self::ControlCommand { .. } => "control-command",
            Self::ControlEvent { .. } => "control-event",
            Self::Notification { .. } => "notification",
            Self::Clipboard { .. } => "clipboard",
            Self::MessageAcknowledged { .. } => "message-acknowledged",
            Self::PeerError { .. } => "peer-error",
        }
    }
}

/// Broadcast bus for [`EngineEvent`]s.
///
/// Cloning is cheap; all clones share the same channel. [`close`](Self::close)
/// drops the sender so every subscriber sees the stream end once it has
/// drained what was already published.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: Arc<RwLock<Option<broadcast::Sender<EngineEvent>>>>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(RwLock::new(Some(tx))),
        }
    }

    /// Subscribe to future events. A subscription taken after
    /// [`close`](Self::close) is already at its end.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        match self.sender.read().as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }

    /// Publish an event. Events published with no subscribers, or after
    /// the bus is closed, are discarded.
    pub fn publish(&self, event: EngineEvent) {
        if let Some(tx) = self.sender.read().as_ref() {
            trace!(event = event.name(), "Publishing event");
            let _ = tx.send(event);
        }
    }

    /// Drop the sender, ending every subscription.
    pub fn close(&self) {
        self.sender.write().take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender
            .read()
            .as_ref()
            .map_or(0, |tx| tx.receiver_count())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
