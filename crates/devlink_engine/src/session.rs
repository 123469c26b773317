//! Session registry: the single source of truth for connected peers.
//!
//! Every open connection has exactly one [`Session`]. All mutation goes
//! through [`SessionRegistry`], which serializes access behind one lock and
//! hands out copies, never references into its map.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::connection::{ConnectionHandle, ConnectionId, ConnectionRole};
use crate::identity::DeviceIdentity;

/// Authentication state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Connected, no identity received yet.
    Unauthenticated,
    /// The peer has identified itself.
    Authenticated,
    /// The underlying connection has been closed.
    Closed,
}

/// Point-in-time view of one session.
#[derive(Debug, Clone)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub role: ConnectionRole,
    pub peer_addr: SocketAddr,
    /// The peer's identity; `None` until authenticated.
    pub identity: Option<DeviceIdentity>,
    /// Last heartbeat (or authentication) seen from the peer.
    pub last_heartbeat_at: Instant,
    pub connected_at: DateTime<Utc>,
    handle: ConnectionHandle,
}

impl Session {
    pub fn state(&self) -> SessionState {
        if self.handle.is_closed() {
            SessionState::Closed
        } else if self.identity.is_some() {
            SessionState::Authenticated
        } else {
            SessionState::Unauthenticated
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    /// The peer's device id, if authenticated.
    pub fn device_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.device_id.as_str())
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn bytes_in(&self) -> u64 {
        self.handle.counters().bytes_in()
    }

    pub fn bytes_out(&self) -> u64 {
        self.handle.counters().bytes_out()
    }

    pub fn message_count(&self) -> u64 {
        self.handle.counters().messages()
    }

    /// Whether no heartbeat arrived within `timeout` before `now`.
    pub fn is_stale(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_heartbeat_at) > timeout
    }
}

/// Outcome of [`SessionRegistry::set_identity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityUpdate {
    /// The session was unauthenticated and now is.
    First,
    /// The session was already authenticated; its identity was overwritten.
    Replaced,
    /// No such session (the connection is already gone).
    Unknown,
}

/// Concurrency-safe map from connection id to session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<ConnectionId, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unauthenticated session for a freshly opened connection.
    pub fn register(&self, handle: ConnectionHandle) -> Session {
        let session = Session {
            connection_id: handle.id().clone(),
            role: handle.role(),
            peer_addr: handle.peer_addr(),
            identity: None,
            last_heartbeat_at: Instant::now(),
            connected_at: Utc::now(),
            handle,
        };
        self.sessions
            .lock()
            .insert(session.connection_id.clone(), session.clone());
        session
    }

    /// Record the peer's identity and refresh its liveness.
    ///
    /// A session that was already removed is left alone: identity frames
    /// racing a disconnect are expected.
    pub fn set_identity(&self, id: &ConnectionId, identity: DeviceIdentity) -> IdentityUpdate {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(id) else {
            debug!(connection_id = %id, "Identity for unknown connection dropped");
            return IdentityUpdate::Unknown;
        };
        session.last_heartbeat_at = Instant::now();
        match session.identity.replace(identity) {
            None => IdentityUpdate::First,
            Some(_) => IdentityUpdate::Replaced,
        }
    }

    /// Refresh a session's liveness. Returns `false` if it no longer exists.
    pub fn touch(&self, id: &ConnectionId) -> bool {
        match self.sessions.lock().get_mut(id) {
            Some(session) => {
                session.last_heartbeat_at = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove a session, returning it for final cleanup.
    pub fn remove(&self, id: &ConnectionId) -> Option<Session> {
        self.sessions.lock().remove(id)
    }

    /// Remove the session only if it missed its heartbeat deadline. The
    /// check and the removal happen under one lock so a heartbeat that
    /// lands first always wins.
    pub fn evict_if_stale(
        &self,
        id: &ConnectionId,
        timeout: Duration,
        now: Instant,
    ) -> Option<Session> {
        let mut sessions = self.sessions.lock();
        if sessions.get(id)?.is_stale(timeout, now) {
            info!(connection_id = %id, "Heartbeat timeout, evicting session");
            sessions.remove(id)
        } else {
            None
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Session> {
        self.sessions.lock().get(id).cloned()
    }

    /// The authenticated session for `device_id`. If the device holds
    /// several connections, the most recently refreshed one wins.
    pub fn find_authenticated(&self, device_id: &str) -> Option<Session> {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.device_id() == Some(device_id) && !s.handle.is_closed())
            .max_by_key(|s| s.last_heartbeat_at)
            .cloned()
    }

    /// Copy of every session.
    pub fn snapshot(&self) -> Vec<Session> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Remove and return every session.
    pub fn drain(&self) -> Vec<Session> {
        self.sessions.lock().drain().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}
