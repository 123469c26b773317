//! Dispatcher: routes decoded envelopes and owns the authentication step.
//!
//! The dispatcher is synchronous: it mutates the session registry and
//! returns what the connection reader should do next (at most one reply to
//! write, at most one event to publish). The reader queues the reply before
//! publishing the event. Collaborators send through the same outbox, so a
//! peer always sees `authentication_success` before anything sent in
//! reaction to `peer-authenticated`.
//!
//! Non-identity traffic is accepted from unauthenticated sessions and
//! forwarded as events. This is deliberate: simple peers stream payloads
//! without identifying first. Only outbound addressing by device id
//! ([`Engine::send_to`](crate::Engine::send_to)) requires authentication.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::connection::ConnectionId;
use crate::events::EngineEvent;
use crate::identity::DeviceIdentity;
use crate::message::{Envelope, MessageKind};
use crate::session::{IdentityUpdate, SessionRegistry};

/// What the connection reader should do with one inbound envelope.
#[derive(Debug, Default, PartialEq)]
pub struct Dispatch {
    /// Frame to write back on the same connection.
    pub reply: Option<Envelope>,
    /// Event to publish on the bus.
    pub event: Option<EngineEvent>,
}

impl Dispatch {
    fn none() -> Self {
        Self::default()
    }

    fn reply(reply: Envelope) -> Self {
        Self {
            reply: Some(reply),
            event: None,
        }
    }

    fn event(event: EngineEvent) -> Self {
        Self {
            reply: None,
            event: Some(event),
        }
    }
}

/// Routes envelopes by [`MessageKind`].
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    local_identity: DeviceIdentity,
}

impl Dispatcher {
    pub fn new(registry: Arc<SessionRegistry>, local_identity: DeviceIdentity) -> Self {
        Self {
            registry,
            local_identity,
        }
    }

    pub fn local_identity(&self) -> &DeviceIdentity {
        &self.local_identity
    }

    pub fn dispatch(&self, connection_id: &ConnectionId, envelope: Envelope) -> Dispatch {
        debug!(
            connection_id = %connection_id,
            kind = %envelope.kind,
            message_id = %envelope.message_id,
            "Dispatching message"
        );

        let id = connection_id.clone();
        match envelope.kind {
            MessageKind::Identity => self.authenticate(connection_id, &envelope, "deviceInfo", true),
            MessageKind::AuthenticationSuccess => {
                self.authenticate(connection_id, &envelope, "serverDeviceInfo", false)
            }
            MessageKind::Heartbeat => {
                if !self.registry.touch(connection_id) {
                    debug!(connection_id = %connection_id, "Heartbeat for unknown connection dropped");
                    return Dispatch::none();
                }
                if envelope.is_heartbeat_reply() {
                    Dispatch::none()
                } else {
                    Dispatch::reply(Envelope::heartbeat_reply())
                }
            }
            MessageKind::ConnectionEstablished => {
                debug!(
                    connection_id = %connection_id,
                    remote_id = envelope.str_field("connectionId").unwrap_or_default(),
                    "Listener greeting received"
                );
                Dispatch::none()
            }
            MessageKind::FileTransfer => Dispatch::event(EngineEvent::FileTransfer {
                connection_id: id,
                payload: envelope.payload,
            }),
            MessageKind::ScreenFrame => Dispatch::event(EngineEvent::ScreenFrame {
                connection_id: id,
                payload: envelope.payload,
            }),
            MessageKind::ControlCommand => Dispatch::event(EngineEvent::ControlCommand {
                connection_id: id,
                payload: envelope.payload,
            }),
            MessageKind::ControlEvent => Dispatch::event(EngineEvent::ControlEvent {
                connection_id: id,
                payload: envelope.payload,
            }),
            MessageKind::Notification => Dispatch::event(EngineEvent::Notification {
                connection_id: id,
                payload: envelope.payload,
            }),
            MessageKind::Clipboard => Dispatch::event(EngineEvent::Clipboard {
                connection_id: id,
                payload: envelope.payload,
            }),
            MessageKind::Ack => {
                // Bare peers put the acknowledged id in `messageId`.
                let message_id = envelope
                    .str_field("ackMessageId")
                    .map(str::to_string)
                    .unwrap_or(envelope.message_id);
                Dispatch::event(EngineEvent::MessageAcknowledged {
                    connection_id: id,
                    message_id,
                })
            }
            MessageKind::Error => {
                let code = envelope.str_field("errorCode").unwrap_or("unknown").to_string();
                let message = envelope.str_field("errorMessage").unwrap_or_default().to_string();
                warn!(connection_id = %connection_id, code = %code, "Peer reported error: {message}");
                Dispatch::event(EngineEvent::PeerError {
                    connection_id: id,
                    code,
                    message,
                })
            }
            MessageKind::Unknown(name) => {
                warn!(connection_id = %connection_id, kind = %name, "Unknown message type");
                Dispatch::reply(Envelope::error(
                    "unknown_message_type",
                    format!("Unknown message type: {name}"),
                ))
            }
        }
    }

    /// Record the identity carried under `key`. Only the first identity on a
    /// connection produces a reply and a `PeerAuthenticated` event; later
    /// ones overwrite the stored identity silently.
    fn authenticate(
        &self,
        connection_id: &ConnectionId,
        envelope: &Envelope,
        key: &str,
        reply: bool,
    ) -> Dispatch {
        let identity = match envelope.device_identity(key) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Invalid {key}");
                return Dispatch::reply(Envelope::error(
                    "invalid_message",
                    format!("Missing or invalid {key}: {e}"),
                ));
            }
        };

        match self.registry.set_identity(connection_id, identity.clone()) {
            IdentityUpdate::First => {
                info!(
                    connection_id = %connection_id,
                    device_id = %identity.device_id,
                    name = %identity.device_name,
                    platform = %identity.platform,
                    "Device authenticated"
                );
                Dispatch {
                    reply: reply.then(|| Envelope::authentication_success(&self.local_identity)),
                    event: Some(EngineEvent::PeerAuthenticated {
                        connection_id: connection_id.clone(),
                        identity,
                    }),
                }
            }
            IdentityUpdate::Replaced => {
                debug!(connection_id = %connection_id, device_id = %identity.device_id, "Identity updated");
                Dispatch::none()
            }
            IdentityUpdate::Unknown => Dispatch::none(),
        }
    }
}
