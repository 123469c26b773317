//! DevLink Engine: device-to-device connection engine.
//!
//! This crate keeps live TCP connections between a host and paired devices
//! (phones, tablets, other PCs), authenticates them and turns their traffic
//! into typed events for the rest of the application.
//!
//! # Architecture
//!
//! - **Codec**: newline-delimited JSON, one envelope per line.
//! - **Connection**: a reader task and a writer task per socket.
//! - **Sessions**: a single registry of who is connected and authenticated.
//! - **Dispatcher**: routes envelopes, runs the identity handshake.
//! - **Heartbeat**: periodic pings and eviction of silent peers.
//! - **Events**: a broadcast bus collaborators subscribe to.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use devlink_engine::{DeviceIdentity, Engine, EngineConfig, EngineEvent, Envelope, EventBus};
//!
//! # async fn example() -> Result<(), devlink_engine::EngineError> {
//! let identity = DeviceIdentity::generate("Workstation", "windows");
//! let config = EngineConfig::default();
//! let engine = Engine::new(identity, config.clone(), EventBus::new(config.event_capacity));
//! let mut events = engine.subscribe();
//!
//! engine.listen_default().await?;
//! while let Ok(event) = events.recv().await {
//!     if let EngineEvent::PeerAuthenticated { identity, .. } = event {
//!         engine.send_to(identity.device_id.as_str(), Envelope::heartbeat()).await?;
//!     }
//! }
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod identity;
pub mod logging;
pub mod message;
pub mod session;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::EngineConfig;
pub use connection::{ConnectionId, ConnectionRole};
pub use engine::{Engine, EngineStats};
pub use error::{DecodeError, EngineError};
pub use events::{EngineEvent, EventBus};
pub use identity::{DeviceId, DeviceIdentity};
pub use message::{Envelope, MessageKind, Payload};
pub use session::{Session, SessionRegistry, SessionState};
