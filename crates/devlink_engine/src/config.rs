//! Engine configuration.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::connection::ConnectionLimits;
use crate::error::EngineError;

/// Tunables for one [`Engine`](crate::Engine).
///
/// The engine never reads this from disk by itself; the embedding
/// application builds or loads it and passes it in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interface the listener binds to.
    pub bind_ip: IpAddr,

    /// Port used by `listen_default`.
    pub default_port: u16,

    /// Interval between supervisor heartbeats.
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// A session silent for longer than this is evicted.
    #[serde(with = "duration_serde")]
    pub heartbeat_timeout: Duration,

    /// Deadline for writing one frame.
    #[serde(with = "duration_millis_serde")]
    pub write_timeout: Duration,

    /// Deadline for establishing an outbound connection.
    #[serde(with = "duration_millis_serde")]
    pub connect_timeout: Duration,

    /// Largest frame accepted from a peer, in bytes.
    pub max_frame_len: usize,

    /// Accepted connections beyond this many sessions are refused.
    pub max_sessions: usize,

    /// Event bus buffer per subscriber.
    pub event_capacity: usize,

    /// Frames queued per connection before `post` fails.
    pub outbox_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            default_port: 8080,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(120),
            write_timeout: Duration::from_millis(5000),
            connect_timeout: Duration::from_millis(10_000),
            max_frame_len: 16 * 1024 * 1024,
            max_sessions: 32,
            event_capacity: 1024,
            outbox_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Per-connection limits derived from this config.
    pub fn limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            write_timeout: self.write_timeout,
            max_frame_len: self.max_frame_len,
            outbox_capacity: self.outbox_capacity,
        }
    }

    /// Save the config to a JSON file, creating parent directories.
    pub fn save_to_file(&self, path: &Path) -> Result<(), EngineError> {
        write_json(path, self)
    }

    /// Load config from a JSON file. A missing file gives the defaults
    /// silently; an unreadable or corrupt one gives the defaults with a
    /// warning. Fields absent from the file keep their defaults.
    pub fn load_or_default(path: &Path) -> Self {
        match read_json(path) {
            Ok(config) => config,
            Err(EngineError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unusable config file, using defaults");
                Self::default()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

/// Read and parse one JSON document.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, EngineError> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Write `value` as pretty JSON, creating parent directories first.
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
