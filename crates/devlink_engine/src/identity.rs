//! Device identity: what a host announces about itself during the handshake.

use std::fmt;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config;
use crate::error::EngineError;

/// A unique identifier for a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Generate a new random device ID (32 hex characters).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Create a DeviceId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The identity a device presents in a `device_info` frame.
///
/// Fields the engine does not interpret (addresses, system info, ...) are
/// kept in `extra` so they survive a round trip through the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: DeviceId,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DeviceIdentity {
    /// Create a new identity with a fresh DeviceId.
    pub fn generate(name: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            device_id: DeviceId::generate(),
            device_name: name.into(),
            platform: platform.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: vec![
                "file_transfer".to_string(),
                "screen_mirror".to_string(),
                "remote_control".to_string(),
                "notification".to_string(),
                "clipboard_sync".to_string(),
            ],
            extra: serde_json::Map::new(),
        }
    }

    /// Whether the device advertised the given capability.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Persist the identity as JSON, creating parent directories.
    pub fn save_to_file(&self, path: &Path) -> Result<(), EngineError> {
        config::write_json(path, self)
    }

    /// The identity stored at `path`, or a fresh one written there when the
    /// file is missing or unusable. A failed write still returns the fresh
    /// identity; it only lives for this run.
    pub fn load_or_generate(
        path: &Path,
        name: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        match config::read_json::<Self>(path) {
            Ok(identity) => return identity,
            Err(EngineError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No identity file yet");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unusable identity file, replacing it");
            }
        }

        let identity = Self::generate(name, platform);
        if let Err(e) = identity.save_to_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to persist new identity");
        }
        identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_generation() {
        let a = DeviceId::generate();
        let b = DeviceId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_identity_wire_field_names() {
        let identity = DeviceIdentity::generate("Windows-PC", "windows");
        let value = serde_json::to_value(&identity).unwrap();
        assert!(value.get("deviceId").is_some());
        assert_eq!(value["deviceName"], "Windows-PC");
        assert_eq!(value["platform"], "windows");
    }

    #[test]
    fn test_identity_keeps_unknown_fields() {
        let json = r#"{
            "deviceId": "android-device-123",
            "deviceName": "Pixel",
            "platform": "Android",
            "ip": "192.168.1.20",
            "port": 8829
        }"#;
        let identity: DeviceIdentity = serde_json::from_str(json).unwrap();
        assert_eq!(identity.device_id.as_str(), "android-device-123");
        assert!(identity.capabilities.is_empty());
        assert_eq!(identity.extra["ip"], "192.168.1.20");

        let back = serde_json::to_value(&identity).unwrap();
        assert_eq!(back["port"], 8829);
    }

    #[test]
    fn test_identity_capabilities() {
        let identity = DeviceIdentity::generate("desk", "linux");
        assert!(identity.has_capability("clipboard_sync"));
        assert!(!identity.has_capability("teleport"));
    }

    #[test]
    fn test_identity_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        let original = DeviceIdentity::generate("persist-test", "linux");
        original.save_to_file(&path).unwrap();

        let loaded = DeviceIdentity::load_or_generate(&path, "fallback", "linux");
        assert_eq!(loaded.device_id, original.device_id);
        assert_eq!(loaded.device_name, "persist-test");
    }

    #[test]
    fn test_identity_load_missing_generates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("identity.json");

        let identity = DeviceIdentity::load_or_generate(&path, "new-node", "linux");
        assert_eq!(identity.device_name, "new-node");
        assert!(path.exists());

        let again = DeviceIdentity::load_or_generate(&path, "other", "linux");
        assert_eq!(again.device_id, identity.device_id);
    }

    #[test]
    fn test_corrupt_identity_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, "{\"deviceName\": 7").unwrap();

        let identity = DeviceIdentity::load_or_generate(&path, "rebuilt", "linux");
        assert_eq!(identity.device_name, "rebuilt");

        let stored = DeviceIdentity::load_or_generate(&path, "ignored", "linux");
        assert_eq!(stored.device_id, identity.device_id);
    }

    #[test]
    fn test_identity_save_reports_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();

        let identity = DeviceIdentity::generate("desk", "linux");
        let result = identity.save_to_file(&blocker.join("identity.json"));
        assert!(matches!(result, Err(EngineError::Io(_))));

        // Generation still succeeds when the identity cannot be stored.
        let fresh = DeviceIdentity::load_or_generate(&blocker.join("identity.json"), "tmp", "linux");
        assert_eq!(fresh.device_name, "tmp");
    }
}
