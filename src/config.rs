//! # Configuration Management
//!
//! Server settings, their validation, and the exported-settings wire codec.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Direct instantiation with defaults and `with_*` builders
//!
//! ## Exported settings
//! Only `version`, `connection_test_tries`, and `encryption_enabled` are
//! client-visible; they travel inside the auth-info package as a fixed
//! six-byte big-endian record. Every other field is server-local and never
//! transmitted; the password in particular is neither serialized nor logged.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::error::{Result, TransportError};

/// Current protocol version advertised in the exported settings.
pub const PROTOCOL_VERSION: i32 = 1;

/// Max allowed payload size of a single package (16 MiB).
///
/// The decoder rejects larger length fields before allocating.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Wire size of the exported settings record.
pub const EXPORTED_SETTINGS_LEN: usize = 6;

/// Default number of probe-and-echo rounds in a validation pass.
pub const DEFAULT_CONNECTION_TEST_TRIES: u8 = 3;

/// Default cap on concurrently connected clients.
pub const DEFAULT_MAX_CLIENTS: usize = 15;

/// Default cap on panic recoveries per client before disconnecting it.
pub const DEFAULT_MAX_PANICS: u8 = 5;

/// Server-side settings for a transport instance.
///
/// Defaults match the reference deployment; `validate()` reports every
/// problem found rather than stopping at the first.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Protocol version advertised to clients.
    pub version: i32,

    /// Number of probe-and-echo rounds per validation pass.
    pub connection_test_tries: u8,

    /// Whether mutual authentication and payload encryption are required.
    pub encryption_enabled: bool,

    /// Shared password for the mutual challenge. Never transmitted,
    /// never serialized, zeroized on drop.
    #[serde(skip)]
    pub password: Option<Zeroizing<String>>,

    /// Maximum number of concurrently connected clients.
    pub max_clients: usize,

    /// Panic recoveries tolerated per client before disconnecting it.
    pub max_panics_per_client: u8,

    /// Interval between liveness probes. Zero disables pinging.
    #[serde(with = "duration_serde")]
    pub ping_interval: Duration,

    /// Budget for the pong after a probe. Must stay below `ping_interval`
    /// when pinging is enabled.
    #[serde(with = "duration_serde")]
    pub ping_timeout: Duration,

    /// Per-byte-class deadline for every read past the first byte of a
    /// frame.
    #[serde(with = "duration_serde")]
    pub receive_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            connection_test_tries: DEFAULT_CONNECTION_TEST_TRIES,
            encryption_enabled: true,
            password: None,
            max_clients: DEFAULT_MAX_CLIENTS,
            max_panics_per_client: DEFAULT_MAX_PANICS,
            ping_interval: Duration::from_millis(10_000),
            ping_timeout: Duration::from_millis(8_000),
            receive_timeout: Duration::from_millis(500),
        }
    }
}

impl std::fmt::Debug for ServerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSettings")
            .field("version", &self.version)
            .field("connection_test_tries", &self.connection_test_tries)
            .field("encryption_enabled", &self.encryption_enabled)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("max_clients", &self.max_clients)
            .field("max_panics_per_client", &self.max_panics_per_client)
            .field("ping_interval", &self.ping_interval)
            .field("ping_timeout", &self.ping_timeout)
            .field("receive_timeout", &self.receive_timeout)
            .finish()
    }
}

impl ServerSettings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| TransportError::Config(format!("failed to read settings file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load settings from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| TransportError::Config(format!("failed to parse TOML: {e}")))
    }

    /// Set the shared password.
    pub fn with_password<S: Into<String>>(mut self, password: S) -> Self {
        self.password = Some(Zeroizing::new(password.into()));
        self
    }

    /// Disable authentication and payload encryption.
    pub fn without_encryption(mut self) -> Self {
        self.encryption_enabled = false;
        self
    }

    /// Set the liveness probe cycle. A zero interval disables pinging.
    pub fn with_ping(mut self, interval: Duration, timeout: Duration) -> Self {
        self.ping_interval = interval;
        self.ping_timeout = timeout;
        self
    }

    /// Set the per-byte-class read deadline.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Set the connected-client cap.
    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    /// Validate the settings for common misconfigurations.
    ///
    /// Returns a list of validation errors. Empty list means the settings
    /// are valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.connection_test_tries == 0 {
            errors.push("connection_test_tries must be greater than 0".to_string());
        }

        if self.encryption_enabled && self.password.is_none() {
            errors.push("encryption is enabled but no password is set".to_string());
        }

        if let Some(password) = &self.password {
            if password.is_empty() {
                errors.push("password cannot be empty".to_string());
            }
        }

        if self.max_clients == 0 {
            errors.push("max_clients must be greater than 0".to_string());
        }

        if !self.ping_interval.is_zero() {
            if self.ping_timeout.is_zero() {
                errors.push("ping_timeout must be greater than 0 when pinging".to_string());
            } else if self.ping_timeout >= self.ping_interval {
                errors.push(format!(
                    "ping_timeout ({:?}) must be shorter than ping_interval ({:?})",
                    self.ping_timeout, self.ping_interval
                ));
            }
        }

        if self.receive_timeout.is_zero() {
            errors.push("receive_timeout must be greater than 0".to_string());
        } else if self.receive_timeout.as_secs() > 300 {
            errors.push("receive_timeout too long (maximum: 300s)".to_string());
        }

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TransportError::Config(format!(
                "settings validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }

    /// The client-visible subset of these settings.
    pub fn exported(&self) -> ExportedSettings {
        ExportedSettings {
            version: self.version,
            connection_test_tries: self.connection_test_tries,
            encryption_enabled: self.encryption_enabled,
        }
    }
}

/// Client-visible settings carried in the auth-info package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportedSettings {
    pub version: i32,
    pub connection_test_tries: u8,
    pub encryption_enabled: bool,
}

impl Default for ExportedSettings {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            connection_test_tries: DEFAULT_CONNECTION_TEST_TRIES,
            encryption_enabled: true,
        }
    }
}

impl ExportedSettings {
    /// Encode as the fixed six-byte big-endian record.
    pub fn to_bytes(self) -> [u8; EXPORTED_SETTINGS_LEN] {
        let mut out = [0u8; EXPORTED_SETTINGS_LEN];
        out[0..4].copy_from_slice(&self.version.to_be_bytes());
        out[4] = self.connection_test_tries;
        out[5] = u8::from(self.encryption_enabled);
        out
    }

    /// Decode the fixed six-byte record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != EXPORTED_SETTINGS_LEN {
            return Err(TransportError::Config(format!(
                "exported settings must be {EXPORTED_SETTINGS_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[0..4]);
        Ok(Self {
            version: i32::from_be_bytes(version),
            connection_test_tries: bytes[4],
            encryption_enabled: bytes[5] != 0,
        })
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_once_password_is_set() {
        let settings = ServerSettings::default().with_password("password");
        assert!(settings.validate().is_empty());
    }

    #[test]
    fn encryption_without_password_is_rejected() {
        let settings = ServerSettings::default();
        let errors = settings.validate();
        assert!(errors.iter().any(|e| e.contains("password")));

        let settings = ServerSettings::default().without_encryption();
        assert!(settings.validate().is_empty());
    }

    #[test]
    fn ping_timeout_must_undercut_interval() {
        let settings = ServerSettings::default()
            .without_encryption()
            .with_ping(Duration::from_millis(500), Duration::from_millis(500));
        assert_eq!(settings.validate().len(), 1);

        // zero interval disables the invariant entirely
        let settings = ServerSettings::default()
            .without_encryption()
            .with_ping(Duration::ZERO, Duration::ZERO);
        assert!(settings.validate().is_empty());
    }

    #[test]
    fn exported_settings_roundtrip() {
        let exported = ExportedSettings {
            version: 7,
            connection_test_tries: 9,
            encryption_enabled: false,
        };
        let bytes = exported.to_bytes();
        assert_eq!(bytes.len(), EXPORTED_SETTINGS_LEN);
        assert_eq!(ExportedSettings::from_bytes(&bytes).unwrap(), exported);
    }

    #[test]
    fn exported_settings_wire_layout_is_big_endian() {
        let exported = ExportedSettings {
            version: 0x0102_0304,
            connection_test_tries: 3,
            encryption_enabled: true,
        };
        assert_eq!(exported.to_bytes(), [0x01, 0x02, 0x03, 0x04, 3, 1]);
    }

    #[test]
    fn exported_settings_reject_short_input() {
        assert!(ExportedSettings::from_bytes(&[0u8; 5]).is_err());
        assert!(ExportedSettings::from_bytes(&[0u8; 7]).is_err());
    }

    #[test]
    fn toml_roundtrip_keeps_durations_in_millis() {
        let toml = r#"
            version = 1
            connection_test_tries = 4
            encryption_enabled = false
            max_clients = 3
            max_panics_per_client = 2
            ping_interval = 1000
            ping_timeout = 400
            receive_timeout = 250
        "#;
        let settings = ServerSettings::from_toml(toml).unwrap();
        assert_eq!(settings.connection_test_tries, 4);
        assert_eq!(settings.ping_interval, Duration::from_millis(1000));
        assert_eq!(settings.receive_timeout, Duration::from_millis(250));
        assert!(settings.password.is_none());
    }

    #[test]
    fn debug_output_redacts_password() {
        let settings = ServerSettings::default().with_password("hunter2");
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("redacted"));
    }
}
