//! # Configuration Management
//!
//! Centralized configuration for networks and the connections they create.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - TOML strings via `from_toml()`
//! - Environment overrides via `from_env()`
//! - Direct instantiation with defaults
//!
//! ## Sections
//! - `framing`: header widths, byte order, size limit
//! - `buffers`: read/pending/write buffer sizes and the reuse policy
//! - `connection`: per-read fairness bound, framing error policy, log visibility
//! - `logging`: subscriber setup used by [`crate::utils::logging`]

use crate::core::framing::{ByteOrder, Framing};
use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::Level;

/// Default width of the length header in bytes
pub const DEFAULT_LENGTH_HEADER_BYTES: usize = 2;

/// Default upper bound on a single packet, header included (16 MB)
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Default capacity of the read and pending buffers
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Default capacity of the write buffer
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 8 * 1024;

/// Default number of packets framed per read completion
pub const DEFAULT_MAX_PACKETS_PER_READ: usize = 64;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Wire framing configuration
    #[serde(default)]
    pub framing: FramingConfig,

    /// Buffer sizing and reuse configuration
    #[serde(default)]
    pub buffers: BufferConfig,

    /// Per-connection behavior
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables layered over the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(width) = std::env::var("PACKET_CHANNEL_LENGTH_HEADER_BYTES") {
            if let Ok(val) = width.parse::<usize>() {
                config.framing.length_header_bytes = val;
            }
        }

        if let Ok(width) = std::env::var("PACKET_CHANNEL_ID_HEADER_BYTES") {
            if let Ok(val) = width.parse::<usize>() {
                config.framing.id_header_bytes = val;
            }
        }

        if let Ok(order) = std::env::var("PACKET_CHANNEL_BYTE_ORDER") {
            match order.to_ascii_lowercase().as_str() {
                "big" | "big_endian" => config.framing.byte_order = ByteOrder::BigEndian,
                "little" | "little_endian" => config.framing.byte_order = ByteOrder::LittleEndian,
                other => {
                    return Err(ProtocolError::ConfigError(format!(
                        "Invalid byte order in PACKET_CHANNEL_BYTE_ORDER: {other}"
                    )))
                }
            }
        }

        if let Ok(size) = std::env::var("PACKET_CHANNEL_MAX_PACKET_SIZE") {
            if let Ok(val) = size.parse::<usize>() {
                config.framing.max_packet_size = val;
            }
        }

        if let Ok(size) = std::env::var("PACKET_CHANNEL_READ_BUFFER_SIZE") {
            if let Ok(val) = size.parse::<usize>() {
                config.buffers.read_buffer_size = val;
            }
        }

        if let Ok(size) = std::env::var("PACKET_CHANNEL_WRITE_BUFFER_SIZE") {
            if let Ok(val) = size.parse::<usize>() {
                config.buffers.write_buffer_size = val;
            }
        }

        if let Ok(reuse) = std::env::var("PACKET_CHANNEL_REUSE_BUFFERS") {
            if let Ok(val) = reuse.parse::<bool>() {
                config.buffers.reuse_buffers = val;
            }
        }

        if let Ok(count) = std::env::var("PACKET_CHANNEL_MAX_PACKETS_PER_READ") {
            if let Ok(val) = count.parse::<usize>() {
                config.connection.max_packets_per_read = val;
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        errors.extend(self.framing.validate());
        errors.extend(self.buffers.validate());
        errors.extend(self.connection.validate());
        errors.extend(self.logging.validate());

        // Cross-section: a buffer must at least hold one header
        let header = self.framing.length_header_bytes + self.framing.id_header_bytes;
        if self.buffers.read_buffer_size < header {
            errors.push(format!(
                "Read buffer size {} cannot hold a {}-byte packet header",
                self.buffers.read_buffer_size, header
            ));
        }

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }

    /// Build the wire framing described by the `framing` section
    pub fn framing(&self) -> Result<Framing> {
        Framing::new(
            self.framing.length_header_bytes,
            self.framing.id_header_bytes,
            self.framing.byte_order,
        )
        .map(|framing| framing.with_max_packet_size(self.framing.max_packet_size))
    }
}

/// Wire framing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FramingConfig {
    /// Width of the length header: 1, 2 or 4 bytes
    pub length_header_bytes: usize,

    /// Width of the packet id after the length header: 0 (no id), 1, 2 or 4 bytes
    #[serde(default)]
    pub id_header_bytes: usize,

    /// Byte order of the length and id headers
    #[serde(default)]
    pub byte_order: ByteOrder,

    /// Largest accepted packet, header included
    pub max_packet_size: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            length_header_bytes: DEFAULT_LENGTH_HEADER_BYTES,
            id_header_bytes: 0,
            byte_order: ByteOrder::BigEndian,
            max_packet_size: u16::MAX as usize,
        }
    }
}

impl FramingConfig {
    /// Validate framing configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !matches!(self.length_header_bytes, 1 | 2 | 4) {
            errors.push(format!(
                "Invalid length header width: {} (valid: 1, 2, 4)",
                self.length_header_bytes
            ));
        }

        if !matches!(self.id_header_bytes, 0 | 1 | 2 | 4) {
            errors.push(format!(
                "Invalid id header width: {} (valid: 0, 1, 2, 4)",
                self.id_header_bytes
            ));
        }

        let header = self.length_header_bytes + self.id_header_bytes;
        if self.max_packet_size <= header {
            errors.push(format!(
                "Max packet size {} leaves no room for a body after the {}-byte header",
                self.max_packet_size, header
            ));
        } else if self.max_packet_size > MAX_PACKET_SIZE {
            errors.push(format!(
                "Max packet size too large: {} bytes (maximum: {} bytes)",
                self.max_packet_size, MAX_PACKET_SIZE
            ));
        }

        if matches!(self.length_header_bytes, 1 | 2) {
            let representable = (1usize << (self.length_header_bytes * 8)) - 1;
            if self.max_packet_size > representable {
                errors.push(format!(
                    "Max packet size {} cannot be expressed in a {}-byte length header (limit {})",
                    self.max_packet_size, self.length_header_bytes, representable
                ));
            }
        }

        errors
    }
}

/// Buffer sizing and reuse configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BufferConfig {
    /// Capacity of each read buffer
    pub read_buffer_size: usize,

    /// Capacity of each carry-over buffer
    pub pending_buffer_size: usize,

    /// Capacity of each write buffer
    pub write_buffer_size: usize,

    /// Recycle buffers through pools instead of allocating per use
    pub reuse_buffers: bool,

    /// Upper bound on retained buffers per pool
    pub max_pooled_buffers: usize,

    /// Buffers that grew beyond this capacity are discarded instead of pooled
    pub max_pooled_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            pending_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            reuse_buffers: false,
            max_pooled_buffers: 256,
            max_pooled_capacity: 1024 * 1024,
        }
    }
}

impl BufferConfig {
    /// Validate buffer configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (name, size) in [
            ("Read", self.read_buffer_size),
            ("Pending", self.pending_buffer_size),
            ("Write", self.write_buffer_size),
        ] {
            if size == 0 {
                errors.push(format!("{name} buffer size must be greater than 0"));
            } else if size > 64 * 1024 * 1024 {
                errors.push(format!(
                    "{name} buffer size too large: {size} bytes (maximum: 64 MB)"
                ));
            }
        }

        if self.reuse_buffers {
            if self.max_pooled_buffers == 0 {
                errors.push(
                    "Max pooled buffers must be greater than 0 when buffer reuse is enabled"
                        .to_string(),
                );
            }

            if self.max_pooled_capacity < self.read_buffer_size
                || self.max_pooled_capacity < self.write_buffer_size
            {
                errors.push(
                    "Max pooled capacity is smaller than a role buffer; nothing would be reused"
                        .to_string(),
                );
            }
        }

        errors
    }
}

/// What the read lane does with a packet it cannot decode.
///
/// Applies to per-packet failures whose boundary is still known: an unknown
/// id, a body the decoder rejects, or a decoder that panics. Malformed
/// lengths, oversized packets and frames without the id the decoder needs
/// close the connection under either policy.
///
/// The default is [`FramingErrorPolicy::Close`]: a peer sending packets this
/// side cannot read gets disconnected. Select [`FramingErrorPolicy::Drop`]
/// (`framing_error_policy = "drop"`) to log, count and skip them instead,
/// e.g. when newer peers may send ids this build does not register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FramingErrorPolicy {
    /// Tear the connection down
    #[default]
    Close,
    /// Drop the offending packet and keep framing, when its boundary is known
    Drop,
}

/// Per-connection behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Packets framed per read completion before the lane yields
    pub max_packets_per_read: usize,

    /// Reaction to undecodable packets
    #[serde(default)]
    pub framing_error_policy: FramingErrorPolicy,

    /// Level at which failed writes are logged
    #[serde(with = "log_level_serde")]
    pub write_failure_log_level: Level,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_packets_per_read: DEFAULT_MAX_PACKETS_PER_READ,
            framing_error_policy: FramingErrorPolicy::Close,
            write_failure_log_level: Level::WARN,
        }
    }
}

impl ConnectionConfig {
    /// Validate connection configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_packets_per_read == 0 {
            errors.push("Max packets per read must be greater than 0".to_string());
        } else if self.max_packets_per_read > 1_000_000 {
            errors.push(format!(
                "Max packets per read too large: {} (max recommended: 1,000,000)",
                self.max_packets_per_read
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,

    /// Include source file and line in each event
    pub with_source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("packet-channel"),
            log_level: Level::INFO,
            json_format: false,
            with_source_location: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = level.as_str().to_ascii_lowercase();
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_overrides() {
        std::env::set_var("PACKET_CHANNEL_ID_HEADER_BYTES", "2");
        std::env::set_var("PACKET_CHANNEL_BYTE_ORDER", "little");
        std::env::set_var("PACKET_CHANNEL_MAX_PACKETS_PER_READ", "not-a-number");

        let config = NetworkConfig::from_env().expect("env config");
        assert_eq!(config.framing.id_header_bytes, 2);
        assert_eq!(config.framing.byte_order, ByteOrder::LittleEndian);
        // Unparsable values keep the default
        assert_eq!(
            config.connection.max_packets_per_read,
            DEFAULT_MAX_PACKETS_PER_READ
        );

        std::env::set_var("PACKET_CHANNEL_BYTE_ORDER", "middle");
        assert!(NetworkConfig::from_env().is_err());

        for key in [
            "PACKET_CHANNEL_ID_HEADER_BYTES",
            "PACKET_CHANNEL_BYTE_ORDER",
            "PACKET_CHANNEL_MAX_PACKETS_PER_READ",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_framing_from_config() {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.framing.length_header_bytes = 4;
            c.framing.id_header_bytes = 1;
            c.framing.max_packet_size = 4096;
        });
        let framing = config.framing().expect("framing");
        assert_eq!(framing.header_len(), 5);
        assert_eq!(framing.max_packet_size(), 4096);
    }

    #[test]
    fn test_framing_error_policy_selection() {
        assert_eq!(
            NetworkConfig::default().connection.framing_error_policy,
            FramingErrorPolicy::Close
        );

        let config = NetworkConfig::from_toml(
            r#"
            [connection]
            max_packets_per_read = 8
            framing_error_policy = "drop"
            write_failure_log_level = "debug"
            "#,
        )
        .expect("toml config");
        assert_eq!(config.connection.framing_error_policy, FramingErrorPolicy::Drop);
        assert_eq!(config.connection.write_failure_log_level, Level::DEBUG);
    }
}
