use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::protocol::{DATAGRAM_OVERHEAD, MAX_DATAGRAM_SIZE, MESSAGE_OVERHEAD, PROTOCOL_VERSION};

/// Largest UDP payload over IPv4.
const MAX_UDP_PAYLOAD: usize = 65_507;

/// Room for the largest system message.
pub const MIN_MESSAGE_PAYLOAD: usize = 64;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CarrierConfig {
    pub max_connections: usize,
    pub protocol_version: u16,
    /// Largest message payload sent in one piece; reliable payloads above
    /// this are chunked.
    pub max_message_payload: usize,
    pub connection_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub handshake_retry_base_ms: u64,
    pub handshake_retry_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub disconnect_linger_ms: u64,
    pub min_resend_ms: u64,
    pub max_resend_ms: u64,
    pub max_pending_datagrams: usize,
    /// Unacked datagrams allowed before data waits; system messages are
    /// never held.
    pub max_in_flight_datagrams: usize,
    pub bad_packet_limit: u32,
    pub clock_sync_interval_ms: Option<u64>,
    pub compression: bool,
    pub driver: DriverConfig,
    pub heartbeat: HeartbeatConfig,
}

impl Default for CarrierConfig {
    fn default() -> Self {
        Self {
            max_connections: 32,
            protocol_version: PROTOCOL_VERSION,
            max_message_payload: 1024,
            connection_timeout_ms: 5000,
            handshake_timeout_ms: 5000,
            handshake_retry_base_ms: 200,
            handshake_retry_max_ms: 1000,
            heartbeat_interval_ms: 500,
            disconnect_linger_ms: 500,
            min_resend_ms: 50,
            max_resend_ms: 2000,
            max_pending_datagrams: 256,
            max_in_flight_datagrams: 128,
            bad_packet_limit: 32,
            clock_sync_interval_ms: None,
            compression: false,
            driver: DriverConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl CarrierConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: CarrierConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let max_datagram_size = self.driver.max_datagram_size;
        if max_datagram_size > MAX_UDP_PAYLOAD {
            return Err(ConfigError::Invalid(format!(
                "max_datagram_size {} exceeds the UDP limit of {}",
                max_datagram_size, MAX_UDP_PAYLOAD
            )));
        }
        if self.max_message_payload < MIN_MESSAGE_PAYLOAD {
            return Err(ConfigError::Invalid(format!(
                "max_message_payload {} is below the minimum of {}",
                self.max_message_payload, MIN_MESSAGE_PAYLOAD
            )));
        }
        // One byte for the compression hint.
        let worst_case = 1 + DATAGRAM_OVERHEAD + MESSAGE_OVERHEAD + self.max_message_payload;
        if worst_case > max_datagram_size {
            return Err(ConfigError::Invalid(format!(
                "max_message_payload {} does not fit a {} byte datagram",
                self.max_message_payload, max_datagram_size
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.connection_timeout_ms
        {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_interval_ms {} must be positive and below connection_timeout_ms {}",
                self.heartbeat_interval_ms, self.connection_timeout_ms
            )));
        }
        if self.max_in_flight_datagrams == 0
            || self.max_in_flight_datagrams > self.max_pending_datagrams
        {
            return Err(ConfigError::Invalid(format!(
                "max_in_flight_datagrams {} must be positive and at most max_pending_datagrams {}",
                self.max_in_flight_datagrams, self.max_pending_datagrams
            )));
        }
        if self.min_resend_ms > self.max_resend_ms {
            return Err(ConfigError::Invalid(format!(
                "min_resend_ms {} is above max_resend_ms {}",
                self.min_resend_ms, self.max_resend_ms
            )));
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn handshake_retry_base(&self) -> Duration {
        Duration::from_millis(self.handshake_retry_base_ms)
    }

    pub fn handshake_retry_max(&self) -> Duration {
        Duration::from_millis(self.handshake_retry_max_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn disconnect_linger(&self) -> Duration {
        Duration::from_millis(self.disconnect_linger_ms)
    }

    pub fn clock_sync_interval(&self) -> Option<Duration> {
        self.clock_sync_interval_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub broadcast: bool,
    pub ttl: Option<u32>,
    pub max_datagram_size: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            broadcast: false,
            ttl: None,
            max_datagram_size: MAX_DATAGRAM_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub poll_interval_ms: u64,
    /// How long an interface may go without `update` before the heartbeat
    /// thread starts pumping it.
    pub stall_threshold_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            stall_threshold_ms: 250,
        }
    }
}

impl HeartbeatConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}
