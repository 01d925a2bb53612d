use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    replica::{NodeId, is_valid_node_id},
};

/// Room for the 17-byte preamble plus a couple of frames.
pub(crate) const MIN_PACKET_SIZE: usize = 128;

pub(crate) const MAX_CHANNELS_LIMIT: usize = 128;

/// Transport configuration, validated once at startup.
///
/// ```
/// use meshmap::ReplicationConfig;
///
/// let cfg = ReplicationConfig::new(1)
///     .with_server("0.0.0.0:8076".parse().unwrap())
///     .with_heartbeat_interval_ms(10_000);
/// assert!(cfg.validate().is_ok());
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// This node's identifier, `[1, 127]`, distinct per peer.
    pub local_identifier: NodeId,
    /// Bind address for the passive connector; `None` for dial-out only
    /// nodes.
    pub server: Option<SocketAddr>,
    /// Remote endpoints dialed by active connectors.
    pub endpoints: Vec<SocketAddr>,
    /// Local heartbeat send interval and the default receive tolerance base.
    pub heartbeat_interval_ms: u64,
    /// Nominal per-socket buffer page.
    pub packet_size: usize,
    /// Upper bound on one externalized entry; at most 65535.
    pub max_entry_size: usize,
    /// Long-term byte budget; 0 disables throttling.
    pub throttle_bits_per_day: u64,
    /// Token-bucket granularity.
    pub throttle_bucket_interval_ms: u64,
    /// Number of logical channel slots, at most 128. Channel 0 is reserved.
    pub max_channels: usize,
}

impl ReplicationConfig {
    pub fn new(local_identifier: NodeId) -> Self {
        Self {
            local_identifier,
            server: None,
            endpoints: Vec::new(),
            heartbeat_interval_ms: 20_000,
            packet_size: 8 * 1024,
            max_entry_size: 1024,
            throttle_bits_per_day: 0,
            throttle_bucket_interval_ms: 100,
            max_channels: MAX_CHANNELS_LIMIT,
        }
    }

    pub fn with_server(mut self, addr: SocketAddr) -> Self {
        self.server = Some(addr);
        self
    }

    pub fn with_endpoints<I>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        self.endpoints = endpoints.into_iter().collect();
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_packet_size(mut self, packet_size: usize) -> Self {
        self.packet_size = packet_size;
        self
    }

    pub fn with_max_entry_size(mut self, max_entry_size: usize) -> Self {
        self.max_entry_size = max_entry_size;
        self
    }

    pub fn with_throttle(mut self, bits_per_day: u64, bucket_interval_ms: u64) -> Self {
        self.throttle_bits_per_day = bits_per_day;
        self.throttle_bucket_interval_ms = bucket_interval_ms;
        self
    }

    pub fn with_max_channels(mut self, max_channels: usize) -> Self {
        self.max_channels = max_channels;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_node_id(self.local_identifier) {
            return Err(ConfigError::IdentifierOutOfRange(self.local_identifier));
        }
        if self.max_entry_size == 0 || self.max_entry_size > u16::MAX as usize {
            return Err(ConfigError::EntrySizeOutOfRange(self.max_entry_size));
        }
        if self.packet_size < MIN_PACKET_SIZE {
            return Err(ConfigError::PacketSizeTooSmall(self.packet_size));
        }
        if self.max_channels == 0 || self.max_channels > MAX_CHANNELS_LIMIT {
            return Err(ConfigError::MaxChannelsOutOfRange(self.max_channels));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::ZeroHeartbeatInterval);
        }
        if self.throttle_bits_per_day > 0 && self.throttle_bucket_interval_ms == 0 {
            return Err(ConfigError::ZeroThrottleInterval);
        }
        if self.server.is_none() && self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        Ok(())
    }

    /// One full packet plus headroom for a maximum-size staged entry.
    pub(crate) fn buffer_capacity(&self) -> usize {
        self.packet_size + self.max_entry_size
    }
}
