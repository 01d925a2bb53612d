use std::{io, net::SocketAddr};

use thiserror::Error;

/// Raised synchronously at startup; never recoverable.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("local identifier {0} outside [1, 127]")]
    IdentifierOutOfRange(u8),
    #[error("max entry size {0} must be in [1, 65535]")]
    EntrySizeOutOfRange(usize),
    #[error("packet size {0} below the {min} byte minimum", min = crate::config::MIN_PACKET_SIZE)]
    PacketSizeTooSmall(usize),
    #[error("max channels {0} must be in [1, 128]")]
    MaxChannelsOutOfRange(usize),
    #[error("channel {channel} outside [1, {max})")]
    ChannelOutOfRange { channel: u16, max: usize },
    #[error("channel {0} is already registered")]
    ChannelOccupied(u16),
    #[error("heartbeat interval must be non-zero")]
    ZeroHeartbeatInterval,
    #[error("throttle bucket interval must be non-zero")]
    ZeroThrottleInterval,
    #[error("neither a server bind address nor endpoints were configured")]
    NoEndpoints,
    #[error("couldn't bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A peer spoke the protocol wrongly; the session is closed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("entry of {size} bytes exceeds the {max} byte frame limit")]
    EntryTooLarge { size: usize, max: usize },
    #[error("identifier byte {0} outside [1, 127]")]
    InvalidIdentifier(u8),
    #[error("remote identifier {0} collides with the local identifier")]
    IdentifierCollision(u8),
    #[error("identifier {0} already has an active connection")]
    DuplicateConnection(u8),
    #[error("channel {0} has no registered replica")]
    UnknownChannel(u16),
    #[error("truncated stop-bit encoded value")]
    TruncatedStopBit,
    #[error("malformed system channel message")]
    MalformedSystemMessage,
}

/// Failure surfaced by one of the consumed replica interfaces.
#[derive(Error, Debug)]
#[error(transparent)]
pub struct ReplicaError(Box<dyn std::error::Error + Send + Sync>);

impl ReplicaError {
    pub fn new<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self(err.into())
    }
}

impl From<ProtocolError> for ReplicaError {
    fn from(err: ProtocolError) -> Self {
        Self(Box::new(err))
    }
}

/// Per-session failure; decides whether the client side reconnects.
#[derive(Error, Debug)]
pub(crate) enum SessionError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error("no bytes within the heartbeat tolerance")]
    HeartbeatTimeout,
}

impl SessionError {
    /// Identifier collisions and duplicate connections must not be retried;
    /// everything else is treated as transient.
    pub(crate) fn reconnectable(&self) -> bool {
        !matches!(
            self,
            Self::Protocol(
                ProtocolError::IdentifierCollision(_) | ProtocolError::DuplicateConnection(_)
            )
        )
    }
}
