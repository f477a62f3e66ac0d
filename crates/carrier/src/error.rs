use std::io;
use std::net::SocketAddr;

use rkyv::{Archive, Deserialize, Serialize};

use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::connection::{ConnectionId, ConnectionState};

#[derive(Debug, thiserror::Error)]
pub enum CarrierError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("connection {id} is {state}, not connected")]
    NotConnected {
        id: ConnectionId,
        state: ConnectionState,
    },
    #[error("channel {0} is reserved or out of range")]
    InvalidChannel(u8),
    #[error("payload of {size} bytes exceeds the limit of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("already connected to {0}")]
    AlreadyConnected(SocketAddr),
    #[error("connection limit of {0} reached")]
    ConnectionLimit(usize),
    #[error("invalid connection state transition {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("ack {ack} references a datagram that was never sent")]
    InvalidAck { ack: u16 },
}

/// Why a connection went away. Travels on the wire inside `Disconnect` and
/// `ConnectDenied` system messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum DisconnectReason {
    UserRequested,
    BadConnection,
    BadPackets,
    DriverError,
    HandshakeRejected,
    HandshakeTimeout,
    AlreadyConnected,
    ShuttingDown,
    VersionMismatch,
    ServerFull,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::UserRequested => "user requested",
            DisconnectReason::BadConnection => "connection lost",
            DisconnectReason::BadPackets => "bad data packets",
            DisconnectReason::DriverError => "socket driver error",
            DisconnectReason::HandshakeRejected => "handshake rejected",
            DisconnectReason::HandshakeTimeout => "handshake timed out",
            DisconnectReason::AlreadyConnected => "already connected from that address",
            DisconnectReason::ShuttingDown => "shutting down",
            DisconnectReason::VersionMismatch => "protocol version mismatch",
            DisconnectReason::ServerFull => "server full",
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
