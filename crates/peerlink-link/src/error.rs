//! Link layer errors

use thiserror::Error;

use peerlink_core::{ChunkError, CipherError, ConnectionId, RemoteClientId};
use peerlink_signal::SignalingError;

/// Errors reported by a [`PeerTransport`](crate::transport::PeerTransport)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to open peer channel: {0}")]
    Open(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("peer channel closed")]
    Closed,
}

/// Errors surfaced by link connections and the link manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("no connected peers on {0}")]
    NoConnectedPeers(ConnectionId),

    #[error("no link registered for {0}")]
    UnknownLink(ConnectionId),

    #[error("remote client {0} is not connected")]
    PeerNotConnected(RemoteClientId),

    #[error("link terminated")]
    Terminated,

    #[error("a link for {0} already exists")]
    LinkExists(ConnectionId),

    #[error("linking on {0} timed out")]
    LinkingTimedOut(ConnectionId),

    #[error("linking failed: {0}")]
    LinkingFailed(String),

    #[error("invalid signaling payload: {0}")]
    InvalidPayload(String),

    #[error("entropy source unavailable")]
    Entropy,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),
}
