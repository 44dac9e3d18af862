//! Events and messages published by the link layer

use std::fmt;

use bytes::Bytes;

use peerlink_core::{ConnectionId, MessageId, RemoteClientId};

/// Lifecycle of one link connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// Created, negotiation not started
    Idle,
    /// Offer/answer and candidates are being exchanged
    Negotiating,
    /// Data channel open
    Connected,
    /// Channel lost; may be restarted
    Disconnected,
    /// Final state
    Terminated,
}

impl LinkState {
    /// Whether the connection currently holds or is building a channel
    pub fn is_active(&self) -> bool {
        matches!(self, LinkState::Negotiating | LinkState::Connected)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Idle => "idle",
            LinkState::Negotiating => "negotiating",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// A verified message received from a remote client
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub connection_id: ConnectionId,
    pub remote_client_id: RemoteClientId,
    pub message_id: MessageId,
    pub payload: Bytes,
}

/// Events from the link manager
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    /// A connection moved to a new state
    StateChanged {
        connection_id: ConnectionId,
        remote_client_id: RemoteClientId,
        state: LinkState,
    },
    /// A dropped connection is being retried
    Reconnecting {
        connection_id: ConnectionId,
        remote_client_id: RemoteClientId,
        attempt: u32,
    },
    /// A second connect for a client that already has a live connection
    DuplicateRemoteClient {
        connection_id: ConnectionId,
        remote_client_id: RemoteClientId,
    },
    /// The remote side verified a message we sent
    DeliveryConfirmed {
        connection_id: ConnectionId,
        remote_client_id: RemoteClientId,
        message_id: MessageId,
    },
    /// The remote side rejected a message we sent
    DeliveryFailed {
        connection_id: ConnectionId,
        remote_client_id: RemoteClientId,
        message_id: MessageId,
        error: String,
    },
    /// An incoming message failed verification and was dropped
    MessageRejected {
        connection_id: ConnectionId,
        remote_client_id: RemoteClientId,
        message_id: MessageId,
    },
    /// The relay or a remote client sent something we could not use
    SignalingError {
        connection_id: ConnectionId,
        error: String,
    },
    /// The relay session of a link ended
    RelayDisconnected { connection_id: ConnectionId },
}
