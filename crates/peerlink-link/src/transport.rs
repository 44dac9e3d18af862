//! Peer transport seam
//!
//! The link layer drives negotiation and framing; the transport owns the
//! actual data channel. Implementations push [`TransportEvent`]s into the
//! channel handed to [`PeerTransport::open`] and never block on it for long.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use peerlink_core::{IceServerConfig, TransportConfig};

use crate::error::TransportError;

/// ICE configuration handed to the transport
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IceConfig {
    pub servers: Vec<IceServerConfig>,
}

impl From<&TransportConfig> for IceConfig {
    fn from(config: &TransportConfig) -> Self {
        Self {
            servers: config.ice_servers.clone(),
        }
    }
}

/// Session description payload of an offer or answer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
}

/// Connectivity candidate exchanged through the relay
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
}

/// Data channel state as reported by the transport
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
    Failed,
}

/// Events raised by an open peer channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local candidate to forward to the remote client
    LocalIceCandidate(IceCandidate),
    StateChanged(ChannelState),
    /// One frame from the remote side
    Received(Vec<u8>),
}

/// One negotiated (or negotiating) data channel
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Create a local offer and return its SDP
    async fn create_offer(&self) -> Result<String, TransportError>;

    /// Apply a remote offer and return the local answer SDP
    async fn accept_offer(&self, sdp: &str) -> Result<String, TransportError>;

    /// Apply the remote answer to a local offer
    async fn accept_answer(&self, sdp: &str) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    /// Send one frame; frames are delivered reliably and in order
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Creates peer channels
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn open(
        &self,
        ice: &IceConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn PeerChannel>, TransportError>;
}
