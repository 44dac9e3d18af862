//! Peerlink Link - Peer connections bootstrapped through the relay
//!
//! A link is identified by a [`ConnectionSecret`](peerlink_core::ConnectionSecret)
//! shared out of band. The [`LinkManager`] joins the relay under the derived
//! connection id and runs one [`LinkConnection`] per remote client that shows
//! up there. Each connection negotiates a data channel through a
//! [`PeerTransport`] and then carries chunked, hash-verified messages over it.

pub mod connection;
pub mod error;
pub mod event;
pub mod linking;
pub mod manager;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{
    ConnectionOutputs, ConnectionUpdate, LinkConnection, LinkConnectionHandle, LinkContext, Role,
};
pub use error::{LinkError, TransportError};
pub use event::{InboundMessage, LinkEvent, LinkState};
pub use linking::{LinkClientInteraction, LINK_CLIENT_DISCRIMINATOR};
pub use manager::{LinkManager, LinkManagerConfig, LinkSummary, PeerSummary};
pub use transport::{
    ChannelState, IceCandidate, IceConfig, PeerChannel, PeerTransport, SessionDescription,
    TransportEvent,
};
