//! Peerlink Signal
//!
//! Relay signaling for bootstrapping direct peer channels.
//! Both sides of a link connect to the relay under the same connection id and
//! exchange encrypted offer, answer and ICE candidate envelopes through it.
//!
//! # Protocol
//!
//! 1. Client opens `<relay>/<connectionId>?source=wallet&target=extension`
//! 2. Relay announces counterparts with `remoteClientJustConnected` /
//!    `remoteClientIsAlreadyConnected`
//! 3. Clients send envelopes; the relay forwards them as `remoteData` and
//!    confirms delivery to the sender with `confirmation`
//! 4. Relay reports `remoteClientDisconnected` when a counterpart leaves
//!
//! The [`relay`] module contains a complete relay so links can be exercised
//! without the production service.

pub mod client;
pub mod error;
pub mod messages;
pub mod relay;
pub mod session;

pub use client::{relay_url, SignalingClient, WebSocketConnector};
pub use error::{RelayError, SignalingError};
pub use messages::{
    decode_notification, RequestId, SignalingEnvelope, SignalingMethod, SignalingNotification,
};
pub use relay::{MemoryConnector, RelayHub, RelayServer};
pub use session::{EnvelopeSink, NotificationFanout, NotificationStream, RelayConnector, RelaySession};

/// Default relay port
pub const DEFAULT_PORT: u16 = 8080;
