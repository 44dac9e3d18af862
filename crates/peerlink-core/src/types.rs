//! Identifiers shared by the signaling and link layers

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::crypto::{derive_connection_id, random_hex, RandomError};
use crate::error::IdError;

/// Length of a connection secret in bytes
pub const SECRET_LEN: usize = 32;

/// Shared secret identifying one logical peer link
///
/// The secret is key material for the cipher collaborator and is never sent
/// to the relay; only the derived [`ConnectionId`] is.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionSecret([u8; SECRET_LEN]);

impl ConnectionSecret {
    pub fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a secret from its 64-character hex form
    pub fn from_hex(s: &str) -> Result<Self, IdError> {
        let mut bytes = [0u8; SECRET_LEN];
        hex::decode_to_slice(s.trim(), &mut bytes)
            .map_err(|e| IdError::InvalidSecret(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Generate a fresh random secret
    pub fn generate() -> Result<Self, RandomError> {
        let mut bytes = [0u8; SECRET_LEN];
        getrandom::getrandom(&mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Public relay correlator for this secret
    pub fn connection_id(&self) -> ConnectionId {
        ConnectionId(derive_connection_id(&self.0))
    }
}

impl fmt::Debug for ConnectionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConnectionSecret(<redacted>)")
    }
}

/// Public correlator derived from a [`ConnectionSecret`]
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Relay-assigned identifier of one concrete remote endpoint
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteClientId(String);

impl RemoteClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RemoteClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RemoteClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Which side of a link a relay client speaks for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientSource {
    Wallet,
    Extension,
}

impl ClientSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientSource::Wallet => "wallet",
            ClientSource::Extension => "extension",
        }
    }

    /// The side this one talks to
    pub fn counterpart(&self) -> Self {
        match self {
            ClientSource::Wallet => ClientSource::Extension,
            ClientSource::Extension => ClientSource::Wallet,
        }
    }
}

impl fmt::Display for ClientSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientSource {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wallet" => Ok(ClientSource::Wallet),
            "extension" => Ok(ClientSource::Extension),
            other => Err(IdError::InvalidSource(other.to_string())),
        }
    }
}

/// Identifier of one chunked message
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random message id
    pub fn generate() -> Result<Self, RandomError> {
        random_hex(16).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
