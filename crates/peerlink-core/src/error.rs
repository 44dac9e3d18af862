//! Error types for the peerlink codec and collaborators

use thiserror::Error;

use crate::types::MessageId;

/// Chunking and reassembly errors
///
/// All of these are recovered locally by the owner of the assembler; none of
/// them tear down a connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("chunk size must be at least one byte")]
    InvalidChunkSize,

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("frame decode failed: {0}")]
    Decode(String),

    #[error("frame encode failed: {0}")]
    Encode(String),

    #[error("malformed frame for message {message_id}: {reason}")]
    Malformed { message_id: MessageId, reason: String },

    #[error("frame for unknown message {0}")]
    UnknownMessage(MessageId),

    #[error("control frame cannot be reassembled")]
    UnexpectedFrame,
}

impl ChunkError {
    pub(crate) fn malformed(message_id: &MessageId, reason: impl Into<String>) -> Self {
        ChunkError::Malformed {
            message_id: message_id.clone(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for ChunkError {
    fn from(e: serde_json::Error) -> Self {
        ChunkError::Decode(e.to_string())
    }
}

/// Errors reported by a [`PayloadCipher`](crate::crypto::PayloadCipher)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),
}

/// Identifier parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid connection secret: {0}")]
    InvalidSecret(String),

    #[error("unknown client source: {0}")]
    InvalidSource(String),
}
