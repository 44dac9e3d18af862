//! Signaling error types

use thiserror::Error;

/// Errors from a relay session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),

    #[error("relay connection failed: {0}")]
    Connect(String),

    #[error("relay connection timed out")]
    Timeout,

    #[error("not connected to relay")]
    NotConnected,

    #[error("relay send failed: {0}")]
    Send(String),

    #[error("envelope encode failed: {0}")]
    Encode(String),
}

/// Errors raised by the relay hub
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("room is full")]
    RoomFull,

    #[error("entropy source unavailable")]
    Rng,
}
