//! Peerlink Core - Shared types, chunked message codec, and configuration
//!
//! This crate contains the foundational types used across all peerlink components.
//! It has no dependencies on networking code.
//!
//! # Chunking protocol
//!
//! A payload travels over the peer channel as one metadata frame followed by
//! `chunk_count` data frames. Frames may arrive in any order; the receiving
//! [`Assembler`] buffers them per message id and verifies the SHA-256 digest of
//! the reassembled payload before releasing it.

pub mod assembler;
pub mod chunk;
pub mod config;
pub mod crypto;
pub mod error;
pub mod types;

pub use assembler::{Assembler, AssemblerConfig, ReassemblyOutcome};
pub use chunk::{split, ChunkFrame, Frame, MetadataFrame, ReceiveConfirmation, ReceiveError};
pub use config::{
    Config, ConfigError, IceServerConfig, ReassemblyConfig, ReconnectConfig, RelayConfig,
    SignalingConfig, TransportConfig,
};
pub use crypto::{PayloadCipher, RandomError};
pub use error::*;
pub use types::*;

/// Default maximum size of one frame's raw chunk data in bytes
pub const DEFAULT_CHUNK_SIZE: usize = 15_441;

/// Length of a payload digest (SHA-256)
pub const DIGEST_LEN: usize = 32;

/// Default idle timeout for an incomplete reassembly buffer in seconds
pub const DEFAULT_REASSEMBLY_TIMEOUT_SECS: u64 = 60;

/// Default maximum number of concurrently pending messages per connection
pub const DEFAULT_MAX_PENDING_MESSAGES: usize = 64;

/// Default maximum size of a single reassembled message (16 MB)
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
