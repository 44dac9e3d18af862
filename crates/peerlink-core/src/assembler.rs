//! Reassembly of chunked messages
//!
//! The [`Assembler`] keeps one buffer per message id. Buffers are created on
//! the first frame seen for an id, whichever frame that is, and are destroyed
//! when the message completes, fails verification, sits idle past the timeout,
//! or is pushed out by the pending-message cap. Ids of destroyed buffers are
//! remembered in a bounded LRU so late frames are reported as
//! [`ChunkError::UnknownMessage`] instead of opening a new buffer.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::{debug, warn};

use crate::chunk::{chunk_count, ChunkFrame, Frame, MetadataFrame};
use crate::config::ReassemblyConfig;
use crate::crypto::sha256;
use crate::error::ChunkError;
use crate::types::MessageId;
use crate::{DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_MAX_PENDING_MESSAGES, DEFAULT_REASSEMBLY_TIMEOUT_SECS, DIGEST_LEN};

/// Assembler limits
#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    /// Incomplete buffers idle for this long are evicted
    pub idle_timeout: Duration,
    /// Maximum number of incomplete messages held at once
    pub max_pending: usize,
    /// Maximum declared or buffered size of one message
    pub max_message_bytes: usize,
    /// Number of finished message ids remembered
    pub tombstone_capacity: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(DEFAULT_REASSEMBLY_TIMEOUT_SECS),
            max_pending: DEFAULT_MAX_PENDING_MESSAGES,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            tombstone_capacity: 1024,
        }
    }
}

impl From<&ReassemblyConfig> for AssemblerConfig {
    fn from(config: &ReassemblyConfig) -> Self {
        Self {
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            max_pending: config.max_pending_messages,
            max_message_bytes: config.max_message_bytes,
            tombstone_capacity: config.tombstone_capacity,
        }
    }
}

/// Result of feeding one frame to the assembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyOutcome {
    /// More frames are needed
    Pending,
    /// Every chunk arrived and the digest matched
    Ready { message_id: MessageId, payload: Vec<u8> },
    /// Every chunk arrived but the digest (or byte count) did not match
    HashMismatch(MessageId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Expected {
    chunk_count: u32,
    payload_hash: [u8; DIGEST_LEN],
    payload_byte_count: u32,
}

impl From<&MetadataFrame> for Expected {
    fn from(m: &MetadataFrame) -> Self {
        Self {
            chunk_count: m.chunk_count,
            payload_hash: m.payload_hash,
            payload_byte_count: m.payload_byte_count,
        }
    }
}

/// Partially received message
#[derive(Debug)]
struct ReassemblyBuffer {
    expected: Option<Expected>,
    chunks: HashMap<u32, Vec<u8>>,
    buffered_bytes: usize,
    last_activity: Instant,
}

impl ReassemblyBuffer {
    fn new(now: Instant) -> Self {
        Self {
            expected: None,
            chunks: HashMap::new(),
            buffered_bytes: 0,
            last_activity: now,
        }
    }

    fn is_complete(&self) -> bool {
        match &self.expected {
            Some(expected) => self.chunks.len() == expected.chunk_count as usize,
            None => false,
        }
    }

    fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= timeout
    }
}

/// Reassembles and verifies chunked messages
#[derive(Debug)]
pub struct Assembler {
    config: AssemblerConfig,
    buffers: HashMap<MessageId, ReassemblyBuffer>,
    tombstones: LruCache<MessageId, ()>,
}

impl Assembler {
    pub fn new(config: AssemblerConfig) -> Self {
        let capacity = NonZeroUsize::new(config.tombstone_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            buffers: HashMap::new(),
            tombstones: LruCache::new(capacity),
        }
    }

    /// Feed one frame using the current time
    pub fn ingest(&mut self, frame: &Frame) -> Result<ReassemblyOutcome, ChunkError> {
        self.ingest_at(frame, Instant::now())
    }

    /// Feed one frame at an explicit point in time
    pub fn ingest_at(&mut self, frame: &Frame, now: Instant) -> Result<ReassemblyOutcome, ChunkError> {
        match frame {
            Frame::Metadata(metadata) => self.ingest_metadata(metadata, now),
            Frame::Chunk(chunk) => self.ingest_chunk(chunk, now),
            _ => Err(ChunkError::UnexpectedFrame),
        }
    }

    pub fn ingest_metadata(
        &mut self,
        metadata: &MetadataFrame,
        now: Instant,
    ) -> Result<ReassemblyOutcome, ChunkError> {
        let id = &metadata.message_id;
        self.check_not_finished(id)?;

        if metadata.chunk_count == 0 {
            self.discard(id);
            return Err(ChunkError::malformed(id, "chunk count is zero"));
        }
        if metadata.payload_byte_count as usize > self.config.max_message_bytes {
            self.discard(id);
            return Err(ChunkError::malformed(
                id,
                format!(
                    "declared size {} exceeds {}",
                    metadata.payload_byte_count, self.config.max_message_bytes
                ),
            ));
        }
        if metadata.chunk_count > metadata.payload_byte_count.max(1) {
            self.discard(id);
            return Err(ChunkError::malformed(
                id,
                format!(
                    "{} chunks cannot carry {} bytes",
                    metadata.chunk_count, metadata.payload_byte_count
                ),
            ));
        }

        let expected = Expected::from(metadata);
        let buffer = self.buffer_for(id, now);
        buffer.last_activity = now;

        match &buffer.expected {
            Some(existing) if *existing != expected => {
                self.discard(id);
                return Err(ChunkError::malformed(id, "conflicting metadata"));
            }
            Some(_) => {}
            None => {
                let out_of_range = buffer.chunks.keys().any(|index| *index >= expected.chunk_count);
                if out_of_range {
                    self.discard(id);
                    return Err(ChunkError::malformed(id, "buffered chunk index out of range"));
                }
                buffer.expected = Some(expected);
            }
        }

        Ok(self.try_complete(id))
    }

    pub fn ingest_chunk(&mut self, chunk: &ChunkFrame, now: Instant) -> Result<ReassemblyOutcome, ChunkError> {
        let id = &chunk.message_id;
        self.check_not_finished(id)?;

        // Decode before touching any state so garbage never opens a buffer
        let data = chunk.data()?;
        let max_message_bytes = self.config.max_message_bytes;

        // Only the single chunk of an empty message carries no data
        if data.is_empty() && chunk.chunk_index != 0 {
            self.discard(id);
            return Err(ChunkError::malformed(
                id,
                format!("chunk {} is empty", chunk.chunk_index),
            ));
        }

        let buffer = self.buffer_for(id, now);
        match &buffer.expected {
            Some(expected) if chunk.chunk_index >= expected.chunk_count => {
                return Err(ChunkError::malformed(
                    id,
                    format!(
                        "chunk index {} out of range (count {})",
                        chunk.chunk_index, expected.chunk_count
                    ),
                ));
            }
            Some(_) => {}
            None => {
                let max_chunks = chunk_count(max_message_bytes, 1);
                let is_new = !buffer.chunks.contains_key(&chunk.chunk_index);
                if is_new && buffer.chunks.len() >= max_chunks {
                    self.discard(id);
                    return Err(ChunkError::malformed(
                        id,
                        format!("more than {} chunks buffered without metadata", max_chunks),
                    ));
                }
            }
        }

        let replaced = buffer.chunks.get(&chunk.chunk_index).map_or(0, Vec::len);
        let buffered = buffer.buffered_bytes - replaced + data.len();
        if buffered > max_message_bytes {
            self.discard(id);
            return Err(ChunkError::malformed(
                id,
                format!("buffered {} bytes exceeds {}", buffered, max_message_bytes),
            ));
        }

        buffer.buffered_bytes = buffered;
        buffer.chunks.insert(chunk.chunk_index, data);
        buffer.last_activity = now;

        Ok(self.try_complete(id))
    }

    /// Drop buffers that have been idle past the timeout
    ///
    /// Returns the ids that were evicted.
    pub fn evict_expired(&mut self, now: Instant) -> Vec<MessageId> {
        let timeout = self.config.idle_timeout;
        let expired: Vec<MessageId> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| buffer.is_idle(now, timeout))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            debug!("Evicting idle reassembly buffer for message {}", id);
            self.discard(id);
        }
        expired
    }

    /// Number of incomplete messages currently buffered
    pub fn pending_count(&self) -> usize {
        self.buffers.len()
    }

    /// Drop every buffer
    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    fn check_not_finished(&self, id: &MessageId) -> Result<(), ChunkError> {
        if self.tombstones.contains(id) {
            return Err(ChunkError::UnknownMessage(id.clone()));
        }
        Ok(())
    }

    fn buffer_for(&mut self, id: &MessageId, now: Instant) -> &mut ReassemblyBuffer {
        if !self.buffers.contains_key(id) {
            self.evict_expired(now);
            if self.buffers.len() >= self.config.max_pending {
                self.evict_least_recent();
            }
        }
        self.buffers
            .entry(id.clone())
            .or_insert_with(|| ReassemblyBuffer::new(now))
    }

    fn evict_least_recent(&mut self) {
        let oldest = self
            .buffers
            .iter()
            .min_by_key(|(_, buffer)| buffer.last_activity)
            .map(|(id, _)| id.clone());

        if let Some(id) = oldest {
            warn!("Pending message limit reached, evicting message {}", id);
            self.discard(&id);
        }
    }

    fn discard(&mut self, id: &MessageId) {
        self.buffers.remove(id);
        self.tombstones.put(id.clone(), ());
    }

    fn try_complete(&mut self, id: &MessageId) -> ReassemblyOutcome {
        let complete = self.buffers.get(id).is_some_and(ReassemblyBuffer::is_complete);
        if !complete {
            return ReassemblyOutcome::Pending;
        }

        let Some(mut buffer) = self.buffers.remove(id) else {
            return ReassemblyOutcome::Pending;
        };
        self.tombstones.put(id.clone(), ());

        let Some(expected) = buffer.expected.take() else {
            return ReassemblyOutcome::Pending;
        };

        let mut payload = Vec::with_capacity(buffer.buffered_bytes);
        for index in 0..expected.chunk_count {
            match buffer.chunks.remove(&index) {
                Some(data) => payload.extend_from_slice(&data),
                None => return ReassemblyOutcome::HashMismatch(id.clone()),
            }
        }

        if payload.len() != expected.payload_byte_count as usize {
            warn!(
                "Message {} reassembled to {} bytes, expected {}",
                id,
                payload.len(),
                expected.payload_byte_count
            );
            return ReassemblyOutcome::HashMismatch(id.clone());
        }

        if sha256(&payload) != expected.payload_hash {
            warn!("Message {} failed digest verification", id);
            return ReassemblyOutcome::HashMismatch(id.clone());
        }

        debug!("Message {} reassembled ({} bytes)", id, payload.len());
        ReassemblyOutcome::Ready {
            message_id: id.clone(),
            payload,
        }
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new(AssemblerConfig::default())
    }
}
