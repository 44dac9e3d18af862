//! Chunk protocol frames and the splitter
//!
//! Frames are JSON text tagged by `packageType`:
//!
//! ```text
//! metaData                    { messageId, chunkCount, hashOfMessage, messageByteCount }
//! chunk                       { messageId, chunkIndex, chunkData }
//! receiveMessageConfirmation  { messageId }
//! receiveMessageError         { messageId, error }
//! ```
//!
//! `hashOfMessage` is the hex SHA-256 of the original payload and `chunkData`
//! is base64.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::crypto::sha256;
use crate::error::ChunkError;
use crate::types::MessageId;
use crate::DIGEST_LEN;

/// Error reported to the sender when the reassembled digest does not match
pub const MESSAGE_HASHES_MISMATCH: &str = "messageHashesMismatch";

/// One unit of the chunking protocol
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "packageType")]
pub enum Frame {
    #[serde(rename = "metaData")]
    Metadata(MetadataFrame),

    #[serde(rename = "chunk")]
    Chunk(ChunkFrame),

    /// Receiver acknowledges a verified message
    #[serde(rename = "receiveMessageConfirmation")]
    ReceiveConfirmation(ReceiveConfirmation),

    /// Receiver reports a message it could not verify
    #[serde(rename = "receiveMessageError")]
    ReceiveError(ReceiveError),

    /// Any package type this version does not understand
    #[serde(other)]
    Unknown,
}

/// First frame of every message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataFrame {
    pub message_id: MessageId,
    pub chunk_count: u32,
    #[serde(rename = "hashOfMessage", with = "hex_digest")]
    pub payload_hash: [u8; DIGEST_LEN],
    #[serde(rename = "messageByteCount")]
    pub payload_byte_count: u32,
}

/// One slice of the payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFrame {
    pub message_id: MessageId,
    pub chunk_index: u32,
    /// Base64 encoded slice
    pub chunk_data: String,
}

impl ChunkFrame {
    /// Decode the raw bytes carried by this chunk
    pub fn data(&self) -> Result<Vec<u8>, ChunkError> {
        BASE64
            .decode(self.chunk_data.as_bytes())
            .map_err(|e| ChunkError::Decode(format!("chunk {}: {}", self.chunk_index, e)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveConfirmation {
    pub message_id: MessageId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveError {
    pub message_id: MessageId,
    pub error: String,
}

impl Frame {
    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, ChunkError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, ChunkError> {
        serde_json::to_string(self).map_err(|e| ChunkError::Encode(e.to_string()))
    }

    /// Parse from raw transport bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChunkError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Serialize to raw transport bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, ChunkError> {
        serde_json::to_vec(self).map_err(|e| ChunkError::Encode(e.to_string()))
    }

    /// Message this frame belongs to, if any
    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            Frame::Metadata(m) => Some(&m.message_id),
            Frame::Chunk(c) => Some(&c.message_id),
            Frame::ReceiveConfirmation(c) => Some(&c.message_id),
            Frame::ReceiveError(e) => Some(&e.message_id),
            Frame::Unknown => None,
        }
    }

    pub fn confirmation(message_id: &MessageId) -> Self {
        Frame::ReceiveConfirmation(ReceiveConfirmation {
            message_id: message_id.clone(),
        })
    }

    pub fn hash_mismatch(message_id: &MessageId) -> Self {
        Frame::ReceiveError(ReceiveError {
            message_id: message_id.clone(),
            error: MESSAGE_HASHES_MISMATCH.to_string(),
        })
    }
}

/// Number of chunk frames produced for a payload of `len` bytes
///
/// Always at least one, so empty payloads still carry a (empty) chunk.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size.max(1)).max(1)
}

/// Split a payload into a metadata frame followed by its chunk frames
///
/// Deterministic for identical inputs. Chunk frames are emitted in index order.
pub fn split(
    message_id: &MessageId,
    payload: &[u8],
    chunk_size: usize,
) -> Result<Vec<Frame>, ChunkError> {
    if chunk_size == 0 {
        return Err(ChunkError::InvalidChunkSize);
    }

    let payload_byte_count = u32::try_from(payload.len()).map_err(|_| ChunkError::PayloadTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;

    // count <= max(1, len) <= u32::MAX, so the narrowing below cannot truncate
    let count = chunk_count(payload.len(), chunk_size);

    let mut frames = Vec::with_capacity(count + 1);
    frames.push(Frame::Metadata(MetadataFrame {
        message_id: message_id.clone(),
        chunk_count: count as u32,
        payload_hash: sha256(payload),
        payload_byte_count,
    }));

    if payload.is_empty() {
        frames.push(Frame::Chunk(ChunkFrame {
            message_id: message_id.clone(),
            chunk_index: 0,
            chunk_data: String::new(),
        }));
    } else {
        for (index, slice) in payload.chunks(chunk_size).enumerate() {
            frames.push(Frame::Chunk(ChunkFrame {
                message_id: message_id.clone(),
                chunk_index: index as u32,
                chunk_data: BASE64.encode(slice),
            }));
        }
    }

    Ok(frames)
}

/// Serde adapter for hex encoded digests
mod hex_digest {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::DIGEST_LEN;

    pub fn serialize<S: Serializer>(digest: &[u8; DIGEST_LEN], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(digest))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; DIGEST_LEN], D::Error> {
        let s = String::deserialize(d)?;
        let mut digest = [0u8; DIGEST_LEN];
        hex::decode_to_slice(&s, &mut digest).map_err(D::Error::custom)?;
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> MessageId {
        MessageId::new("msg-1")
    }

    #[test]
    fn test_split_two_chunk_message() {
        let payload = b"this is a test message";
        let frames = split(&id(), payload, payload.len() - 1).unwrap();
        assert_eq!(frames.len(), 3);

        match &frames[0] {
            Frame::Metadata(m) => {
                assert_eq!(m.chunk_count, 2);
                assert_eq!(m.payload_byte_count as usize, payload.len());
                assert_eq!(m.payload_hash, sha256(payload));
            }
            other => panic!("expected metadata first, got {:?}", other),
        }

        let mut rebuilt = Vec::new();
        for (i, frame) in frames[1..].iter().enumerate() {
            match frame {
                Frame::Chunk(c) => {
                    assert_eq!(c.chunk_index as usize, i);
                    rebuilt.extend(c.data().unwrap());
                }
                other => panic!("expected chunk, got {:?}", other),
            }
        }
        assert_eq!(rebuilt, payload);
    }

    #[test]
    fn test_split_empty_payload_has_one_chunk() {
        let frames = split(&id(), b"", 16).unwrap();
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            Frame::Metadata(m) => {
                assert_eq!(m.chunk_count, 1);
                assert_eq!(m.payload_byte_count, 0);
            }
            other => panic!("expected metadata, got {:?}", other),
        }
    }

    #[test]
    fn test_split_rejects_zero_chunk_size() {
        assert_eq!(split(&id(), b"abc", 0), Err(ChunkError::InvalidChunkSize));
    }

    #[test]
    fn test_split_is_deterministic() {
        let payload: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
        let a = split(&id(), &payload, 97).unwrap();
        let b = split(&id(), &payload, 97).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_chunk_count_formula() {
        assert_eq!(chunk_count(0, 10), 1);
        assert_eq!(chunk_count(1, 10), 1);
        assert_eq!(chunk_count(10, 10), 1);
        assert_eq!(chunk_count(11, 10), 2);
        assert_eq!(chunk_count(23, 22), 2);
        assert_eq!(chunk_count(100, 1), 100);
    }

    #[test]
    fn test_metadata_wire_shape() {
        let frames = split(&id(), b"hello", 4).unwrap();
        let json = frames[0].to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["packageType"], "metaData");
        assert_eq!(value["messageId"], "msg-1");
        assert_eq!(value["chunkCount"], 2);
        assert_eq!(value["messageByteCount"], 5);
        assert_eq!(value["hashOfMessage"], hex::encode(sha256(b"hello")));
    }

    #[test]
    fn test_chunk_wire_shape() {
        let frames = split(&id(), b"hello", 4).unwrap();
        let json = frames[2].to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["packageType"], "chunk");
        assert_eq!(value["chunkIndex"], 1);
        assert_eq!(value["chunkData"], BASE64.encode(b"o"));
    }

    #[test]
    fn test_unknown_package_type() {
        let frame = Frame::from_json(r#"{"packageType":"somethingNew","messageId":"x"}"#).unwrap();
        assert_eq!(frame, Frame::Unknown);
        assert!(frame.message_id().is_none());
    }

    #[test]
    fn test_bad_digest_is_decode_error() {
        let json = r#"{"packageType":"metaData","messageId":"x","chunkCount":1,"hashOfMessage":"zz","messageByteCount":1}"#;
        assert!(matches!(Frame::from_json(json), Err(ChunkError::Decode(_))));
    }

    #[test]
    fn test_bad_base64_is_decode_error() {
        let chunk = ChunkFrame {
            message_id: id(),
            chunk_index: 0,
            chunk_data: "not base64!!".into(),
        };
        assert!(matches!(chunk.data(), Err(ChunkError::Decode(_))));
    }

    #[test]
    fn test_control_frames_parse() {
        let json = Frame::hash_mismatch(&id()).to_json().unwrap();
        assert!(json.contains("receiveMessageError"));
        assert!(json.contains(MESSAGE_HASHES_MISMATCH));

        match Frame::from_json(&json).unwrap() {
            Frame::ReceiveError(e) => assert_eq!(e.message_id, id()),
            other => panic!("wrong frame type: {:?}", other),
        }

        let bytes = Frame::confirmation(&id()).to_bytes().unwrap();
        assert_eq!(
            Frame::from_bytes(&bytes).unwrap(),
            Frame::confirmation(&id())
        );
    }
}
