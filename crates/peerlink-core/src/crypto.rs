//! Cryptographic utilities for peerlink
//!
//! Provides:
//! - The [`PayloadCipher`] seam for the external key-exchange component
//! - Connection id derivation (Blake2b-256)
//! - SHA-256 payload digests for the chunking protocol
//! - Random hex identifiers

use blake2::digest::consts::U32;
use blake2::Blake2b;
use sha2::{Digest, Sha256};

use crate::error::CipherError;
use crate::types::ConnectionSecret;
use crate::DIGEST_LEN;

/// Failure of the system entropy source
pub type RandomError = getrandom::Error;

/// Encrypts and decrypts signaling payloads with a link's shared secret
///
/// Implemented outside this workspace by the key-exchange component.
pub trait PayloadCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], secret: &ConnectionSecret) -> Result<Vec<u8>, CipherError>;

    fn decrypt(&self, ciphertext: &[u8], secret: &ConnectionSecret)
        -> Result<Vec<u8>, CipherError>;
}

type Blake2b256 = Blake2b<U32>;

/// Derive the public connection id (hex Blake2b-256 digest) from secret bytes
///
/// Must match what the browser extension computes, or the two sides end up
/// in different relay rooms.
pub fn derive_connection_id(secret: &[u8]) -> String {
    hex::encode(Blake2b256::digest(secret))
}

/// SHA-256 digest of a payload
pub fn sha256(data: &[u8]) -> [u8; DIGEST_LEN] {
    Sha256::digest(data).into()
}

/// Random identifier of `len` bytes, hex encoded
pub fn random_hex(len: usize) -> Result<String, RandomError> {
    let mut bytes = vec![0u8; len];
    getrandom::getrandom(&mut bytes)?;
    Ok(hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_random_hex_length() {
        let id = random_hex(8).unwrap();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_connection_id_known_vectors() {
        assert_eq!(
            derive_connection_id(b""),
            "0e5751c026e543b2e8ab2eb06099daa1d1e5df47778f7787faab45cdf12fe3a8"
        );
        assert_eq!(
            derive_connection_id(b"abc"),
            "bddd813c634239723171ef3fee98579b94964e3bb1cb3e427262c8c068d52319"
        );
    }

    #[test]
    fn test_connection_id_is_lowercase_hex() {
        let id = derive_connection_id(&[7u8; 32]);
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }
}
