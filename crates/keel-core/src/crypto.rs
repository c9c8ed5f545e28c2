//! Hashing utilities for Keel
//!
//! Provides:
//! - BLAKE3 checksums for data integrity
//! - Short object digests as reported by the store
//! - Login proofs for the store handshake

use blake3::Hasher;

use crate::types::Digest;
use crate::DIGEST_LEN;

/// Length of a login nonce in bytes
pub const NONCE_LEN: usize = 32;

/// Compute BLAKE3 checksum of data
pub fn checksum(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Incremental object digester.
///
/// Produces a [`Digest`] from the BLAKE3 extendable output, so whole objects
/// can be summed without holding them in memory.
pub struct ObjectHasher {
    hasher: Hasher,
}

impl ObjectHasher {
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> Digest {
        let mut out = [0u8; DIGEST_LEN];
        self.hasher.finalize_xof().fill(&mut out);
        Digest(out)
    }
}

impl Default for ObjectHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Digest of an in-memory object
pub fn object_digest(data: &[u8]) -> Digest {
    let mut hasher = ObjectHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Generate a fresh login nonce
///
/// # Panics
/// Panics if the system random number generator fails, which should never
/// happen on supported platforms.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce).expect("system RNG failed");
    nonce
}

/// Proof that a client knows the shared secret, bound to one user and nonce
pub fn login_proof(secret: &[u8], user: &str, nonce: &[u8]) -> [u8; 32] {
    let key = checksum(secret);
    let mut hasher = Hasher::new_keyed(&key);
    hasher.update(user.as_bytes());
    hasher.update(&[0]);
    hasher.update(nonce);
    *hasher.finalize().as_bytes()
}

/// Check a login proof in constant time
pub fn verify_login_proof(secret: &[u8], user: &str, nonce: &[u8], proof: &[u8; 32]) -> bool {
    let expected = blake3::Hash::from(login_proof(secret, user, nonce));
    expected == blake3::Hash::from(*proof)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum() {
        let data = b"hello world";
        assert_eq!(checksum(data), checksum(data));
        assert_ne!(checksum(data), checksum(b"hello worlD"));
    }

    #[test]
    fn test_streaming_digest_matches_one_shot() {
        let expected = object_digest(b"hello world");

        let mut hasher = ObjectHasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), expected);
    }

    #[test]
    fn test_digest_hex_round_trip() {
        let digest = object_digest(b"payload");
        assert_eq!(Digest::from_hex(&digest.to_hex()).unwrap(), digest);
    }

    #[test]
    fn test_login_proof() {
        let nonce = generate_nonce();
        let proof = login_proof(b"secret", "alice", &nonce);
        assert!(verify_login_proof(b"secret", "alice", &nonce, &proof));
        assert!(!verify_login_proof(b"wrong", "alice", &nonce, &proof));
        assert!(!verify_login_proof(b"secret", "bob", &nonce, &proof));

        let other_nonce = generate_nonce();
        assert!(!verify_login_proof(b"secret", "alice", &other_nonce, &proof));
    }
}
