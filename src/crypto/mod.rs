//! Cryptographic primitives for Weft.
//!
//! This module provides:
//! - AEAD suite dispatch (AES-256-GCM, ChaCha20-Poly1305)
//! - Key epoch management and X25519 key rotation
//! - Directional key derivation (keyed BLAKE2b)

mod aead;
mod keys;

pub use aead::{AeadKey, EpochKey, NONCE_SIZE};
pub use keys::{KeyEpochs, KeyxOutcome, PublicPair};

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    bytes
}

/// Whether this CPU can run AES-256-GCM at full speed.
///
/// Both the AES rounds and the GHASH carry-less multiply must be in
/// hardware, otherwise ChaCha20-Poly1305 is the better suite.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn aes_available() -> bool {
    std::is_x86_feature_detected!("aes") && std::is_x86_feature_detected!("pclmulqdq")
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub fn aes_available() -> bool {
    false
}
