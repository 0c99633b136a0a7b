//! AEAD suite dispatch.
//!
//! Each key carries its cipher choice: AES-256-GCM when both peers run it
//! in hardware, ChaCha20-Poly1305 otherwise. The cipher instance is built
//! once per key (for AES this is where the round keys are expanded) and
//! sealing/opening then works detached and in place on caller buffers, so
//! the data path does not allocate.

use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::{KEY_SIZE, MAC_SIZE};

/// AEAD nonce size shared by both suites.
pub const NONCE_SIZE: usize = 12;

#[derive(Clone)]
enum Suite {
    Aes(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

/// A single-direction AEAD key with its precomputed cipher state.
#[derive(Clone)]
pub struct AeadKey {
    key: [u8; KEY_SIZE],
    suite: Suite,
}

impl AeadKey {
    /// Build a key, expanding the cipher state for the chosen suite.
    pub fn new(key: [u8; KEY_SIZE], aes: bool) -> Self {
        let suite = if aes {
            Suite::Aes(Box::new(Aes256Gcm::new(&key.into())))
        } else {
            Suite::ChaCha(Box::new(ChaCha20Poly1305::new(&key.into())))
        };
        Self { key, suite }
    }

    /// Raw key bytes.
    pub fn key_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Whether this key runs AES-256-GCM.
    pub fn is_aes(&self) -> bool {
        matches!(self.suite, Suite::Aes(_))
    }

    /// Encrypt `buf` in place, authenticating `ad`, returning the tag.
    pub fn seal_detached(
        &self,
        nonce: &[u8; NONCE_SIZE],
        ad: &[u8],
        buf: &mut [u8],
    ) -> Result<[u8; MAC_SIZE], CryptoError> {
        let tag = match &self.suite {
            Suite::Aes(cipher) => cipher
                .encrypt_in_place_detached(aes_gcm::Nonce::from_slice(nonce), ad, buf)
                .map_err(|_| CryptoError::EncryptionFailed("aes-256-gcm".into()))?,
            Suite::ChaCha(cipher) => cipher
                .encrypt_in_place_detached(chacha20poly1305::Nonce::from_slice(nonce), ad, buf)
                .map_err(|_| CryptoError::EncryptionFailed("chacha20-poly1305".into()))?,
        };
        Ok(tag.into())
    }

    /// Verify `tag` over `ad` and `buf`, decrypting `buf` in place.
    ///
    /// The buffer is only rewritten when the tag checks out.
    pub fn open_detached(
        &self,
        nonce: &[u8; NONCE_SIZE],
        ad: &[u8],
        buf: &mut [u8],
        tag: &[u8],
    ) -> Result<(), CryptoError> {
        match &self.suite {
            Suite::Aes(cipher) => cipher
                .decrypt_in_place_detached(
                    aes_gcm::Nonce::from_slice(nonce),
                    ad,
                    buf,
                    aes_gcm::Tag::from_slice(tag),
                )
                .map_err(|_| CryptoError::AuthenticationFailed),
            Suite::ChaCha(cipher) => cipher
                .decrypt_in_place_detached(
                    chacha20poly1305::Nonce::from_slice(nonce),
                    ad,
                    buf,
                    chacha20poly1305::Tag::from_slice(tag),
                )
                .map_err(|_| CryptoError::AuthenticationFailed),
        }
    }
}

impl Drop for AeadKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadKey")
            .field("suite", if self.is_aes() { &"aes-256-gcm" } else { &"chacha20-poly1305" })
            .finish_non_exhaustive()
    }
}

/// One key epoch: an encrypt half, a decrypt half, and the suite flag.
///
/// The long-term key and freshly reset epochs are symmetric (both halves
/// equal); a completed key exchange installs distinct directional halves.
#[derive(Clone, Debug)]
pub struct EpochKey {
    pub encrypt: AeadKey,
    pub decrypt: AeadKey,
    pub aes: bool,
}

impl EpochKey {
    /// Epoch with distinct directional keys.
    pub fn directional(encrypt: [u8; KEY_SIZE], decrypt: [u8; KEY_SIZE], aes: bool) -> Self {
        Self {
            encrypt: AeadKey::new(encrypt, aes),
            decrypt: AeadKey::new(decrypt, aes),
            aes,
        }
    }

    /// Epoch using one key for both directions (pre-shared key style).
    pub fn symmetric(key: [u8; KEY_SIZE], aes: bool) -> Self {
        Self::directional(key, key, aes)
    }
}
