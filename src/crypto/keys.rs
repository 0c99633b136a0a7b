//! Key epoch management and X25519 rotation.
//!
//! Four AEAD epochs live side by side:
//!
//! - `private` — derived from the pre-shared key; authenticates every
//!   control packet and is the decryption trial of last resort.
//! - `current` — what data packets are sealed with.
//! - `next` — the product of the latest key exchange, promoted to
//!   `current` the moment a packet authenticates under it.
//! - `last` — the previous `current`, kept so in-flight packets sealed
//!   just before a promotion still open.
//!
//! A key exchange works on 33-byte public halves: the X25519 point plus a
//! trailing AES-capability byte. Each side keeps the half it sent and the
//! half it last saw from the peer; echoing the peer's half back is what
//! signals readiness, and a byte-compare of the echoed half decides whether
//! another round is needed. The DH output is folded through keyed BLAKE2b
//! twice, with the two halves swapped, to produce distinct directional
//! keys from the symmetric shared secret.

use blake2::Blake2bMac;
use blake2::digest::consts::U32;
use blake2::digest::{FixedOutput, KeyInit, Update};
use rand::rngs::OsRng;
use tracing::{debug, trace, warn};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use super::aead::{AeadKey, EpochKey, NONCE_SIZE};
use super::random_bytes;
use crate::error::{CryptoError, Error, Result};
use crate::{KEY_SIZE, MAC_SIZE, PKEY_SIZE};

type Blake2bMac256 = Blake2bMac<U32>;

/// The two public halves of the running key exchange.
#[derive(Clone)]
pub struct PublicPair {
    /// Our half: X25519 point plus AES-capability byte.
    pub send: [u8; PKEY_SIZE],
    /// The half last received from the peer; zeros until one arrives.
    pub recv: [u8; PKEY_SIZE],
}

/// What a KEYX ingest asks the caller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyxOutcome {
    /// The peer has not yet echoed our public half: send a KEYX back.
    pub reply: bool,
}

/// Key epoch manager.
pub struct KeyEpochs {
    /// Last KEYX emission (any path).
    pub send_time: u64,
    /// Last completed KEYX ingest.
    pub recv_time: u64,
    secret: StaticSecret,
    public: PublicPair,
    pub private: EpochKey,
    pub last: EpochKey,
    pub next: EpochKey,
    pub current: EpochKey,
    /// Peer confirmed the new key: seal outbound data under `next`.
    pub use_next: bool,
    /// AES-256-GCM runs in hardware locally and was requested.
    pub aes: bool,
    /// All decryption trials failed recently; schedule a KEYX.
    pub bad_key: bool,
}

impl KeyEpochs {
    /// Fresh manager with a random pre-shared key.
    pub fn new(prefer_aes: bool) -> Self {
        let psk: [u8; KEY_SIZE] = random_bytes();
        let private = EpochKey::symmetric(psk, false);
        let mut epochs = Self {
            send_time: 0,
            recv_time: 0,
            secret: StaticSecret::random_from_rng(OsRng),
            public: PublicPair {
                send: [0; PKEY_SIZE],
                recv: [0; PKEY_SIZE],
            },
            private: private.clone(),
            last: private.clone(),
            next: private.clone(),
            current: private,
            use_next: false,
            aes: prefer_aes && super::aes_available(),
            bad_key: false,
        };
        epochs.reset_handshake();
        epochs
    }

    /// Install a pre-shared key, resetting every epoch to it.
    pub fn set_key(&mut self, key: &[u8]) -> Result<()> {
        if key.len() < KEY_SIZE {
            return Err(Error::InvalidArgument(format!(
                "key must be at least {KEY_SIZE} bytes, got {}",
                key.len()
            )));
        }
        let mut psk = [0u8; KEY_SIZE];
        psk.copy_from_slice(&key[..KEY_SIZE]);

        self.private = EpochKey::symmetric(psk, false);
        self.current = self.private.clone();
        self.next = self.private.clone();
        self.last = self.private.clone();
        self.use_next = false;
        Ok(())
    }

    /// The pre-shared key.
    pub fn psk(&self) -> [u8; KEY_SIZE] {
        *self.private.encrypt.key_bytes()
    }

    /// Start a fresh exchange: new scalar, new public half, peer half
    /// forgotten.
    pub fn reset_handshake(&mut self) {
        self.secret = StaticSecret::random_from_rng(OsRng);
        let point = X25519Public::from(&self.secret);
        self.public.send[..KEY_SIZE].copy_from_slice(point.as_bytes());
        self.public.send[PKEY_SIZE - 1] = u8::from(self.aes);
        self.public.recv = [0; PKEY_SIZE];
    }

    /// Both public halves, as carried in a KEYX payload.
    pub fn public_bytes(&self) -> [u8; 2 * PKEY_SIZE] {
        let mut out = [0u8; 2 * PKEY_SIZE];
        out[..PKEY_SIZE].copy_from_slice(&self.public.send);
        out[PKEY_SIZE..].copy_from_slice(&self.public.recv);
        out
    }

    /// Ingest a KEYX payload (peer's `send` and `recv` halves).
    pub fn handle_keyx(&mut self, payload: &[u8], now: u64) -> KeyxOutcome {
        let mut peer_send = [0u8; PKEY_SIZE];
        let mut peer_recv = [0u8; PKEY_SIZE];
        peer_send.copy_from_slice(&payload[..PKEY_SIZE]);
        peer_recv.copy_from_slice(&payload[PKEY_SIZE..2 * PKEY_SIZE]);

        // The peer echoes our half once it has seen it; until then we owe
        // it a KEYX and must not seal data under the new key.
        let reply = peer_recv != self.public.send;
        if self.public.recv != peer_send {
            trace!("keyx: new public half from peer");
        }
        self.public.recv = peer_send;
        self.use_next = !reply;

        let mut point = [0u8; KEY_SIZE];
        point.copy_from_slice(&peer_send[..KEY_SIZE]);
        let shared = self.secret.diffie_hellman(&X25519Public::from(point));
        if !shared.was_contributory() {
            warn!("keyx: degenerate peer public key, ignoring offer");
            return KeyxOutcome { reply };
        }

        let psk = self.psk();
        let encrypt = derive_key(&psk, shared.as_bytes(), &self.public.send, &peer_send);
        let decrypt = derive_key(&psk, shared.as_bytes(), &peer_send, &self.public.send);
        let aes = peer_send[PKEY_SIZE - 1] == 1 && self.public.send[PKEY_SIZE - 1] == 1;

        self.next = EpochKey::directional(encrypt, decrypt, aes);
        self.recv_time = now;
        debug!(aes, reply, "keyx: next epoch derived");

        KeyxOutcome { reply }
    }

    /// The epoch data packets are sealed under right now.
    pub fn seal_key(&self) -> &EpochKey {
        if self.use_next {
            &self.next
        } else {
            &self.current
        }
    }

    /// Rotate: `next` becomes `current`, `current` becomes `last`, and a
    /// fresh exchange starts.
    pub fn promote(&mut self) {
        self.last = self.current.clone();
        self.current = self.next.clone();
        self.use_next = false;
        self.reset_handshake();
        debug!("key epoch promoted");
    }

    /// Open a data packet, trying `current`, `next` (promoting on
    /// success), `last`, then `private`.
    ///
    /// On success the plaintext is left in `dst[..ct.len()]`. On failure
    /// `bad_key` is latched so the next tick schedules a KEYX.
    pub fn open_trials(
        &mut self,
        nonce: &[u8; NONCE_SIZE],
        ad: &[u8],
        ct: &[u8],
        tag: &[u8],
        dst: &mut [u8],
    ) -> std::result::Result<(), CryptoError> {
        if try_open(&self.current.decrypt, nonce, ad, ct, tag, dst) {
            return Ok(());
        }
        if try_open(&self.next.decrypt, nonce, ad, ct, tag, dst) {
            self.promote();
            return Ok(());
        }
        if try_open(&self.last.decrypt, nonce, ad, ct, tag, dst)
            || try_open(&self.private.decrypt, nonce, ad, ct, tag, dst)
        {
            return Ok(());
        }
        self.bad_key = true;
        Err(CryptoError::AuthenticationFailed)
    }

    /// Short fingerprint of the current encrypt key. Changes exactly when
    /// the epoch advances; reveals nothing about the key.
    pub fn epoch_tag(&self) -> [u8; 8] {
        let mut mac = Blake2bMac256::new_from_slice(self.current.encrypt.key_bytes())
            .expect("32-byte BLAKE2b key");
        Update::update(&mut mac, b"weft epoch tag");
        let full: [u8; 32] = mac.finalize_fixed().into();
        let mut tag = [0u8; 8];
        tag.copy_from_slice(&full[..8]);
        tag
    }
}

impl std::fmt::Debug for KeyEpochs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEpochs")
            .field("use_next", &self.use_next)
            .field("aes", &self.aes)
            .field("bad_key", &self.bad_key)
            .finish_non_exhaustive()
    }
}

/// Directional key derivation: keyed BLAKE2b over the DH output and the
/// two public halves in direction order.
fn derive_key(
    psk: &[u8; KEY_SIZE],
    shared: &[u8; KEY_SIZE],
    from: &[u8; PKEY_SIZE],
    to: &[u8; PKEY_SIZE],
) -> [u8; KEY_SIZE] {
    let mut mac = Blake2bMac256::new_from_slice(psk).expect("32-byte BLAKE2b key");
    Update::update(&mut mac, shared);
    Update::update(&mut mac, from);
    Update::update(&mut mac, to);
    mac.finalize_fixed().into()
}

fn try_open(
    key: &AeadKey,
    nonce: &[u8; NONCE_SIZE],
    ad: &[u8],
    ct: &[u8],
    tag: &[u8],
    dst: &mut [u8],
) -> bool {
    debug_assert!(tag.len() == MAC_SIZE);
    dst[..ct.len()].copy_from_slice(ct);
    key.open_detached(nonce, ad, &mut dst[..ct.len()], tag).is_ok()
}
