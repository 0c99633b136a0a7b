//! # Weft
//!
//! Multipath encrypted UDP tunnel core.
//!
//! Weft multiplexes one application datagram stream over any number of
//! concurrent network paths between two peers, seals every datagram with an
//! authenticated cipher, and picks the transmit path per datagram from
//! measured per-path latency credit. Paths appear and disappear as uplinks
//! come and go (multihoming), keys rotate through ephemeral X25519
//! exchanges, and MTU is negotiated in-band.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Host event loop                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │   Engine: send = tick ─► encrypt ─► path credit scan        │
//! │           recv = demux ─► auth trials ─► control ingest     │
//! ├───────────────┬──────────────────┬──────────────────────────┤
//! │  Path table   │  Key epochs      │  Control plane           │
//! │  (credit,     │  (private/       │  (PING PONG KEYX         │
//! │   EWMAs,      │   current/next/  │   MTUX BAKX)             │
//! │   backup)     │   last, X25519)  │                          │
//! ├───────────────┴──────────────────┴──────────────────────────┤
//! │     UDP socket (pktinfo ancillary, traffic class, DF)       │
//! └─────────────────────────────────────────────────────────────┘
//!
//! The engine is single-threaded and host-driven: it owns one UDP socket,
//! exposes its file descriptor for readiness polling, and performs exactly
//! one syscall per `send`/`recv` call. There is no internal locking and no
//! background task.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)] // 48-bit wire arithmetic is intentional
#![allow(clippy::similar_names)]           // sdt/rdt/rst are the protocol's names
#![allow(clippy::doc_markdown)]            // ASCII diagrams in docs

pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod net;
pub mod path;
pub mod protocol;
pub mod time;

pub use config::{Config, PeerConfig};
pub use engine::{CryptoStatus, Engine};
pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Size of a 48-bit wire integer in bytes.
pub const U48_SIZE: usize = 6;

/// AEAD authentication tag size.
pub const MAC_SIZE: usize = 16;

/// Symmetric key size.
pub const KEY_SIZE: usize = 32;

/// Wire size of a public key half: X25519 point plus one capability byte.
pub const PKEY_SIZE: usize = 33;

/// Smallest parseable packet: 48-bit timestamp plus tag.
pub const PACKET_MIN_SIZE: usize = U48_SIZE + MAC_SIZE;

/// Largest datagram the engine will emit or accept.
pub const PACKET_MAX_SIZE: usize = 1500;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Config, PeerConfig};
    pub use crate::engine::{CryptoStatus, Engine};
    pub use crate::error::{Error, Result};
    pub use crate::path::Path;
}
