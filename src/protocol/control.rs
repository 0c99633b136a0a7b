//! Control messages.
//!
//! Payloads start at byte 12, after the zero sentinel and the timestamp.
//! The message kind is implied by the total datagram length.

use crate::time::{read48, write48};
use crate::{PKEY_SIZE, U48_SIZE};

use super::{BAKX_SIZE, CTRL_HEADER_SIZE, KEYX_SIZE, MTUX_SIZE, PING_SIZE, PONG_SIZE};

/// One control-plane message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Wake a silent path; carries nothing.
    Ping,
    /// Echo of the receiver's delay estimates so the peer can compute
    /// RTT and remote-side EWMAs.
    Pong { sdt: u64, rdt: u64, rst: u64 },
    /// Key exchange: our public half followed by the peer half we last
    /// saw (the echo is the acknowledgement).
    Keyx { public: [u8; 2 * PKEY_SIZE] },
    /// Local MTU announcement.
    Mtux { mtu: u64 },
    /// Backup-role advertisement.
    Bakx { backup: bool },
}

impl Control {
    /// Payload length in bytes.
    pub fn payload_len(&self) -> usize {
        match self {
            Control::Ping => 0,
            Control::Pong { .. } => 3 * U48_SIZE,
            Control::Keyx { .. } => 2 * PKEY_SIZE,
            Control::Mtux { .. } => U48_SIZE,
            Control::Bakx { .. } => 1,
        }
    }

    /// Total datagram size once sealed.
    pub fn wire_size(&self) -> usize {
        CTRL_HEADER_SIZE + self.payload_len() + crate::MAC_SIZE
    }

    /// Write the payload into `buf` (the region at offset 12).
    pub fn write_payload(&self, buf: &mut [u8]) {
        match self {
            Control::Ping => {}
            Control::Pong { sdt, rdt, rst } => {
                write48(&mut buf[..U48_SIZE], *sdt);
                write48(&mut buf[U48_SIZE..2 * U48_SIZE], *rdt);
                write48(&mut buf[2 * U48_SIZE..3 * U48_SIZE], *rst);
            }
            Control::Keyx { public } => {
                buf[..2 * PKEY_SIZE].copy_from_slice(public);
            }
            Control::Mtux { mtu } => {
                write48(&mut buf[..U48_SIZE], *mtu);
            }
            Control::Bakx { backup } => {
                buf[0] = u8::from(*backup);
            }
        }
    }

    /// Classify an authenticated control datagram by its exact length
    /// and extract the payload. Unknown lengths return `None` and are
    /// ignored by the caller (the per-path bookkeeping has already
    /// happened by then).
    pub fn parse(packet: &[u8]) -> Option<Control> {
        let payload = &packet[CTRL_HEADER_SIZE..];
        match packet.len() {
            PING_SIZE => Some(Control::Ping),
            PONG_SIZE => Some(Control::Pong {
                sdt: read48(&payload[..U48_SIZE]),
                rdt: read48(&payload[U48_SIZE..2 * U48_SIZE]),
                rst: read48(&payload[2 * U48_SIZE..3 * U48_SIZE]),
            }),
            KEYX_SIZE => {
                let mut public = [0u8; 2 * PKEY_SIZE];
                public.copy_from_slice(&payload[..2 * PKEY_SIZE]);
                Some(Control::Keyx { public })
            }
            MTUX_SIZE => Some(Control::Mtux {
                mtu: read48(&payload[..U48_SIZE]),
            }),
            BAKX_SIZE => Some(Control::Bakx {
                backup: payload[0] != 0,
            }),
            _ => None,
        }
    }
}
