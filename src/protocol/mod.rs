//! Wire protocol: packet classes, exact sizes, and timers.
//!
//! Two packet classes share the socket. Data packets open with their
//! 48-bit send timestamp; control packets open with six zero bytes (no
//! valid timestamp is zero) followed by the timestamp. Control messages
//! carry no type byte — the receiver dispatches on the exact datagram
//! length, so every message size below is part of the wire contract.

pub mod control;
pub mod framing;

pub use control::Control;

use crate::time::{ONE_MIN, ONE_MSEC, ONE_SEC};
use crate::{PACKET_MIN_SIZE, PKEY_SIZE, U48_SIZE};

/// Control header: zero sentinel plus send timestamp.
pub const CTRL_HEADER_SIZE: usize = 2 * U48_SIZE;

/// Largest control payload.
pub const CTRL_PAYLOAD_MAX: usize = 128;

/// PING: bare control header.
pub const PING_SIZE: usize = PACKET_MIN_SIZE + U48_SIZE;

/// PONG: echoed `sdt`, `rdt`, `rst`.
pub const PONG_SIZE: usize = PACKET_MIN_SIZE + U48_SIZE + 3 * U48_SIZE;

/// KEYX: both public halves.
pub const KEYX_SIZE: usize = PACKET_MIN_SIZE + U48_SIZE + 2 * PKEY_SIZE;

/// MTUX: local MTU as u48.
pub const MTUX_SIZE: usize = PACKET_MIN_SIZE + U48_SIZE + U48_SIZE;

/// BAKX: backup flag byte.
pub const BAKX_SIZE: usize = PACKET_MIN_SIZE + U48_SIZE + 1;

/// Minimum delay between PONG emissions per path.
pub const PONG_TIMEOUT: u64 = 100 * ONE_MSEC;

/// Key exchange refresh interval.
pub const KEYX_TIMEOUT: u64 = 60 * ONE_MIN;

/// Default control retransmission / path-recovery interval.
pub const SEND_TIMEOUT: u64 = ONE_SEC;

/// Default freshness window for inbound timestamps.
pub const TIME_TOLERANCE: u64 = 10 * ONE_MIN;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_sizes_bit_exact() {
        assert_eq!(PING_SIZE, 28);
        assert_eq!(BAKX_SIZE, 29);
        assert_eq!(MTUX_SIZE, 34);
        assert_eq!(PONG_SIZE, 46);
        assert_eq!(KEYX_SIZE, 94);
        assert_eq!(crate::MAC_SIZE, 16);
        assert_eq!(PACKET_MIN_SIZE, 22);
    }
}
