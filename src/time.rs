//! 48-bit microsecond wire clock.
//!
//! Every timestamp on the wire is a 48-bit count of microseconds since the
//! Unix epoch. The counter wraps (roughly every 8.9 years), so values are
//! never compared with `<` directly: freshness uses a symmetric absolute
//! difference and interval checks go through [`timed_out`].

use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, LittleEndian};

use crate::U48_SIZE;

/// One millisecond in wire-clock units.
pub const ONE_MSEC: u64 = 1_000;

/// One second in wire-clock units.
pub const ONE_SEC: u64 = 1_000 * ONE_MSEC;

/// One minute in wire-clock units.
pub const ONE_MIN: u64 = 60 * ONE_SEC;

/// Mask keeping the low 48 bits.
pub const U48_MASK: u64 = (1 << 48) - 1;

/// Current wall-clock time as a 48-bit microsecond counter.
pub fn now() -> u64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (elapsed.as_micros() as u64) & U48_MASK
}

/// Symmetric distance between two wire timestamps.
pub fn abs_diff(a: u64, b: u64) -> u64 {
    if a >= b {
        a - b
    } else {
        b - a
    }
}

/// Whether `timeout` has elapsed since `last` at time `now`.
///
/// A zero `last` means the event never happened and always reads as
/// timed out, which is what arms first-time emissions.
pub fn timed_out(now: u64, last: u64, timeout: u64) -> bool {
    last == 0 || (now > last && now - last >= timeout)
}

/// Pack the low 48 bits of `src` into 6 little-endian bytes.
pub fn write48(dst: &mut [u8], src: u64) {
    LittleEndian::write_u48(&mut dst[..U48_SIZE], src & U48_MASK);
}

/// Read 6 little-endian bytes as a 48-bit integer.
pub fn read48(src: &[u8]) -> u64 {
    LittleEndian::read_u48(&src[..U48_SIZE])
}
