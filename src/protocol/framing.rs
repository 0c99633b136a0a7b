//! Packet sealing and opening.
//!
//! A data packet is `timestamp(6) ‖ ciphertext ‖ tag(16)`. The timestamp
//! is simultaneously the low bytes of the AEAD nonce and the associated
//! data, so a datagram replayed with a rewritten timestamp fails
//! authentication. Control packets are tag-only: the AEAD runs over an
//! empty message with the whole header-plus-payload as associated data,
//! always under the long-term key.

use crate::crypto::{EpochKey, KeyEpochs, NONCE_SIZE};
use crate::error::CryptoError;
use crate::time::{read48, write48};
use crate::{MAC_SIZE, PACKET_MIN_SIZE, U48_SIZE};

use super::CTRL_HEADER_SIZE;

/// Expand a 48-bit timestamp into the 96-bit AEAD nonce (zero padded).
pub fn nonce_from_time(send_time: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    write48(&mut nonce[..U48_SIZE], send_time);
    nonce
}

/// Seal `payload` into `packet` under `key` with nonce time `now`.
///
/// Returns the wire length. `packet` must hold `payload.len() + 22`.
pub fn seal_data(
    key: &EpochKey,
    now: u64,
    payload: &[u8],
    packet: &mut [u8],
) -> Result<usize, CryptoError> {
    let total = payload.len() + PACKET_MIN_SIZE;
    debug_assert!(packet.len() >= total);

    write48(&mut packet[..U48_SIZE], now);
    let (header, body) = packet.split_at_mut(U48_SIZE);
    body[..payload.len()].copy_from_slice(payload);

    let nonce = nonce_from_time(now);
    let tag = key
        .encrypt
        .seal_detached(&nonce, header, &mut body[..payload.len()])?;
    body[payload.len()..payload.len() + MAC_SIZE].copy_from_slice(&tag);

    Ok(total)
}

/// Open a data packet through the epoch trials, leaving the plaintext in
/// `dst`. Returns the plaintext length.
///
/// `dst` must hold `packet.len() - 22`; the epoch manager promotes itself
/// when the packet authenticates under the next key, and latches
/// `bad_key` when no epoch accepts it.
pub fn open_data(
    epochs: &mut KeyEpochs,
    packet: &[u8],
    dst: &mut [u8],
) -> Result<usize, CryptoError> {
    let len = packet.len() - PACKET_MIN_SIZE;
    let nonce = nonce_from_time(read48(packet));

    epochs.open_trials(
        &nonce,
        &packet[..U48_SIZE],
        &packet[U48_SIZE..U48_SIZE + len],
        &packet[U48_SIZE + len..],
        dst,
    )?;
    Ok(len)
}

/// Authenticate a built control packet in place.
///
/// `buf[..CTRL_HEADER_SIZE + payload_len]` must already carry the zero
/// sentinel, the timestamp, and the payload. Returns the wire length.
pub fn seal_ctrl(
    private: &EpochKey,
    buf: &mut [u8],
    payload_len: usize,
) -> Result<usize, CryptoError> {
    let ad_len = CTRL_HEADER_SIZE + payload_len;
    let nonce = nonce_from_time(read48(&buf[U48_SIZE..]));

    let (ad, rest) = buf.split_at_mut(ad_len);
    let tag = private.encrypt.seal_detached(&nonce, ad, &mut [])?;
    rest[..MAC_SIZE].copy_from_slice(&tag);

    Ok(ad_len + MAC_SIZE)
}

/// Verify a control packet's tag under the long-term key.
pub fn verify_ctrl(private: &EpochKey, packet: &[u8]) -> bool {
    if packet.len() < CTRL_HEADER_SIZE + MAC_SIZE {
        return false;
    }
    let ad_len = packet.len() - MAC_SIZE;
    let nonce = nonce_from_time(read48(&packet[U48_SIZE..]));

    private
        .decrypt
        .open_detached(&nonce, &packet[..ad_len], &mut [], &packet[ad_len..])
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_bytes;
    use crate::protocol::Control;
    use crate::PACKET_MAX_SIZE;

    fn epochs() -> (KeyEpochs, KeyEpochs) {
        let psk: [u8; 32] = random_bytes();
        let mut a = KeyEpochs::new(false);
        let mut b = KeyEpochs::new(false);
        a.set_key(&psk).unwrap();
        b.set_key(&psk).unwrap();
        (a, b)
    }

    #[test]
    fn test_data_roundtrip() {
        let (a, mut b) = epochs();
        let mut packet = [0u8; PACKET_MAX_SIZE];

        let len = seal_data(a.seal_key(), 42_000_000, b"hello", &mut packet).unwrap();
        assert_eq!(len, 5 + PACKET_MIN_SIZE);
        // the leading bytes are the nonce time in the clear
        assert_eq!(read48(&packet), 42_000_000);

        let mut dst = [0u8; 64];
        let n = open_data(&mut b, &packet[..len], &mut dst).unwrap();
        assert_eq!(&dst[..n], b"hello");
    }

    #[test]
    fn test_data_timestamp_is_bound() {
        let (a, mut b) = epochs();
        let mut packet = [0u8; PACKET_MAX_SIZE];
        let len = seal_data(a.seal_key(), 42_000_000, b"hello", &mut packet).unwrap();

        // rewriting the timestamp invalidates the tag
        write48(&mut packet[..U48_SIZE], 43_000_000);
        let mut dst = [0u8; 64];
        assert!(open_data(&mut b, &packet[..len], &mut dst).is_err());
    }

    #[test]
    fn test_data_empty_payload() {
        let (a, mut b) = epochs();
        let mut packet = [0u8; PACKET_MAX_SIZE];
        let len = seal_data(a.seal_key(), 1_000, b"", &mut packet).unwrap();
        assert_eq!(len, PACKET_MIN_SIZE);

        let mut dst = [0u8; 16];
        assert_eq!(open_data(&mut b, &packet[..len], &mut dst).unwrap(), 0);
    }

    #[test]
    fn test_ctrl_seal_verify() {
        let (a, b) = epochs();
        let msg = Control::Mtux { mtu: 1_400 };

        let mut buf = [0u8; 256];
        write48(&mut buf[U48_SIZE..2 * U48_SIZE], 9_000);
        msg.write_payload(&mut buf[CTRL_HEADER_SIZE..]);
        let len = seal_ctrl(&a.private, &mut buf, msg.payload_len()).unwrap();
        assert_eq!(len, msg.wire_size());

        assert!(verify_ctrl(&b.private, &buf[..len]));
        assert_eq!(Control::parse(&buf[..len]), Some(msg));
    }

    #[test]
    fn test_ctrl_forgery_rejected() {
        let (a, b) = epochs();
        let msg = Control::Bakx { backup: true };

        let mut buf = [0u8; 256];
        write48(&mut buf[U48_SIZE..2 * U48_SIZE], 9_000);
        msg.write_payload(&mut buf[CTRL_HEADER_SIZE..]);
        let len = seal_ctrl(&a.private, &mut buf, msg.payload_len()).unwrap();

        // flip the backup flag after sealing
        buf[CTRL_HEADER_SIZE] = 0;
        assert!(!verify_ctrl(&b.private, &buf[..len]));

        // wrong long-term key
        let stranger = KeyEpochs::new(false);
        buf[CTRL_HEADER_SIZE] = 1;
        assert!(!verify_ctrl(&stranger.private, &buf[..len]));
    }

    #[test]
    fn test_ctrl_truncated_rejected() {
        let (a, _) = epochs();
        assert!(!verify_ctrl(&a.private, &[0u8; 8]));
    }
}
