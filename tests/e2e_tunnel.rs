//! End-to-end tunnel tests.
//!
//! Two engines talk over loopback, driven synchronously: the sender's
//! `send` runs its control tick, then the receiver's socket is polled and
//! drained. Covers peer setup, PSK symmetry, timestamp freshness, key
//! rotation, MTU negotiation, backup demotion, and bad-key recovery.

use std::net::UdpSocket;
use std::os::unix::io::AsRawFd;
use std::thread::sleep;
use std::time::Duration;

use weft::prelude::*;

// ============================================================================
// Harness
// ============================================================================

/// Wait until the engine's socket is readable, up to `timeout_ms`.
fn wait_readable(fd: i32, timeout_ms: i32) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    unsafe { libc::poll(&mut pfd, 1, timeout_ms) > 0 }
}

/// Everything one drain of an engine's socket produced.
#[derive(Debug, Default)]
struct Drained {
    /// Decrypted application payloads, in arrival order.
    data: Vec<Vec<u8>>,
    /// Total datagrams consumed (data, control, and dropped).
    datagrams: usize,
}

/// Drain an engine until its socket stays quiet for `quiet_ms`.
fn pump(engine: &mut Engine, quiet_ms: i32) -> Drained {
    let mut out = Drained::default();
    let mut buf = [0u8; 2048];
    while wait_readable(engine.as_raw_fd(), quiet_ms) {
        match engine.recv(&mut buf) {
            Ok(0) => out.datagrams += 1,
            Ok(n) => {
                out.datagrams += 1;
                out.data.push(buf[..n].to_vec());
            }
            Err(e) => panic!("recv failed: {e}"),
        }
    }
    out
}

/// Opt-in logging for debugging test runs: `RUST_LOG=weft=trace`.
fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Two engines sharing a PSK, with one configured path from `a` to `b`.
fn linked_pair() -> (Engine, Engine) {
    init_tracing();
    let mut a = Engine::new(&Config::on_port(0)).unwrap();
    let mut b = Engine::new(&Config::on_port(0)).unwrap();

    let key: Vec<u8> = (0..32).collect();
    a.set_key(&key).unwrap();
    b.set_key(&key).unwrap();

    let b_port = b.local_addr().unwrap().port();
    a.peer("127.0.0.1", "127.0.0.1", b_port, false).unwrap();
    (a, b)
}

fn write48(dst: &mut [u8], v: u64) {
    for (i, byte) in dst.iter_mut().enumerate().take(6) {
        *byte = (v >> (8 * i)) as u8;
    }
}

fn now_usec() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_micros() as u64
        & ((1 << 48) - 1)
}

// ============================================================================
// Peer setup
// ============================================================================

#[test]
fn test_peer_setup() {
    let mut engine = Engine::new(&Config::on_port(0)).unwrap();
    engine.peer("10.0.0.1", "10.0.0.2", 5000, false).unwrap();

    assert_eq!(engine.path_count(), 1);
    let path = engine.paths().next().unwrap();
    assert!(path.active);
    assert!(!path.bak.local);
}

#[test]
fn test_config_installs_peers() {
    let mut config = Config::on_port(0);
    config.peers.push(PeerConfig {
        local: "127.0.0.1".parse().unwrap(),
        remote: "127.0.0.1".parse().unwrap(),
        port: 4242,
        backup: true,
    });

    let engine = Engine::new(&config).unwrap();
    assert_eq!(engine.path_count(), 1);
    assert!(engine.paths().next().unwrap().bak.local);
}

// ============================================================================
// PSK symmetry
// ============================================================================

#[test]
fn test_psk_hello_roundtrip() {
    let (mut a, mut b) = linked_pair();

    // A cold path transmits in recovery mode, which reports no usable
    // path even though the datagram went out.
    a.send(b"hello", 0).unwrap();

    let drained = pump(&mut b, 200);
    assert_eq!(drained.data, vec![b"hello".to_vec()]);
    // the tick's KEYX preceded the data datagram
    assert!(drained.datagrams >= 2);

    // the receiver discovered the path from the control packet
    assert_eq!(b.path_count(), 1);
    assert!(!b.paths().next().unwrap().active);
}

#[test]
fn test_mismatched_psk_delivers_nothing() {
    let (mut a, mut b) = linked_pair();
    b.set_key(&[0xAA; 32]).unwrap();

    a.send(b"sealed", 0).unwrap();
    let drained = pump(&mut b, 200);
    assert!(drained.data.is_empty());
    // the unauthenticated KEYX cannot create a path either
    assert_eq!(b.path_count(), 0);
}

#[test]
fn test_traffic_class_accepted() {
    let (mut a, mut b) = linked_pair();
    a.send(b"expedited", 0x2e).unwrap();
    assert_eq!(pump(&mut b, 200).data, vec![b"expedited".to_vec()]);
}

// ============================================================================
// Freshness
// ============================================================================

#[test]
fn test_stale_timestamp_dropped() {
    let (_, mut b) = linked_pair();
    let b_port = b.local_addr().unwrap().port();
    let forger = UdpSocket::bind("127.0.0.1:0").unwrap();

    // data-class packet stamped 11 minutes in the past
    let mut packet = [0u8; 64];
    write48(&mut packet[..6], now_usec().wrapping_sub(11 * 60 * 1_000_000));
    forger.send_to(&packet, ("127.0.0.1", b_port)).unwrap();

    // control-class packet equally stale
    let mut ctrl = [0u8; 94];
    write48(&mut ctrl[6..12], now_usec().wrapping_sub(11 * 60 * 1_000_000));
    forger.send_to(&ctrl, ("127.0.0.1", b_port)).unwrap();

    let drained = pump(&mut b, 200);
    assert_eq!(drained.datagrams, 2);
    assert!(drained.data.is_empty());
    assert_eq!(b.path_count(), 0);
    assert!(!b.crypto_status().bad_key, "dropped before any crypto work");
}

#[test]
fn test_fresh_forgery_dropped_without_path() {
    let (_, mut b) = linked_pair();
    let b_port = b.local_addr().unwrap().port();
    let forger = UdpSocket::bind("127.0.0.1:0").unwrap();

    // well-timed control packet with a garbage tag
    let mut ctrl = [0u8; 94];
    write48(&mut ctrl[6..12], now_usec());
    forger.send_to(&ctrl, ("127.0.0.1", b_port)).unwrap();

    let drained = pump(&mut b, 200);
    assert_eq!(drained.datagrams, 1);
    assert_eq!(b.path_count(), 0, "forged control must not create a path");
}

#[test]
fn test_runt_datagrams_ignored() {
    let (_, mut b) = linked_pair();
    let b_port = b.local_addr().unwrap().port();
    let forger = UdpSocket::bind("127.0.0.1:0").unwrap();

    forger.send_to(&[], ("127.0.0.1", b_port)).unwrap();
    forger.send_to(&[1, 2, 3], ("127.0.0.1", b_port)).unwrap();
    forger.send_to(&[0u8; 22], ("127.0.0.1", b_port)).unwrap();

    let drained = pump(&mut b, 200);
    assert!(drained.data.is_empty());
    assert_eq!(b.path_count(), 0);
}

// ============================================================================
// Key rotation
// ============================================================================

#[test]
fn test_keyx_rotation_promotes() {
    let (mut a, mut b) = linked_pair();

    // First exchange: A's tick sends KEYX, B replies, A latches use_next.
    a.send(b"first", 0).unwrap();
    let drained = pump(&mut b, 200);
    assert_eq!(drained.data, vec![b"first".to_vec()]);
    pump(&mut a, 200);
    assert!(a.crypto_status().use_next, "peer echoed our public half");
    assert!(!b.crypto_status().use_next);

    // A now seals under the negotiated key; B's trial under `next`
    // succeeds and promotes, visibly advancing its epoch.
    let b_epoch = b.crypto_status().epoch_tag;
    a.send(b"second", 0).unwrap();
    let drained = pump(&mut b, 200);
    assert_eq!(drained.data, vec![b"second".to_vec()]);
    assert_ne!(b.crypto_status().epoch_tag, b_epoch);
    assert!(!b.crypto_status().use_next);

    // B's first reply data promotes A the same way.
    let a_epoch = a.crypto_status().epoch_tag;
    b.send(b"reply", 0).unwrap();
    let drained = pump(&mut a, 200);
    assert_eq!(drained.data, vec![b"reply".to_vec()]);
    assert_ne!(a.crypto_status().epoch_tag, a_epoch);
    assert!(!a.crypto_status().use_next);

    // Settled: traffic keeps flowing both ways under the new epoch.
    a.send(b"third", 0).unwrap();
    assert_eq!(pump(&mut b, 200).data, vec![b"third".to_vec()]);
}

// ============================================================================
// MTU negotiation
// ============================================================================

#[test]
fn test_mtu_negotiation_converges_to_min() {
    let (mut a, mut b) = linked_pair();
    a.set_mtu(1200).unwrap();
    assert_eq!(b.mtu(), 1400);
    a.set_send_timeout(Duration::from_millis(1)).unwrap();

    for _ in 0..30 {
        a.send(&[], 0).unwrap();
        pump(&mut b, 50);
        pump(&mut a, 50);
        if a.mtu() == 1200 && b.mtu() == 1200 {
            break;
        }
        sleep(Duration::from_millis(2));
    }

    assert_eq!(a.mtu(), 1200);
    assert_eq!(b.mtu(), 1200);
}

#[test]
fn test_mtu_gates_send_size() {
    let (mut a, mut b) = linked_pair();
    a.set_mtu(500).unwrap();

    let ok = vec![0x55u8; 500];
    a.send(&ok, 0).unwrap();

    let too_big = vec![0x55u8; 501];
    assert!(a.send(&too_big, 0).is_err());

    let drained = pump(&mut b, 200);
    assert_eq!(drained.data, vec![ok]);
}

// ============================================================================
// Backup paths
// ============================================================================

#[test]
fn test_backup_path_still_delivers() {
    let mut a = Engine::new(&Config::on_port(0)).unwrap();
    let mut b = Engine::new(&Config::on_port(0)).unwrap();
    let key = [7u8; 32];
    a.set_key(&key).unwrap();
    b.set_key(&key).unwrap();

    let b_port = b.local_addr().unwrap().port();
    a.peer("127.0.0.1", "127.0.0.1", b_port, true).unwrap();
    assert!(a.paths().next().unwrap().bak.local);

    // all paths are backup: the first backup carries the data anyway
    let sent = a.send(b"last resort", 0).unwrap();
    assert!(sent > 0);
    assert_eq!(pump(&mut b, 200).data, vec![b"last resort".to_vec()]);
}

#[test]
fn test_bakx_propagates_and_demotes() {
    let mut a = Engine::new(&Config::on_port(0)).unwrap();
    let mut b = Engine::new(&Config::on_port(0)).unwrap();
    let key = [7u8; 32];
    a.set_key(&key).unwrap();
    b.set_key(&key).unwrap();

    let b_port = b.local_addr().unwrap().port();
    a.peer("127.0.0.1", "127.0.0.1", b_port, true).unwrap();
    a.set_send_timeout(Duration::from_millis(1)).unwrap();

    for _ in 0..30 {
        a.send(&[], 0).unwrap();
        pump(&mut b, 50);
        pump(&mut a, 50);
        let settled = b.path_count() == 1 && {
            let p = b.paths().next().unwrap();
            p.bak.remote && p.bak.local
        };
        if settled && a.paths().next().unwrap().bak.remote {
            break;
        }
        sleep(Duration::from_millis(2));
    }

    // B learned the peer's backup flag and was demoted itself by
    // accepting it; its echo taught A the remote flag in turn.
    let b_path = b.paths().next().unwrap();
    assert!(b_path.bak.remote);
    assert!(b_path.bak.local);
    assert!(a.paths().next().unwrap().bak.remote);
}

// ============================================================================
// Bad-key recovery
// ============================================================================

#[test]
fn test_bad_key_storm_schedules_keyx() {
    let (mut a, mut b) = linked_pair();

    // establish B's discovered path under the shared key
    a.send(b"warmup", 0).unwrap();
    assert_eq!(pump(&mut b, 200).data, vec![b"warmup".to_vec()]);
    pump(&mut a, 200);

    // B loses the key; A keeps transmitting
    b.set_key(&[0x42; 32]).unwrap();
    for _ in 0..3 {
        a.send(b"opaque", 0).unwrap();
    }

    let drained = pump(&mut b, 200);
    assert!(drained.data.is_empty());
    assert!(b.crypto_status().bad_key);

    // drain A's backlog, then let B's tick emit the recovery KEYX
    pump(&mut a, 200);
    b.send(&[], 0).unwrap();
    assert!(!b.crypto_status().bad_key, "tick clears the flag");

    let drained = pump(&mut a, 200);
    assert_eq!(drained.datagrams, 1, "one KEYX on the discovered path");
    // A can't authenticate it (keys differ), so nothing else changes
    assert!(drained.data.is_empty());
}

// ============================================================================
// Dual stack
// ============================================================================

#[test]
fn test_dual_stack_unwraps_v4_mapped() {
    let mut a = Engine::new(&Config::on_port(0)).unwrap();
    let mut config = Config::on_port(0);
    config.ipv6 = true; // dual-stack receiver
    let mut b = Engine::new(&config).unwrap();

    let key = [3u8; 32];
    a.set_key(&key).unwrap();
    b.set_key(&key).unwrap();

    let b_port = b.local_addr().unwrap().port();
    a.peer("127.0.0.1", "127.0.0.1", b_port, false).unwrap();

    a.send(b"mapped", 0).unwrap();
    assert_eq!(pump(&mut b, 200).data, vec![b"mapped".to_vec()]);

    // the discovered path is stored as native v4 on both halves
    let path = b.paths().next().unwrap();
    assert!(path.local_addr.is_ipv4());
    assert!(path.remote_addr.is_ipv4());
}
