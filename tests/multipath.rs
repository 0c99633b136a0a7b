//! Multipath behavior over loopback address aliases.
//!
//! The sender pins egress to 127.0.0.1 and 127.0.0.2 (both loopback on
//! Linux), giving the receiver two distinct paths from one socket pair.

use std::os::unix::io::AsRawFd;
use std::thread::sleep;
use std::time::Duration;

use weft::prelude::*;

fn wait_readable(fd: i32, timeout_ms: i32) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    unsafe { libc::poll(&mut pfd, 1, timeout_ms) > 0 }
}

#[derive(Debug, Default)]
struct Drained {
    data: Vec<Vec<u8>>,
    datagrams: usize,
}

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

/// Sender with two primary paths into one receiver.
fn two_path_pair() -> (Engine, Engine) {
    let mut a = Engine::new(&Config::on_port(0)).unwrap();
    let mut b = Engine::new(&Config::on_port(0)).unwrap();

    let key = [11u8; 32];
    a.set_key(&key).unwrap();
    b.set_key(&key).unwrap();

    let b_port = b.local_addr().unwrap().port();
    a.peer("127.0.0.1", "127.0.0.1", b_port, false).unwrap();
    a.peer("127.0.0.2", "127.0.0.1", b_port, false).unwrap();
    (a, b)
}

#[test]
fn test_receiver_discovers_both_paths() {
    let (mut a, mut b) = two_path_pair();

    // The first tick puts one control message on each path (KEYX on the
    // first, MTUX on the second), so both get discovered at once.
    a.send(b"spread", 0).unwrap();
    let drained = pump(&mut b, 200);

    assert!(!drained.data.is_empty());
    assert_eq!(b.path_count(), 2);

    let remotes: Vec<_> = b.paths().map(|p| p.remote_addr.ip().to_string()).collect();
    assert!(remotes.contains(&"127.0.0.1".to_string()));
    assert!(remotes.contains(&"127.0.0.2".to_string()));
}

#[test]
fn test_cold_paths_duplicate_warm_paths_do_not() {
    let (mut a, mut b) = two_path_pair();

    // Cold start: both paths are in recovery, so one send transmits on
    // both and the receiver sees the payload twice.
    a.send(b"dup", 0).unwrap();
    let drained = pump(&mut b, 200);
    assert_eq!(drained.data, vec![b"dup".to_vec(), b"dup".to_vec()]);

    // Warm up until the sender has heard a PONG on both paths.
    for i in 0..50 {
        let payload = format!("warm-{i}");
        a.send(payload.as_bytes(), 0).unwrap();
        pump(&mut b, 20);
        pump(&mut a, 20);
        if a.paths().all(|p| p.rtt > 0 && p.recv_time > 0) {
            break;
        }
        sleep(Duration::from_millis(5));
    }
    assert!(a.paths().all(|p| p.rtt > 0), "both paths measured an RTT");
    pump(&mut b, 100);

    // Warm burst: every send picks exactly one path, so counts match.
    for i in 0..20 {
        let payload = format!("burst-{i}");
        a.send(payload.as_bytes(), 0).unwrap();
    }
    let drained = pump(&mut b, 200);
    assert_eq!(drained.data.len(), 20, "no duplicates once warm");
}

#[test]
fn test_warm_burst_uses_both_paths() {
    let (mut a, mut b) = two_path_pair();

    for i in 0..50 {
        let payload = format!("warm-{i}");
        a.send(payload.as_bytes(), 0).unwrap();
        pump(&mut b, 20);
        pump(&mut a, 20);
        if a.paths().all(|p| p.rtt > 0 && p.recv_time > 0) {
            break;
        }
        sleep(Duration::from_millis(5));
    }
    assert!(a.paths().all(|p| p.rtt > 0));
    pump(&mut b, 100);

    let before: Vec<u64> = a.paths().map(|p| p.send_time).collect();
    for i in 0..20 {
        let payload = format!("burst-{i}");
        a.send(payload.as_bytes(), 0).unwrap();
    }
    let after: Vec<u64> = a.paths().map(|p| p.send_time).collect();

    // With equal loopback RTTs the credit scan alternates, so both
    // paths transmitted during the burst.
    assert!(after
        .iter()
        .zip(&before)
        .all(|(now, then)| now > then), "every path advanced: {before:?} -> {after:?}");

    assert_eq!(pump(&mut b, 200).data.len(), 20);
}

#[test]
fn test_bad_key_recovery_covers_every_discovered_path() {
    let (mut a, mut b) = two_path_pair();

    // Discover both paths at B under the shared key.
    a.send(b"warmup", 0).unwrap();
    pump(&mut b, 200);
    assert_eq!(b.path_count(), 2);
    pump(&mut a, 200);

    // B rotates to a different PSK and A's traffic stops authenticating.
    b.set_key(&[0x5a; 32]).unwrap();
    for _ in 0..3 {
        a.send(b"opaque", 0).unwrap();
    }
    let drained = pump(&mut b, 200);
    assert!(drained.data.is_empty());
    assert!(b.crypto_status().bad_key);

    // One tick emits the recovery KEYX on *every* discovered path.
    pump(&mut a, 200);
    b.send(&[], 0).unwrap();
    assert!(!b.crypto_status().bad_key);

    let drained = pump(&mut a, 200);
    assert_eq!(drained.datagrams, 2, "one KEYX per discovered path");
    assert!(drained.data.is_empty());
}
