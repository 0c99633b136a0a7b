//! The tunnel engine.
//!
//! One engine owns one UDP socket, the path table, and the key epochs.
//! It is single-threaded and host-driven: `recv` ingests exactly one
//! datagram, `send` runs the control tick and transmits exactly one, and
//! the host multiplexes both over the exposed file descriptor. Nothing
//! here blocks beyond the one syscall per call and nothing allocates on
//! the data path.

use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::crypto::KeyEpochs;
use crate::error::{Error, Result};
use crate::net::{addr, TunnelSocket};
use crate::path::{next_limit, PathTable};
use crate::protocol::{
    framing, Control, CTRL_HEADER_SIZE, CTRL_PAYLOAD_MAX, KEYX_TIMEOUT, PONG_TIMEOUT,
    SEND_TIMEOUT, TIME_TOLERANCE,
};
use crate::time;
use crate::{KEY_SIZE, MAC_SIZE, PACKET_MAX_SIZE, PACKET_MIN_SIZE, U48_SIZE};

/// Smallest accepted MTU.
pub const MTU_MIN: usize = 500;

/// Largest accepted MTU: a max-size datagram minus protocol headroom.
pub const MTU_MAX: usize = PACKET_MAX_SIZE - 50;

/// MTU negotiation state.
#[derive(Debug, Clone, Copy)]
struct MtuState {
    local: usize,
    /// Peer-announced MTU; zero until the first MTUX arrives.
    remote: usize,
    /// Last MTUX emission.
    send_time: u64,
}

/// Snapshot of the key-epoch state, for hosts and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoStatus {
    /// Outbound data currently seals under the freshly negotiated key.
    pub use_next: bool,
    /// Decryption failed under every epoch; a KEYX is scheduled.
    pub bad_key: bool,
    /// AES-256-GCM requested and available locally.
    pub aes: bool,
    /// Fingerprint of the current encrypt key; changes on promotion.
    pub epoch_tag: [u8; 8],
}

/// Multipath encrypted UDP tunnel engine.
pub struct Engine {
    socket: TunnelSocket,
    send_timeout: u64,
    time_tolerance: u64,
    paths: PathTable,
    crypto: KeyEpochs,
    mtu: MtuState,
}

impl Engine {
    /// Create an engine from a configuration: bind the socket, install
    /// the key and timers, add configured peers.
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;

        let socket = TunnelSocket::bind(config.port, config.ipv4, config.ipv6)?;
        let crypto = KeyEpochs::new(config.prefer_aes);

        let mut engine = Self {
            socket,
            send_timeout: SEND_TIMEOUT,
            time_tolerance: TIME_TOLERANCE,
            paths: PathTable::default(),
            crypto,
            mtu: MtuState {
                local: 0,
                remote: 0,
                send_time: 0,
            },
        };

        engine.set_mtu(config.mtu)?;
        engine.set_send_timeout(config.send_timeout)?;
        engine.set_time_tolerance(config.time_tolerance)?;
        if let Some(key) = config.key_bytes()? {
            engine.set_key(&key)?;
        }
        for peer in &config.peers {
            engine.peer_addr(peer.local, SocketAddr::new(peer.remote, peer.port), peer.backup)?;
        }

        debug!(port = config.port, v4 = config.ipv4, v6 = config.ipv6, "engine created");
        Ok(engine)
    }

    /// Install an operator-configured path to a peer endpoint.
    ///
    /// `local` and `host` must be literal IP addresses; there is no name
    /// resolution here.
    pub fn peer(&mut self, local: &str, host: &str, port: u16, backup: bool) -> Result<()> {
        let local = addr::parse_ip(local)?;
        let remote = addr::parse_ip(host)?;
        self.peer_addr(local, SocketAddr::new(remote, port), backup)
    }

    /// Typed variant of [`peer`](Self::peer).
    pub fn peer_addr(&mut self, local: IpAddr, remote: SocketAddr, backup: bool) -> Result<()> {
        if remote.port() == 0 {
            return Err(Error::InvalidArgument("peer port must be non-zero".into()));
        }
        let local = addr::unmap_v4_ip(local);
        let remote = addr::unmap_v4_addr(remote);

        let Some(index) = self.paths.find_or_insert(local, remote, true) else {
            return Err(Error::InvalidAddress(format!(
                "address family mismatch: {local} vs {remote}"
            )));
        };
        if let Some(path) = self.paths.get_mut(index) {
            path.active = true;
            path.bak.local = backup;
        }
        debug!(%local, %remote, backup, "peer installed");
        Ok(())
    }

    /// Overwrite the pre-shared key (at least 32 bytes; the first 32 are
    /// used). Resets every key epoch.
    pub fn set_key(&mut self, key: &[u8]) -> Result<()> {
        self.crypto.set_key(key)
    }

    /// The pre-shared key.
    pub fn key(&self) -> [u8; KEY_SIZE] {
        self.crypto.psk()
    }

    /// Set the local MTU. Re-arms the MTUX announcement on change.
    pub fn set_mtu(&mut self, mtu: usize) -> Result<()> {
        if !(MTU_MIN..=MTU_MAX).contains(&mtu) {
            return Err(Error::MtuOutOfRange {
                mtu,
                min: MTU_MIN,
                max: MTU_MAX,
            });
        }
        if self.mtu.local != mtu {
            self.mtu.local = mtu;
            self.mtu.send_time = 0;
        }
        Ok(())
    }

    /// Effective MTU: the smaller of ours and the peer's, or ours alone
    /// until the peer has announced.
    pub fn mtu(&self) -> usize {
        if self.mtu.remote == 0 || self.mtu.local < self.mtu.remote {
            self.mtu.local
        } else {
            self.mtu.remote
        }
    }

    /// Control retransmission / path-recovery interval. Must be non-zero.
    pub fn set_send_timeout(&mut self, timeout: Duration) -> Result<()> {
        let usec = timeout.as_micros() as u64;
        if usec == 0 {
            return Err(Error::InvalidArgument("send timeout must be non-zero".into()));
        }
        self.send_timeout = usec;
        Ok(())
    }

    /// Freshness window for inbound timestamps. Must be non-zero.
    pub fn set_time_tolerance(&mut self, tolerance: Duration) -> Result<()> {
        let usec = tolerance.as_micros() as u64;
        if usec == 0 {
            return Err(Error::InvalidArgument("time tolerance must be non-zero".into()));
        }
        self.time_tolerance = usec;
        Ok(())
    }

    /// Local socket address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Switch the socket's blocking mode (for the host's event loop).
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.socket.set_nonblocking(nonblocking)?;
        Ok(())
    }

    /// Number of known paths.
    pub fn path_count(&self) -> usize {
        self.paths.len()
    }

    /// The known paths, in insertion order.
    pub fn paths(&self) -> impl Iterator<Item = &crate::path::Path> {
        self.paths.iter()
    }

    /// Snapshot of the key-epoch state.
    pub fn crypto_status(&self) -> CryptoStatus {
        CryptoStatus {
            use_next: self.crypto.use_next,
            bad_key: self.crypto.bad_key,
            aes: self.crypto.aes,
            epoch_tag: self.crypto.epoch_tag(),
        }
    }

    /// Receive and process one datagram.
    ///
    /// Returns the plaintext length for data packets, `Ok(0)` for
    /// control packets and anything dropped, and an error only when the
    /// socket itself fails.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut packet = [0u8; PACKET_MAX_SIZE];
        let meta = self.socket.recv_with_meta(&mut packet)?;

        if meta.len <= PACKET_MIN_SIZE {
            trace!(len = meta.len, "runt datagram dropped");
            return Ok(0);
        }

        let now = time::now();
        let mut send_time = time::read48(&packet);
        let is_ctrl = send_time == 0;
        if is_ctrl {
            if meta.len < PACKET_MIN_SIZE + U48_SIZE {
                trace!(len = meta.len, "runt control datagram dropped");
                return Ok(0);
            }
            send_time = time::read48(&packet[U48_SIZE..]);
        }

        if time::abs_diff(now, send_time) >= self.time_tolerance {
            trace!(send_time, "stale timestamp dropped");
            return Ok(0);
        }

        if is_ctrl && !framing::verify_ctrl(&self.crypto.private, &packet[..meta.len]) {
            trace!("control packet failed authentication");
            return Ok(0);
        }

        let remote = addr::unmap_v4_addr(meta.remote);
        let Some(local) = meta.local else {
            trace!("no destination address ancillary data");
            return Ok(0);
        };
        let local = addr::unmap_v4_ip(local);

        // Only authenticated control traffic may create a path.
        let Some(index) = self.paths.find_or_insert(local, remote, is_ctrl) else {
            trace!(%local, %remote, "no path for data datagram");
            return Ok(0);
        };

        if !is_ctrl {
            // Authenticate before touching any path state.
            let len = meta.len - PACKET_MIN_SIZE;
            if len > buf.len() {
                trace!(len, "caller buffer too small, datagram dropped");
                return Ok(0);
            }
            match framing::open_data(&mut self.crypto, &packet[..meta.len], buf) {
                Ok(len) => {
                    self.note_arrival(index, now, send_time);
                    Ok(len)
                }
                Err(_) => {
                    trace!("data packet failed all epoch trials");
                    Ok(0)
                }
            }
        } else {
            self.note_arrival(index, now, send_time);
            self.ingest_ctrl(index, &packet[..meta.len], send_time, now);
            Ok(0)
        }
    }

    /// Send one data datagram (and run the control tick).
    ///
    /// An empty payload runs the tick alone. Returns the wire bytes
    /// transmitted, or `Ok(0)` when no path is usable.
    pub fn send(&mut self, data: &[u8], tc: u8) -> Result<usize> {
        self.tick();

        if data.is_empty() {
            return Ok(0);
        }
        let mtu = self.mtu();
        if data.len() > mtu {
            return Err(Error::PayloadTooLarge {
                size: data.len(),
                mtu,
            });
        }

        let now = time::now();
        let mut packet = [0u8; PACKET_MAX_SIZE];
        let len = framing::seal_data(self.crypto.seal_key(), now, data, &mut packet)?;

        // Credit scan over the primary paths. A path silent past the
        // send timeout is recovering: transmit on it right away and keep
        // scanning, so a newly revived link warms up without waiting its
        // turn.
        let mut best: Option<(usize, u64)> = None;
        for index in 0..self.paths.len() {
            let (is_backup, limit, send_time, rtt, recv_time) = {
                let Some(path) = self.paths.get(index) else { break };
                (path.bak.local, path.limit, path.send_time, path.rtt, path.recv_time)
            };
            if is_backup {
                continue;
            }

            let candidate = next_limit(limit, now.wrapping_sub(send_time), rtt);
            if time::timed_out(now, recv_time, self.send_timeout) {
                let _ = self.transmit(index, &packet[..len], tc, now);
                if let Some(path) = self.paths.get_mut(index) {
                    path.limit = candidate;
                }
                continue;
            }
            if best.map_or(true, |(_, lowest)| candidate < lowest) {
                best = Some((index, candidate));
            }
        }

        if let Some((index, candidate)) = best {
            let sent = self.transmit(index, &packet[..len], tc, now)?;
            if sent == len {
                if let Some(path) = self.paths.get_mut(index) {
                    path.limit = candidate;
                }
            }
            return Ok(sent);
        }

        // Nothing primary was usable: fall back to the first backup.
        let fallback = (0..self.paths.len())
            .find(|&i| self.paths.get(i).is_some_and(|p| p.bak.local));
        match fallback {
            Some(index) => Ok(self.transmit(index, &packet[..len], tc, now)?),
            None => Ok(0),
        }
    }

    /// Per-path control scheduling, run at the top of every `send`.
    fn tick(&mut self) {
        let mut bad_key_keyx = false;
        let mut last_now = 0;

        for index in 0..self.paths.len() {
            let now = time::now();
            last_now = now;
            let active = {
                let Some(path) = self.paths.get(index) else { break };
                path.active
            };

            if !active {
                // Discovered paths only carry the bad-key recovery KEYX.
                if self.crypto.bad_key
                    && time::timed_out(now, self.crypto.send_time, self.send_timeout)
                {
                    let keyx = Control::Keyx {
                        public: self.crypto.public_bytes(),
                    };
                    self.send_ctrl(index, &keyx, now);
                    bad_key_keyx = true;
                }
                continue;
            }

            if time::timed_out(now, self.crypto.send_time, self.send_timeout)
                && time::timed_out(now, self.crypto.recv_time, KEYX_TIMEOUT)
            {
                let keyx = Control::Keyx {
                    public: self.crypto.public_bytes(),
                };
                self.send_ctrl(index, &keyx, now);
                self.crypto.send_time = now;
                continue;
            }

            if self.mtu.remote == 0 && time::timed_out(now, self.mtu.send_time, self.send_timeout)
            {
                self.send_ctrl(index, &Control::Mtux { mtu: self.mtu.local as u64 }, now);
                self.mtu.send_time = now;
                continue;
            }

            let (is_backup_only_local, bak_send_time, never_sent) = {
                let Some(path) = self.paths.get(index) else { break };
                (
                    path.bak.local && !path.bak.remote,
                    path.bak.send_time,
                    path.send_time == 0,
                )
            };
            if is_backup_only_local && time::timed_out(now, bak_send_time, self.send_timeout) {
                self.send_ctrl(index, &Control::Bakx { backup: true }, now);
                if let Some(path) = self.paths.get_mut(index) {
                    path.bak.send_time = now;
                }
                continue;
            }

            if never_sent {
                self.send_ctrl(index, &Control::Ping, now);
            }
        }

        // The bad-key recovery goes out on every discovered path in one
        // sweep; the flag and timestamp settle afterwards.
        if bad_key_keyx {
            self.crypto.send_time = last_now;
            self.crypto.bad_key = false;
        }
    }

    /// Per-path arrival bookkeeping shared by data and control packets:
    /// delay EWMAs, the peer timestamp, the PONG trigger, and finally
    /// `recv_time`.
    fn note_arrival(&mut self, index: usize, now: u64, send_time: u64) {
        let pong = {
            let Some(path) = self.paths.get_mut(index) else { return };
            path.note_arrival(now, send_time);
            !path.bak.local
                && path.recv_time != 0
                && time::timed_out(now, path.pong_time, PONG_TIMEOUT)
        };

        if pong {
            let msg = {
                let Some(path) = self.paths.get(index) else { return };
                Control::Pong {
                    sdt: path.sdt,
                    rdt: path.rdt,
                    rst: path.rst,
                }
            };
            self.send_ctrl(index, &msg, now);
            if let Some(path) = self.paths.get_mut(index) {
                path.pong_time = now;
            }
        }

        if let Some(path) = self.paths.get_mut(index) {
            path.recv_time = now;
        }
    }

    /// Dispatch one authenticated control packet by its exact size.
    fn ingest_ctrl(&mut self, index: usize, packet: &[u8], send_time: u64, now: u64) {
        match Control::parse(packet) {
            Some(Control::Keyx { public }) => {
                let outcome = self.crypto.handle_keyx(&public, now);
                if outcome.reply {
                    let keyx = Control::Keyx {
                        public: self.crypto.public_bytes(),
                    };
                    self.send_ctrl(index, &keyx, now);
                }
            }
            Some(Control::Mtux { mtu }) => {
                self.mtu.remote = mtu as usize;
                debug!(remote_mtu = self.mtu.remote, "peer MTU learned");
                let echo = self.paths.get(index).is_some_and(|p| !p.active);
                if echo {
                    self.send_ctrl(index, &Control::Mtux { mtu: self.mtu.local as u64 }, now);
                }
            }
            Some(Control::Pong { sdt, rdt, rst }) => {
                if let Some(path) = self.paths.get_mut(index) {
                    path.r_sdt = sdt;
                    path.r_rdt = rdt;
                    path.r_rst = rst;
                    path.r_dt = send_time as i64 - rst as i64;
                    path.rtt = now.wrapping_sub(rst);
                    trace!(rtt = path.rtt, "pong");
                }
            }
            Some(Control::Bakx { backup }) => {
                // Accepting a peer's backup advertisement also demotes
                // this path locally, which keeps the backup topology
                // consistent on both ends.
                let echo = {
                    let Some(path) = self.paths.get_mut(index) else { return };
                    path.bak.local = true;
                    path.bak.remote = backup;
                    debug!(%path.remote_addr, backup, "backup flag ingested");
                    !path.active
                };
                if echo {
                    self.send_ctrl(index, &Control::Bakx { backup: true }, now);
                }
            }
            Some(Control::Ping) | None => {}
        }
    }

    /// Build, seal, and transmit one control message on one path.
    fn send_ctrl(&mut self, index: usize, msg: &Control, now: u64) {
        let mut buf = [0u8; CTRL_HEADER_SIZE + CTRL_PAYLOAD_MAX + MAC_SIZE];
        time::write48(&mut buf[U48_SIZE..CTRL_HEADER_SIZE], now);
        msg.write_payload(&mut buf[CTRL_HEADER_SIZE..]);

        match framing::seal_ctrl(&self.crypto.private, &mut buf, msg.payload_len()) {
            Ok(len) => {
                let _ = self.transmit(index, &buf[..len], 0, now);
            }
            Err(e) => warn!(error = %e, "control packet seal failed"),
        }
    }

    /// One `sendmsg` on one path. Stamps `send_time` regardless of the
    /// outcome, like any other transmission attempt.
    fn transmit(&mut self, index: usize, packet: &[u8], tc: u8, now: u64) -> Result<usize> {
        let Some(path) = self.paths.get_mut(index) else {
            return Err(Error::InvalidArgument(format!("no path at index {index}")));
        };
        path.ctrl.set_tc(tc);
        let result = self.socket.send_pinned(packet, &path.remote_addr, &path.ctrl);
        path.send_time = now;

        match result {
            Ok(sent) => Ok(sent),
            Err(e) => {
                trace!(error = %e, remote = %path.remote_addr, "transmit failed");
                Err(e.into())
            }
        }
    }
}

impl AsRawFd for Engine {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("paths", &self.paths.len())
            .field("mtu", &self.mtu)
            .field("crypto", &self.crypto)
            .finish_non_exhaustive()
    }
}
