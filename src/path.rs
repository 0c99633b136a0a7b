//! Per-path state and the path table.
//!
//! A path is one (local IP, remote socket address) binding: the local half
//! is the destination address observed on inbound packets and pins egress
//! on outbound ones, the remote half is the peer endpoint including port.
//! Operator-configured paths are `active`; the rest are discovered from
//! authenticated inbound control traffic.

use std::net::{IpAddr, SocketAddr};

use tracing::debug;

use crate::net::addr::same_family;
use crate::net::socket::CtrlBuf;

/// Backup role of a path.
///
/// `local` excludes the path from the primary transmit scan; `remote` is
/// what the peer last advertised. Both start false.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackupState {
    pub local: bool,
    pub remote: bool,
    /// Last BAKX emission on this path.
    pub send_time: u64,
}

/// One network path between the two peers.
///
/// All timestamps are 48-bit wire-clock microseconds; all deltas are
/// microsecond EWMAs with α = 1/8.
#[derive(Debug)]
pub struct Path {
    /// Operator-configured endpoint (as opposed to ingest-discovered).
    pub active: bool,
    pub local_addr: IpAddr,
    pub remote_addr: SocketAddr,
    /// Precomputed ancillary buffer: egress pin plus traffic-class slot.
    pub(crate) ctrl: CtrlBuf,
    pub bak: BackupState,

    /// Local inter-arrival EWMA.
    pub rdt: u64,
    /// Peer inter-send EWMA (from packet timestamps).
    pub sdt: u64,
    /// Peer's last send timestamp.
    pub rst: u64,
    /// Round-trip time measured from the last PONG.
    pub rtt: u64,

    /// Peer-echoed counterparts from the last PONG.
    pub r_sdt: u64,
    pub r_rdt: u64,
    pub r_rst: u64,
    /// Peer clock minus local clock over the echoed timestamp.
    pub r_dt: i64,

    /// Scheduling credit: virtual time at which this path is next free.
    pub limit: u64,

    pub recv_time: u64,
    pub send_time: u64,
    pub pong_time: u64,
}

impl Path {
    fn new(local_addr: IpAddr, remote_addr: SocketAddr) -> Self {
        Self {
            active: false,
            local_addr,
            remote_addr,
            ctrl: CtrlBuf::new(local_addr),
            bak: BackupState::default(),
            rdt: 0,
            sdt: 0,
            rst: 0,
            rtt: 0,
            r_sdt: 0,
            r_rdt: 0,
            r_rst: 0,
            r_dt: 0,
            limit: 0,
            recv_time: 0,
            send_time: 0,
            pong_time: 0,
        }
    }

    /// Fold one arrival into the delay EWMAs and remember the peer's
    /// send timestamp. Does not advance `recv_time` — the caller decides
    /// that after the PONG check.
    ///
    /// The seed is two-stage: the very first packet leaves the EWMAs at
    /// zero (there is no previous arrival to difference against), the
    /// second seeds them raw, and smoothing starts on the third.
    pub(crate) fn note_arrival(&mut self, now: u64, send_time: u64) {
        if self.rdt != 0 {
            self.rdt = (now.wrapping_sub(self.recv_time) + 7 * self.rdt) / 8;
            self.sdt = (send_time.wrapping_sub(self.rst) + 7 * self.sdt) / 8;
        } else if self.recv_time != 0 {
            self.rdt = now.wrapping_sub(self.recv_time);
            self.sdt = send_time.wrapping_sub(self.rst);
        }
        self.rst = send_time;
    }
}

/// Updated scheduling credit for a path about to transmit.
///
/// Credit drains in real time and each transmission charges half an RTT,
/// so under steady load the lowest-credit path is the one whose virtual
/// transmit clock is furthest behind — weighted round-robin by RTT.
pub fn next_limit(limit: u64, elapsed: u64, rtt: u64) -> u64 {
    if limit > elapsed {
        limit - elapsed + rtt / 2
    } else {
        rtt / 2
    }
}

/// The engine's paths, in insertion order.
///
/// Iteration order is part of the engine's contract (the control tick and
/// transmit scan walk it in order), so the storage is a plain vector that
/// only ever appends.
#[derive(Debug, Default)]
pub struct PathTable {
    paths: Vec<Path>,
}

impl PathTable {
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Path> {
        self.paths.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Path> {
        self.paths.get_mut(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Path> {
        self.paths.iter()
    }

    /// Find the path for an exact (local, remote) pair.
    pub fn find(&self, local: IpAddr, remote: &SocketAddr) -> Option<usize> {
        self.paths
            .iter()
            .position(|p| p.local_addr == local && p.remote_addr == *remote)
    }

    /// Find a path, appending a fresh one when `create` is set.
    ///
    /// Returns `None` on a family mismatch or when the path is absent and
    /// `create` is not set.
    pub fn find_or_insert(
        &mut self,
        local: IpAddr,
        remote: SocketAddr,
        create: bool,
    ) -> Option<usize> {
        if !same_family(local, &remote) {
            return None;
        }
        if let Some(index) = self.find(local, &remote) {
            return Some(index);
        }
        if !create {
            return None;
        }
        debug!(%local, %remote, "path created");
        self.paths.push(Path::new(local, remote));
        Some(self.paths.len() - 1)
    }
}
