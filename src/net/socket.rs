//! UDP socket with source-address and traffic-class ancillary data.
//!
//! The engine pins the egress address of every outbound datagram with
//! `IP_PKTINFO`/`IPV6_PKTINFO` and learns the destination address of every
//! inbound one the same way — that observed destination is half of a path's
//! identity. The traffic class rides along as an `IP_TOS`/`IPV6_TCLASS`
//! control message whose byte slot is overwritten in place per send.
//!
//! Socket creation goes through `socket2`; the ancillary plumbing is raw
//! `libc` because no safe wrapper covers per-packet cmsg construction.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::{Error, Result};

/// Room for one pktinfo cmsg plus one traffic-class cmsg, either family.
const CTRL_SPACE: usize = 128;

/// Precomputed ancillary buffer for one path.
///
/// Built once at path creation; the traffic-class slot inside it is the
/// only part that changes afterwards, rewritten before each send.
#[derive(Clone)]
pub struct CtrlBuf {
    data: [u8; CTRL_SPACE],
    len: usize,
    tc_off: usize,
}

impl CtrlBuf {
    /// Build the control buffer pinning egress to `local`.
    pub fn new(local: IpAddr) -> Self {
        let mut ctrl = Self {
            data: [0u8; CTRL_SPACE],
            len: 0,
            tc_off: 0,
        };

        // Lay the two cmsgs out with the libc macros so alignment and
        // padding match what the kernel expects.
        unsafe {
            let mut msg: libc::msghdr = mem::zeroed();
            msg.msg_control = ctrl.data.as_mut_ptr().cast();
            msg.msg_controllen = CTRL_SPACE as _;

            let pin = libc::CMSG_FIRSTHDR(&msg);
            match local {
                IpAddr::V4(ip) => {
                    (*pin).cmsg_level = libc::IPPROTO_IP;
                    (*pin).cmsg_type = libc::IP_PKTINFO;
                    (*pin).cmsg_len =
                        libc::CMSG_LEN(mem::size_of::<libc::in_pktinfo>() as u32) as _;
                    ptr::write_unaligned(
                        libc::CMSG_DATA(pin).cast::<libc::in_pktinfo>(),
                        libc::in_pktinfo {
                            ipi_ifindex: 0,
                            ipi_spec_dst: libc::in_addr {
                                s_addr: u32::from_ne_bytes(ip.octets()),
                            },
                            ipi_addr: libc::in_addr { s_addr: 0 },
                        },
                    );

                    let tc = libc::CMSG_NXTHDR(&msg, pin);
                    (*tc).cmsg_level = libc::IPPROTO_IP;
                    (*tc).cmsg_type = libc::IP_TOS;
                    (*tc).cmsg_len = libc::CMSG_LEN(mem::size_of::<libc::c_int>() as u32) as _;
                    ctrl.tc_off =
                        libc::CMSG_DATA(tc) as usize - ctrl.data.as_ptr() as usize;

                    ctrl.len = (libc::CMSG_SPACE(mem::size_of::<libc::in_pktinfo>() as u32)
                        + libc::CMSG_SPACE(mem::size_of::<libc::c_int>() as u32))
                        as usize;
                }
                IpAddr::V6(ip) => {
                    (*pin).cmsg_level = libc::IPPROTO_IPV6;
                    (*pin).cmsg_type = libc::IPV6_PKTINFO;
                    (*pin).cmsg_len =
                        libc::CMSG_LEN(mem::size_of::<libc::in6_pktinfo>() as u32) as _;
                    ptr::write_unaligned(
                        libc::CMSG_DATA(pin).cast::<libc::in6_pktinfo>(),
                        libc::in6_pktinfo {
                            ipi6_addr: libc::in6_addr {
                                s6_addr: ip.octets(),
                            },
                            ipi6_ifindex: 0,
                        },
                    );

                    let tc = libc::CMSG_NXTHDR(&msg, pin);
                    (*tc).cmsg_level = libc::IPPROTO_IPV6;
                    (*tc).cmsg_type = libc::IPV6_TCLASS;
                    (*tc).cmsg_len = libc::CMSG_LEN(mem::size_of::<libc::c_int>() as u32) as _;
                    ctrl.tc_off =
                        libc::CMSG_DATA(tc) as usize - ctrl.data.as_ptr() as usize;

                    ctrl.len = (libc::CMSG_SPACE(mem::size_of::<libc::in6_pktinfo>() as u32)
                        + libc::CMSG_SPACE(mem::size_of::<libc::c_int>() as u32))
                        as usize;
                }
            }
        }
        ctrl
    }

    /// Overwrite the traffic-class slot. Idempotent.
    pub fn set_tc(&mut self, tc: u8) {
        let bytes = libc::c_int::from(tc).to_ne_bytes();
        self.data[self.tc_off..self.tc_off + bytes.len()].copy_from_slice(&bytes);
    }
}

impl std::fmt::Debug for CtrlBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtrlBuf").field("len", &self.len).finish()
    }
}

/// Metadata recovered alongside one inbound datagram.
#[derive(Debug)]
pub struct RecvMeta {
    /// Datagram length.
    pub len: usize,
    /// Source address, as reported by the kernel (not yet unmapped).
    pub remote: SocketAddr,
    /// Destination address from the pktinfo cmsg, when present.
    pub local: Option<IpAddr>,
}

/// The engine's UDP socket.
pub struct TunnelSocket {
    inner: Socket,
}

impl TunnelSocket {
    /// Create and bind the socket: `0.0.0.0` or `::` depending on the
    /// enabled families, reuse-addr, pktinfo reception, don't-fragment
    /// where the OS supports it.
    pub fn bind(port: u16, v4: bool, v6: bool) -> Result<Self> {
        if !v4 && !v6 {
            return Err(Error::InvalidArgument(
                "at least one of IPv4/IPv6 must be enabled".into(),
            ));
        }

        let domain = if v6 { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;

        let fd = socket.as_raw_fd();
        if v4 {
            sso_int(fd, libc::IPPROTO_IP, libc::IP_PKTINFO, 1)?;
        }
        if v6 {
            sso_int(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, 1)?;
            socket.set_only_v6(!v4)?;
        }
        #[cfg(target_os = "linux")]
        if v4 {
            // Best effort: clamp instead of fragmenting.
            let _ = sso_int(fd, libc::IPPROTO_IP, libc::IP_MTU_DISCOVER, libc::IP_PMTUDISC_DO);
        }

        let addr: SocketAddr = if v6 {
            (Ipv6Addr::UNSPECIFIED, port).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, port).into()
        };
        socket.bind(&addr.into()).map_err(|e| Error::BindFailed {
            port,
            reason: e.to_string(),
        })?;

        Ok(Self { inner: socket })
    }

    /// Local bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = self.inner.local_addr()?;
        addr.as_socket()
            .ok_or_else(|| Error::InvalidAddress("unnameable local address".into()))
    }

    /// Switch blocking mode. The engine itself never blocks twice per
    /// call either way; this is for the host's event loop.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.inner.set_nonblocking(nonblocking)
    }

    /// Send one datagram to `remote`, pinned and classed by `ctrl`.
    pub fn send_pinned(
        &self,
        buf: &[u8],
        remote: &SocketAddr,
        ctrl: &CtrlBuf,
    ) -> io::Result<usize> {
        let name = SockAddr::from(*remote);
        let mut iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = name.as_ptr() as *mut libc::c_void;
        msg.msg_namelen = name.len();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = ctrl.data.as_ptr() as *mut libc::c_void;
        msg.msg_controllen = ctrl.len as _;

        let n = unsafe { libc::sendmsg(self.inner.as_raw_fd(), &msg, 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Receive one datagram along with its source and observed
    /// destination addresses.
    pub fn recv_with_meta(&self, buf: &mut [u8]) -> io::Result<RecvMeta> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut ctrl = [0u8; CTRL_SPACE];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = ptr::addr_of_mut!(storage).cast();
        msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as _;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = ctrl.as_mut_ptr().cast();
        msg.msg_controllen = CTRL_SPACE as _;

        let n = unsafe { libc::recvmsg(self.inner.as_raw_fd(), &mut msg, 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let remote = unsafe { SockAddr::new(storage, msg.msg_namelen) }
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-IP source address"))?;

        let mut local = None;
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::IPPROTO_IP
                    && (*cmsg).cmsg_type == libc::IP_PKTINFO
                {
                    let info =
                        ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::in_pktinfo>());
                    local = Some(IpAddr::V4(Ipv4Addr::from(
                        info.ipi_addr.s_addr.to_ne_bytes(),
                    )));
                } else if (*cmsg).cmsg_level == libc::IPPROTO_IPV6
                    && (*cmsg).cmsg_type == libc::IPV6_PKTINFO
                {
                    let info =
                        ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::in6_pktinfo>());
                    local = Some(IpAddr::V6(Ipv6Addr::from(info.ipi6_addr.s6_addr)));
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        Ok(RecvMeta {
            len: n as usize,
            remote,
            local,
        })
    }
}

impl AsRawFd for TunnelSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

fn sso_int(fd: RawFd, level: libc::c_int, opt: libc::c_int, value: libc::c_int) -> Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            ptr::addr_of!(value).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(Error::Socket(io::Error::last_os_error()));
    }
    Ok(())
}
