//! Network plumbing: address utilities and the ancillary-data UDP socket.

pub mod addr;
pub mod socket;

pub use addr::{parse_ip, unmap_v4_addr, unmap_v4_ip};
pub use socket::{CtrlBuf, RecvMeta, TunnelSocket};
