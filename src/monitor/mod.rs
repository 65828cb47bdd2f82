//! Kernel event monitoring.
//!
//! Two dialects of one capability: the netlink socket on Linux and the
//! routing socket on the BSDs, both folded into a single [`KernelEvent`]
//! stream. Where the routing plane says nothing about multicast membership
//! (Linux), the MLD monitor sniffs outgoing MLDv2 reports and synthesizes
//! the missing events.

use std::net::Ipv6Addr;

#[cfg(target_os = "linux")]
mod netlink;
#[cfg(target_os = "linux")]
pub use netlink::KernelEventSource;

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd"))]
mod route;
#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd"))]
pub use route::KernelEventSource;

#[cfg(target_os = "linux")]
mod mld;
#[cfg(target_os = "linux")]
pub use mld::MldMonitor;

/// One observed change to the tunnel interface's kernel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelEvent {
    AddrAdd { addr: Ipv6Addr, prefix_len: u8 },
    AddrDel { addr: Ipv6Addr },
    MAddrAdd { addr: Ipv6Addr },
    MAddrDel { addr: Ipv6Addr },
    LinkChange { up: bool },
}

/// Size of the receive buffer for kernel event datagrams.
pub(crate) const EVENT_BUF_LEN: usize = 8192;
