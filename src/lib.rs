//! Host network-interface bridge for a userspace IPv6 stack.
//!
//! Couples an in-process IPv6 stack to a kernel TUN device and keeps both
//! sides converged:
//! - Datagrams the stack emits are written to the TUN; datagrams the kernel
//!   routes into the TUN are handed back to the stack.
//! - Addresses the stack adopts are plumbed into the kernel interface;
//!   external address changes are mirrored into the stack.
//! - The stack's IPv6-enabled flag and the interface's UP flag track each
//!   other.
//!
//! The bridge owns no event loop. The embedding process registers the
//! bridge's descriptors via [`Netif::update_fd_set`] and dispatches readiness
//! with [`Netif::process`] from its own `select`-style multiplexer.

pub mod addr;
pub mod error;
pub mod fdset;
pub mod monitor;
pub mod netcfg;
pub mod netif;
pub mod reconciler;
pub mod shuttle;
pub mod stack;
pub mod suppress;
pub mod tun;

#[cfg(test)]
mod test_util;

pub use error::{Error, Result};
pub use fdset::FdSet;
pub use netif::{Netif, NetifConfig};
pub use stack::{Ip6Stack, StackError, StackEvent, StackEventSender};
