//! Reconciliation between the stack and the kernel interface.
//!
//! Stack callbacks are applied to the kernel, kernel events to the stack.
//! Every outgoing push records an echo suppressor entry so the reflected
//! notification is absorbed instead of bouncing back; the convergent stack
//! errors (`Already`, `NotFound`) are additionally treated as success, so a
//! missed suppression costs one redundant call and nothing else.

use std::net::Ipv6Addr;

use tracing::{debug, info, trace, warn};

use crate::addr;
use crate::monitor::KernelEvent;
use crate::netcfg::KernelConfig;
use crate::stack::{Ip6Stack, StackError, changed};
use crate::suppress::{EchoSuppressor, Op};

/// Owns the stack handle, the kernel configuration, and the policy tables.
pub struct Reconciler<S: Ip6Stack, C: KernelConfig> {
    stack: S,
    kernel: C,
    suppressor: EchoSuppressor,
}

impl<S: Ip6Stack, C: KernelConfig> Reconciler<S, C> {
    pub fn new(stack: S, kernel: C) -> Self {
        Self {
            stack,
            kernel,
            suppressor: EchoSuppressor::new(),
        }
    }

    pub fn stack(&self) -> &S {
        &self.stack
    }

    pub fn kernel_mut(&mut self) -> &mut C {
        &mut self.kernel
    }

    /// Stack adopted or dropped an address: mirror it into the kernel.
    ///
    /// Kernel-side failures are logged and absorbed; the next notification
    /// from either side converges the tables again.
    pub fn handle_address_change(&mut self, address: Ipv6Addr, prefix_len: u8, added: bool) {
        let result = if addr::is_multicast(&address) {
            if added {
                self.suppressor.record(Op::MulticastJoin, address);
                self.kernel.join_multicast(address)
            } else {
                self.suppressor.record(Op::MulticastLeave, address);
                self.kernel.leave_multicast(address)
            }
        } else if added {
            self.suppressor.record(Op::UnicastAdd, address);
            self.kernel.add_unicast(address, prefix_len)
        } else {
            self.suppressor.record(Op::UnicastDel, address);
            self.kernel.del_unicast(address, prefix_len)
        };

        if let Err(err) = result {
            warn!(addr = %address, added, error = %err, "failed to mirror address into kernel");
        }
    }

    /// Stack state notification: reconcile link state when the mask
    /// intersects the netif-state bit.
    pub fn handle_state_change(&mut self, flags: u32) {
        if flags & changed::NETIF_STATE == 0 {
            return;
        }
        self.reconcile_link();
    }

    fn reconcile_link(&mut self) {
        let enabled = self.stack.is_enabled();
        match self.kernel.query_link() {
            Ok(up) if up == enabled => {
                debug!(up = enabled, "interface state already set, ignoring");
            }
            Ok(_) => {
                info!(up = enabled, "changing interface state");
                if let Err(err) = self.kernel.set_link(enabled) {
                    warn!(up = enabled, error = %err, "failed to change interface state");
                }
            }
            Err(err) => warn!(error = %err, "failed to query interface flags"),
        }
    }

    /// Kernel event: mirror it into the stack, unless it is the echo of a
    /// push we made ourselves.
    pub fn handle_kernel_event(&mut self, event: KernelEvent) {
        match event {
            KernelEvent::AddrAdd { addr, prefix_len } => self.kernel_addr_added(addr, prefix_len),
            KernelEvent::AddrDel { addr } => self.kernel_addr_removed(addr),
            KernelEvent::MAddrAdd { addr } => self.kernel_maddr_added(addr),
            KernelEvent::MAddrDel { addr } => self.kernel_maddr_removed(addr),
            KernelEvent::LinkChange { up } => match self.stack.set_enabled(up) {
                Ok(()) => info!(up, "mirrored link state into stack"),
                Err(err) => warn!(up, error = %err, "failed to mirror link state"),
            },
        }
    }

    fn kernel_addr_added(&mut self, address: Ipv6Addr, prefix_len: u8) {
        if self.suppressor.consume(Op::UnicastAdd, &address) {
            debug!(addr = %address, "suppressed echo of unicast add");
            return;
        }

        if addr::is_link_local(&address) {
            // the stack chooses its own link-locals; evict addresses the
            // kernel autoconfigured behind our back
            info!(addr = %address, "removing kernel-added link-local address");
            self.suppressor.record(Op::UnicastDel, address);
            if let Err(err) = self.kernel.del_unicast(address, prefix_len) {
                warn!(addr = %address, error = %err, "failed to remove link-local address");
            }
            return;
        }

        match self.stack.add_unicast(address, prefix_len) {
            Ok(()) => info!(addr = %address, prefix_len, "imported external unicast address"),
            Err(StackError::Already) => {
                debug!(addr = %address, "unicast address already subscribed, ignored");
            }
            Err(err) => warn!(addr = %address, error = %err, "failed to import unicast address"),
        }
    }

    fn kernel_addr_removed(&mut self, address: Ipv6Addr) {
        if self.suppressor.consume(Op::UnicastDel, &address) {
            debug!(addr = %address, "suppressed echo of unicast delete");
            return;
        }

        match self.stack.remove_unicast(address) {
            Ok(()) => info!(addr = %address, "removed unicast address from stack"),
            Err(StackError::NotFound) => {
                debug!(addr = %address, "unicast address not found, ignored");
            }
            Err(err) => warn!(addr = %address, error = %err, "failed to remove unicast address"),
        }
    }

    fn kernel_maddr_added(&mut self, address: Ipv6Addr) {
        if self.suppressor.consume(Op::MulticastJoin, &address) {
            debug!(addr = %address, "suppressed echo of multicast join");
            return;
        }

        match self.stack.subscribe_multicast(address) {
            Ok(()) => info!(addr = %address, "subscribed multicast address"),
            Err(StackError::Already) => {
                debug!(addr = %address, "multicast address already subscribed, ignored");
            }
            Err(err) => {
                warn!(addr = %address, error = %err, "failed to subscribe multicast address");
            }
        }
    }

    fn kernel_maddr_removed(&mut self, address: Ipv6Addr) {
        if self.suppressor.consume(Op::MulticastLeave, &address) {
            debug!(addr = %address, "suppressed echo of multicast leave");
            return;
        }

        match self.stack.unsubscribe_multicast(address) {
            Ok(()) => info!(addr = %address, "unsubscribed multicast address"),
            Err(StackError::NotFound) => {
                debug!(addr = %address, "multicast address not found, ignored");
            }
            Err(err) => {
                warn!(addr = %address, error = %err, "failed to unsubscribe multicast address");
            }
        }
    }

    /// Hand one inbound datagram to the stack.
    pub fn deliver_inbound(&mut self, datagram: Vec<u8>) {
        let len = datagram.len();
        match self.stack.send(datagram) {
            Ok(()) => trace!(len, "datagram delivered to stack"),
            Err(StackError::NoBufs) => warn!(len, "stack out of buffers, packet dropped"),
            Err(err) => warn!(len, error = %err, "stack rejected datagram"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{MockKernel, MockStack};

    fn reconciler() -> Reconciler<MockStack, MockKernel> {
        Reconciler::new(MockStack::new(), MockKernel::new())
    }

    fn ip(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_stack_unicast_add_reaches_kernel_once() {
        let mut r = reconciler();

        // stack adopts 2001:db8::1/64
        r.handle_address_change(ip("2001:db8::1"), 64, true);
        assert_eq!(r.kernel.unicast, vec![(ip("2001:db8::1"), 64)]);

        // the kernel notification comes back and must not re-enter the stack
        r.handle_kernel_event(KernelEvent::AddrAdd {
            addr: ip("2001:db8::1"),
            prefix_len: 64,
        });
        assert!(r.stack.unicast.is_empty());
        assert_eq!(r.stack.add_unicast_calls, 0);
    }

    #[test]
    fn test_stack_multicast_join_suppressed_on_echo() {
        let mut r = reconciler();

        r.handle_address_change(ip("ff03::fc"), 128, true);
        assert_eq!(r.kernel.multicast, vec![ip("ff03::fc")]);

        r.handle_kernel_event(KernelEvent::MAddrAdd { addr: ip("ff03::fc") });
        assert_eq!(r.stack.subscribe_calls, 0);
    }

    #[test]
    fn test_external_unicast_add_imported() {
        let mut r = reconciler();

        r.handle_kernel_event(KernelEvent::AddrAdd {
            addr: ip("2001:db8::2"),
            prefix_len: 64,
        });
        assert_eq!(r.stack.unicast, vec![(ip("2001:db8::2"), 64)]);
        assert_eq!(r.stack.add_unicast_calls, 1);
    }

    #[test]
    fn test_external_unicast_del_mirrored() {
        let mut r = reconciler();
        r.stack.unicast.push((ip("2001:db8::2"), 64));

        r.handle_kernel_event(KernelEvent::AddrDel { addr: ip("2001:db8::2") });
        assert!(r.stack.unicast.is_empty());
    }

    #[test]
    fn test_kernel_link_local_evicted_not_imported() {
        let mut r = reconciler();

        r.handle_kernel_event(KernelEvent::AddrAdd {
            addr: ip("fe80::abcd"),
            prefix_len: 64,
        });

        // the kernel-side address is removed and the stack never learns it
        assert_eq!(r.kernel.del_unicast_calls, 1);
        assert!(r.stack.unicast.is_empty());
        assert_eq!(r.stack.add_unicast_calls, 0);

        // the delete's own echo is absorbed too
        r.handle_kernel_event(KernelEvent::AddrDel { addr: ip("fe80::abcd") });
        assert_eq!(r.stack.remove_unicast_calls, 0);
    }

    #[test]
    fn test_stack_link_local_add_is_kept() {
        let mut r = reconciler();

        // the stack itself chose this link-local, so the echo must not
        // trigger the eviction path
        r.handle_address_change(ip("fe80::1"), 64, true);
        r.handle_kernel_event(KernelEvent::AddrAdd {
            addr: ip("fe80::1"),
            prefix_len: 64,
        });

        assert_eq!(r.kernel.unicast, vec![(ip("fe80::1"), 64)]);
        assert_eq!(r.kernel.del_unicast_calls, 0);
    }

    #[test]
    fn test_mld_join_subscribes_stack() {
        let mut r = reconciler();

        r.handle_kernel_event(KernelEvent::MAddrAdd { addr: ip("ff03::abcd") });
        assert_eq!(r.stack.multicast, vec![ip("ff03::abcd")]);
    }

    #[test]
    fn test_already_subscribed_multicast_tolerated() {
        let mut r = reconciler();
        r.stack.multicast.push(ip("ff03::abcd"));

        r.handle_kernel_event(KernelEvent::MAddrAdd { addr: ip("ff03::abcd") });
        assert_eq!(r.stack.multicast, vec![ip("ff03::abcd")]);
    }

    #[test]
    fn test_link_convergence_is_idempotent() {
        let mut r = reconciler();
        r.stack.enabled = true;
        r.kernel.up = false;

        r.handle_state_change(changed::NETIF_STATE);
        assert!(r.kernel.up);
        assert_eq!(r.kernel.set_link_calls, 1);

        // same state again: no further flag mutation
        r.handle_state_change(changed::NETIF_STATE);
        assert_eq!(r.kernel.set_link_calls, 1);
    }

    #[test]
    fn test_state_change_requires_netif_bit() {
        let mut r = reconciler();
        r.stack.enabled = true;
        r.kernel.up = false;

        r.handle_state_change(0);
        r.handle_state_change(1 << 4);
        assert_eq!(r.kernel.set_link_calls, 0);
        assert!(!r.kernel.up);
    }

    #[test]
    fn test_kernel_link_change_mirrored_to_stack() {
        let mut r = reconciler();

        r.handle_kernel_event(KernelEvent::LinkChange { up: true });
        assert!(r.stack.enabled);

        r.handle_kernel_event(KernelEvent::LinkChange { up: false });
        assert!(!r.stack.enabled);
    }

    #[test]
    fn test_inbound_datagram_reaches_stack() {
        let mut r = reconciler();

        r.deliver_inbound(vec![0x60, 0x01, 0x02]);
        assert_eq!(r.stack.sent, vec![vec![0x60, 0x01, 0x02]]);
    }

    #[test]
    fn test_inbound_nobufs_drops_packet() {
        let mut r = reconciler();
        r.stack.reject_sends_with = Some(StackError::NoBufs);

        r.deliver_inbound(vec![0x60]);
        assert!(r.stack.sent.is_empty());
    }

    #[test]
    fn test_address_tables_converge_both_ways() {
        let mut r = reconciler();

        // stack-side operations
        r.handle_address_change(ip("2001:db8::1"), 64, true);
        r.handle_address_change(ip("ff03::1"), 128, true);
        // kernel-side operations by an external agent
        r.handle_kernel_event(KernelEvent::AddrAdd {
            addr: ip("2001:db8::2"),
            prefix_len: 64,
        });
        r.handle_kernel_event(KernelEvent::MAddrAdd { addr: ip("ff03::2") });
        // echoes of the stack-side pushes
        r.handle_kernel_event(KernelEvent::AddrAdd {
            addr: ip("2001:db8::1"),
            prefix_len: 64,
        });
        r.handle_kernel_event(KernelEvent::MAddrAdd { addr: ip("ff03::1") });

        assert_eq!(r.kernel.unicast, vec![(ip("2001:db8::1"), 64)]);
        assert_eq!(r.stack.unicast, vec![(ip("2001:db8::2"), 64)]);
        assert_eq!(r.kernel.multicast, vec![ip("ff03::1")]);
        assert_eq!(r.stack.multicast, vec![ip("ff03::2")]);
        // no echo ever re-entered the stack
        assert_eq!(r.stack.add_unicast_calls, 1);
        assert_eq!(r.stack.subscribe_calls, 1);
    }
}
