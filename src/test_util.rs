//! Shared mocks for exercising the reconciliation policy without a real
//! stack or CAP_NET_ADMIN.

use std::net::Ipv6Addr;

use crate::error::Result;
use crate::netcfg::KernelConfig;
use crate::stack::{Ip6Stack, StackError};

/// Recording stack double. Address tables behave like the real peer:
/// duplicate adds report `Already`, missing removals report `NotFound`.
pub struct MockStack {
    pub enabled: bool,
    pub unicast: Vec<(Ipv6Addr, u8)>,
    pub multicast: Vec<Ipv6Addr>,
    pub sent: Vec<Vec<u8>>,
    pub icmp_echo: bool,
    pub promiscuous: bool,
    pub reject_sends_with: Option<StackError>,
    pub add_unicast_calls: usize,
    pub remove_unicast_calls: usize,
    pub subscribe_calls: usize,
    pub unsubscribe_calls: usize,
}

impl MockStack {
    pub fn new() -> Self {
        Self {
            enabled: false,
            unicast: Vec::new(),
            multicast: Vec::new(),
            sent: Vec::new(),
            icmp_echo: true,
            promiscuous: false,
            reject_sends_with: None,
            add_unicast_calls: 0,
            remove_unicast_calls: 0,
            subscribe_calls: 0,
            unsubscribe_calls: 0,
        }
    }
}

impl Ip6Stack for MockStack {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) -> std::result::Result<(), StackError> {
        self.enabled = enabled;
        Ok(())
    }

    fn add_unicast(&mut self, addr: Ipv6Addr, prefix_len: u8) -> std::result::Result<(), StackError> {
        self.add_unicast_calls += 1;
        if self.unicast.iter().any(|(a, _)| *a == addr) {
            return Err(StackError::Already);
        }
        self.unicast.push((addr, prefix_len));
        Ok(())
    }

    fn remove_unicast(&mut self, addr: Ipv6Addr) -> std::result::Result<(), StackError> {
        self.remove_unicast_calls += 1;
        let before = self.unicast.len();
        self.unicast.retain(|(a, _)| *a != addr);
        if self.unicast.len() == before {
            return Err(StackError::NotFound);
        }
        Ok(())
    }

    fn subscribe_multicast(&mut self, addr: Ipv6Addr) -> std::result::Result<(), StackError> {
        self.subscribe_calls += 1;
        if self.multicast.contains(&addr) {
            return Err(StackError::Already);
        }
        self.multicast.push(addr);
        Ok(())
    }

    fn unsubscribe_multicast(&mut self, addr: Ipv6Addr) -> std::result::Result<(), StackError> {
        self.unsubscribe_calls += 1;
        let before = self.multicast.len();
        self.multicast.retain(|a| *a != addr);
        if self.multicast.len() == before {
            return Err(StackError::NotFound);
        }
        Ok(())
    }

    fn send(&mut self, datagram: Vec<u8>) -> std::result::Result<(), StackError> {
        if let Some(err) = self.reject_sends_with {
            return Err(err);
        }
        self.sent.push(datagram);
        Ok(())
    }

    fn set_icmp_echo_enabled(&mut self, enabled: bool) {
        self.icmp_echo = enabled;
    }

    fn set_multicast_promiscuous(&mut self, enabled: bool) {
        self.promiscuous = enabled;
    }
}

/// Recording kernel double; every operation succeeds.
pub struct MockKernel {
    pub unicast: Vec<(Ipv6Addr, u8)>,
    pub multicast: Vec<Ipv6Addr>,
    pub up: bool,
    pub set_link_calls: usize,
    pub del_unicast_calls: usize,
    pub destroyed: bool,
}

impl MockKernel {
    pub fn new() -> Self {
        Self {
            unicast: Vec::new(),
            multicast: Vec::new(),
            up: false,
            set_link_calls: 0,
            del_unicast_calls: 0,
            destroyed: false,
        }
    }
}

impl KernelConfig for MockKernel {
    fn add_unicast(&mut self, addr: Ipv6Addr, prefix_len: u8) -> Result<()> {
        if !self.unicast.iter().any(|(a, _)| *a == addr) {
            self.unicast.push((addr, prefix_len));
        }
        Ok(())
    }

    fn del_unicast(&mut self, addr: Ipv6Addr, _prefix_len: u8) -> Result<()> {
        self.del_unicast_calls += 1;
        self.unicast.retain(|(a, _)| *a != addr);
        Ok(())
    }

    fn join_multicast(&mut self, addr: Ipv6Addr) -> Result<()> {
        if !self.multicast.contains(&addr) {
            self.multicast.push(addr);
        }
        Ok(())
    }

    fn leave_multicast(&mut self, addr: Ipv6Addr) -> Result<()> {
        self.multicast.retain(|a| *a != addr);
        Ok(())
    }

    fn set_link(&mut self, up: bool) -> Result<()> {
        self.set_link_calls += 1;
        self.up = up;
        Ok(())
    }

    fn query_link(&mut self) -> Result<bool> {
        Ok(self.up)
    }

    fn destroy_tunnel(&mut self) -> Result<()> {
        self.destroyed = true;
        Ok(())
    }
}
