//! Netlink dialect of the kernel event source.
//!
//! One recv yields a buffer holding a sequence of nlmsghdr records. All
//! records are decoded by explicit byte offset in host byte order; a
//! malformed record drops the remainder of its datagram, never the socket.

use std::io;
use std::mem;
use std::net::Ipv6Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::libc;
use tracing::{debug, warn};

use super::{EVENT_BUF_LEN, KernelEvent};
use crate::addr;
use crate::error::{Error, Result};

/// rtnetlink(7) constants
const NETLINK_ROUTE: libc::c_int = 0;
const RTMGRP_LINK: u32 = 0x1;
const RTMGRP_IPV6_IFADDR: u32 = 0x100;
const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_NEWADDR: u16 = 20;
const RTM_DELADDR: u16 = 21;

/// ifaddrmsg attribute kinds carrying an address
const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;
const IFA_BROADCAST: u16 = 4;
const IFA_ANYCAST: u16 = 5;
const IFA_MULTICAST: u16 = 7;

/// Fixed header sizes from linux/netlink.h and linux/rtnetlink.h
const NLMSG_HDR_LEN: usize = 16;
const IFADDRMSG_LEN: usize = 8;
const IFINFOMSG_LEN: usize = 16;
const RTATTR_HDR_LEN: usize = 4;

/// NLMSG_ALIGNTO / RTA_ALIGNTO
const ALIGNTO: usize = 4;

fn nl_align(len: usize) -> usize {
    (len + ALIGNTO - 1) & !(ALIGNTO - 1)
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_ne_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Route-netlink socket bound to the LINK and IPV6_IFADDR groups, filtered
/// to one interface index.
pub struct KernelEventSource {
    fd: OwnedFd,
    ifindex: u32,
    buf: Vec<u8>,
}

impl KernelEventSource {
    pub fn open(_ifname: &str, ifindex: u32) -> Result<Self> {
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                NETLINK_ROUTE,
            )
        };
        if raw < 0 {
            return Err(Error::syscall("socket(AF_NETLINK)"));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut sa: libc::sockaddr_nl = unsafe { mem::zeroed() };
        sa.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        sa.nl_groups = RTMGRP_LINK | RTMGRP_IPV6_IFADDR;
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &sa as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(Error::syscall("bind(AF_NETLINK)"));
        }

        Ok(Self {
            fd,
            ifindex,
            buf: vec![0; EVENT_BUF_LEN],
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Drain one pending datagram into kernel events. Returns an empty list
    /// when nothing is queued.
    pub fn poll_events(&mut self) -> Result<Vec<KernelEvent>> {
        let len = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                self.buf.as_mut_ptr().cast(),
                self.buf.len(),
                0,
            )
        };
        if len < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(Vec::new());
            }
            return Err(Error::SystemCall {
                op: "recv(netlink)",
                source: err,
            });
        }

        Ok(parse_datagram(&self.buf[..len as usize], self.ifindex))
    }
}

/// Walk the nlmsghdr sequence of one datagram.
fn parse_datagram(data: &[u8], ifindex: u32) -> Vec<KernelEvent> {
    let mut events = Vec::new();
    let mut offset = 0;

    while offset + NLMSG_HDR_LEN <= data.len() {
        let msg_len = read_u32(data, offset) as usize;
        let msg_type = read_u16(data, offset + 4);
        if msg_len < NLMSG_HDR_LEN || offset + msg_len > data.len() {
            warn!(msg_len, "truncated netlink message, dropping datagram tail");
            break;
        }

        let payload = &data[offset + NLMSG_HDR_LEN..offset + msg_len];
        match msg_type {
            RTM_NEWADDR | RTM_DELADDR => {
                parse_addr_msg(payload, msg_type == RTM_NEWADDR, ifindex, &mut events);
            }
            RTM_NEWLINK | RTM_DELLINK => parse_link_msg(payload, ifindex, &mut events),
            other => debug!(msg_type = other, "ignoring netlink message"),
        }

        offset += nl_align(msg_len);
    }

    events
}

/// Decode RTM_NEWADDR / RTM_DELADDR: an ifaddrmsg followed by rtattrs.
fn parse_addr_msg(payload: &[u8], added: bool, ifindex: u32, events: &mut Vec<KernelEvent>) {
    if payload.len() < IFADDRMSG_LEN {
        warn!("short ifaddrmsg, dropping");
        return;
    }

    let family = payload[0] as libc::c_int;
    let prefix_len = payload[1];
    let index = read_u32(payload, 4);
    if index != ifindex || family != libc::AF_INET6 {
        return;
    }

    let mut off = IFADDRMSG_LEN;
    while off + RTATTR_HDR_LEN <= payload.len() {
        let rta_len = read_u16(payload, off) as usize;
        let rta_type = read_u16(payload, off + 2);
        if rta_len < RTATTR_HDR_LEN || off + rta_len > payload.len() {
            warn!(rta_len, "malformed address attribute, dropping message");
            return;
        }

        match rta_type {
            IFA_ADDRESS | IFA_LOCAL | IFA_BROADCAST | IFA_ANYCAST | IFA_MULTICAST => {
                let value = &payload[off + RTATTR_HDR_LEN..off + rta_len];
                if value.len() != 16 {
                    warn!(len = value.len(), "unexpected address attribute length");
                    return;
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(value);
                let address = Ipv6Addr::from(octets);

                // one event per message: RTM address messages describe a
                // single address even when several attribute kinds carry it
                events.push(match (addr::is_multicast(&address), added) {
                    (true, true) => KernelEvent::MAddrAdd { addr: address },
                    (true, false) => KernelEvent::MAddrDel { addr: address },
                    (false, true) => KernelEvent::AddrAdd {
                        addr: address,
                        prefix_len,
                    },
                    (false, false) => KernelEvent::AddrDel { addr: address },
                });
                return;
            }
            other => debug!(rta_type = other, "ignoring address attribute"),
        }

        off += nl_align(rta_len);
    }
}

/// Decode RTM_NEWLINK / RTM_DELLINK: an ifinfomsg, flags at offset 8.
fn parse_link_msg(payload: &[u8], ifindex: u32, events: &mut Vec<KernelEvent>) {
    if payload.len() < IFINFOMSG_LEN {
        warn!("short ifinfomsg, dropping");
        return;
    }

    let index = read_u32(payload, 4);
    if index != ifindex {
        return;
    }

    let flags = read_u32(payload, 8);
    events.push(KernelEvent::LinkChange {
        up: flags & libc::IFF_UP as u32 != 0,
    });
}
