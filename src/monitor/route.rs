//! Routing-socket dialect of the kernel event source (macOS, FreeBSD,
//! NetBSD).
//!
//! The kernel delivers one routing message per recv. The trailing sockaddr
//! array is indexed by the `addrs` bitmask and walked with the platform's
//! sa_len roundup; RTAX_IFA carries the address and RTAX_NETMASK the prefix.
//! RTM_IFINFO does not trust the message flags and instead re-queries IFF_UP
//! through the control socket.

use std::io;
use std::net::Ipv6Addr;
use std::os::fd::{AsRawFd, RawFd};

use nix::libc;
use socket2::{Domain, Socket, Type};
use tracing::{debug, warn};

use super::{EVENT_BUF_LEN, KernelEvent};
use crate::addr;
use crate::error::{Error, Result};
use crate::netcfg::query_if_up;

/// net/route.h message types
const RTM_NEWADDR: u8 = 0x0c;
const RTM_DELADDR: u8 = 0x0d;
#[cfg(any(target_os = "macos", target_os = "freebsd"))]
const RTM_IFINFO: u8 = 0x0e;
#[cfg(target_os = "netbsd")]
const RTM_IFINFO: u8 = 0x14;
#[cfg(any(target_os = "macos", target_os = "freebsd"))]
const RTM_NEWMADDR: u8 = 0x0f;
#[cfg(any(target_os = "macos", target_os = "freebsd"))]
const RTM_DELMADDR: u8 = 0x10;

/// Indices into the sockaddr array (net/route.h)
const RTAX_NETMASK: usize = 2;
const RTAX_IFA: usize = 5;
const RTAX_MAX: usize = 8;

/// struct ifa_msghdr field offsets (net/if.h)
#[cfg(any(target_os = "macos", target_os = "freebsd"))]
const IFAM_ADDRS_OFF: usize = 4;
#[cfg(any(target_os = "macos", target_os = "freebsd"))]
const IFAM_INDEX_OFF: usize = 12;
#[cfg(any(target_os = "macos", target_os = "freebsd"))]
const IFAM_HDR_LEN: usize = 20;
#[cfg(target_os = "netbsd")]
const IFAM_ADDRS_OFF: usize = 8;
#[cfg(target_os = "netbsd")]
const IFAM_INDEX_OFF: usize = 4;
#[cfg(target_os = "netbsd")]
const IFAM_HDR_LEN: usize = 24;

/// struct ifma_msghdr field offsets
#[cfg(any(target_os = "macos", target_os = "freebsd"))]
const IFMAM_ADDRS_OFF: usize = 4;
#[cfg(any(target_os = "macos", target_os = "freebsd"))]
const IFMAM_INDEX_OFF: usize = 12;
#[cfg(any(target_os = "macos", target_os = "freebsd"))]
const IFMAM_HDR_LEN: usize = 16;

/// struct if_msghdr ifm_index offset
#[cfg(any(target_os = "macos", target_os = "freebsd"))]
const IFM_INDEX_OFF: usize = 12;
#[cfg(target_os = "netbsd")]
const IFM_INDEX_OFF: usize = 4;

/// sockaddr roundup unit in routing messages
#[cfg(any(target_os = "macos", target_os = "freebsd"))]
const SA_ALIGNTO: usize = 4;
#[cfg(target_os = "netbsd")]
const SA_ALIGNTO: usize = 8;

/// sin6_addr offset inside sockaddr_in6
const SIN6_ADDR_OFF: usize = 8;

fn sa_roundup(len: usize) -> usize {
    if len == 0 {
        SA_ALIGNTO
    } else {
        (len + SA_ALIGNTO - 1) & !(SA_ALIGNTO - 1)
    }
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_ne_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

enum Parsed {
    Event(KernelEvent),
    /// RTM_IFINFO for our interface: the caller re-queries IFF_UP.
    LinkPoll,
}

/// PF_ROUTE raw socket filtered to one interface index.
pub struct KernelEventSource {
    fd: Socket,
    /// Control socket for the RTM_IFINFO flags re-query.
    ip: Socket,
    name: String,
    ifindex: u32,
    buf: Vec<u8>,
}

impl KernelEventSource {
    pub fn open(ifname: &str, ifindex: u32) -> Result<Self> {
        let fd = Socket::new(Domain::from(libc::PF_ROUTE), Type::RAW, None).map_err(|err| {
            Error::SystemCall {
                op: "socket(PF_ROUTE)",
                source: err,
            }
        })?;
        fd.set_nonblocking(true).map_err(|err| Error::SystemCall {
            op: "fcntl(O_NONBLOCK)",
            source: err,
        })?;
        install_msg_filter(&fd);

        let ip = Socket::new(Domain::IPV6, Type::DGRAM, None).map_err(|err| Error::SystemCall {
            op: "socket(AF_INET6)",
            source: err,
        })?;

        Ok(Self {
            fd,
            ip,
            name: ifname.to_string(),
            ifindex,
            buf: vec![0; EVENT_BUF_LEN],
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Drain one routing message into kernel events.
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
                op: "recv(route)",
                source: err,
            });
        }

        let mut events = Vec::new();
        match parse_message(&self.buf[..len as usize], self.ifindex) {
            Some(Parsed::Event(event)) => events.push(event),
            Some(Parsed::LinkPoll) => match query_if_up(self.ip.as_raw_fd(), &self.name) {
                Ok(up) => events.push(KernelEvent::LinkChange { up }),
                Err(err) => warn!(error = %err, "failed to re-query interface flags"),
            },
            None => {}
        }
        Ok(events)
    }
}

/// Limit delivered message types where the kernel supports a filter; purely
/// an optimization, failures are logged and ignored.
#[cfg(target_os = "netbsd")]
fn install_msg_filter(fd: &Socket) {
    const RO_MSGFILTER: libc::c_int = 1;
    let filter: [u8; 3] = [RTM_IFINFO, RTM_NEWADDR, RTM_DELADDR];
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::PF_ROUTE,
            RO_MSGFILTER,
            filter.as_ptr().cast(),
            filter.len() as libc::socklen_t,
        )
    };
    if rc < 0 {
        warn!(error = %io::Error::last_os_error(), "routing message filter not installed");
    }
}

#[cfg(not(target_os = "netbsd"))]
fn install_msg_filter(_fd: &Socket) {}

fn parse_message(data: &[u8], ifindex: u32) -> Option<Parsed> {
    if data.len() < 4 {
        warn!(len = data.len(), "short routing message, dropping");
        return None;
    }
    let msg_len = read_u16(data, 0) as usize;
    let msg_type = data[3];
    if msg_len > data.len() {
        warn!(msg_len, "truncated routing message, dropping");
        return None;
    }
    let data = &data[..msg_len];

    match msg_type {
        RTM_NEWADDR | RTM_DELADDR => parse_addr_msg(
            data,
            msg_type == RTM_NEWADDR,
            IFAM_HDR_LEN,
            IFAM_ADDRS_OFF,
            IFAM_INDEX_OFF,
            ifindex,
        ),
        #[cfg(any(target_os = "macos", target_os = "freebsd"))]
        RTM_NEWMADDR | RTM_DELMADDR => parse_addr_msg(
            data,
            msg_type == RTM_NEWMADDR,
            IFMAM_HDR_LEN,
            IFMAM_ADDRS_OFF,
            IFMAM_INDEX_OFF,
            ifindex,
        ),
        RTM_IFINFO => {
            if data.len() < IFM_INDEX_OFF + 2
                || read_u16(data, IFM_INDEX_OFF) as u32 != ifindex
            {
                return None;
            }
            Some(Parsed::LinkPoll)
        }
        other => {
            debug!(msg_type = other, "ignoring routing message");
            None
        }
    }
}

/// Decode an address-carrying message by walking the sockaddr array.
fn parse_addr_msg(
    data: &[u8],
    added: bool,
    hdr_len: usize,
    addrs_off: usize,
    index_off: usize,
    ifindex: u32,
) -> Option<Parsed> {
    if data.len() < hdr_len {
        warn!(len = data.len(), "short address message, dropping");
        return None;
    }
    if read_u16(data, index_off) as u32 != ifindex {
        return None;
    }

    let addrs = read_u32(data, addrs_off);
    let mut cursor = hdr_len;
    let mut address: Option<Ipv6Addr> = None;
    let mut netmask: Option<Ipv6Addr> = None;

    for i in 0..RTAX_MAX {
        if addrs & (1 << i) == 0 {
            continue;
        }
        if cursor >= data.len() {
            warn!("sockaddr array overruns message, dropping");
            return None;
        }

        let sa_len = data[cursor] as usize;
        let sa_family = data.get(cursor + 1).copied().unwrap_or(0) as libc::c_int;
        if sa_family == libc::AF_INET6 && (i == RTAX_IFA || i == RTAX_NETMASK) {
            // netmask sockaddrs may be truncated to sa_len; missing trailing
            // octets are zero
            let mut octets = [0u8; 16];
            let avail = sa_len
                .saturating_sub(SIN6_ADDR_OFF)
                .min(16)
                .min(data.len().saturating_sub(cursor + SIN6_ADDR_OFF));
            octets[..avail]
                .copy_from_slice(&data[cursor + SIN6_ADDR_OFF..cursor + SIN6_ADDR_OFF + avail]);
            let parsed = Ipv6Addr::from(octets);
            if i == RTAX_IFA {
                address = Some(parsed);
            } else {
                netmask = Some(parsed);
            }
        }

        cursor += sa_roundup(sa_len);
    }

    let address = addr::clear_scope(address?);
    let event = match (addr::is_multicast(&address), added) {
        (true, true) => KernelEvent::MAddrAdd { addr: address },
        (true, false) => KernelEvent::MAddrDel { addr: address },
        (false, true) => KernelEvent::AddrAdd {
            addr: address,
            prefix_len: netmask
                .map(|mask| addr::prefix_len_from_mask(&mask))
                .unwrap_or(64),
        },
        (false, false) => KernelEvent::AddrDel { addr: address },
    };
    Some(Parsed::Event(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    const IFINDEX: u32 = 3;

    fn sockaddr_in6(address: &Ipv6Addr) -> Vec<u8> {
        let mut buf = vec![0u8; 28];
        buf[0] = 28;
        buf[1] = libc::AF_INET6 as u8;
        buf[SIN6_ADDR_OFF..SIN6_ADDR_OFF + 16].copy_from_slice(&address.octets());
        while buf.len() % SA_ALIGNTO != 0 {
            buf.push(0);
        }
        buf
    }

    fn addr_msg(msg_type: u8, index: u32, address: &Ipv6Addr, netmask: &Ipv6Addr) -> Vec<u8> {
        let mut buf = vec![0u8; IFAM_HDR_LEN];
        buf[2] = 5; // version
        buf[3] = msg_type;
        let addrs = ((1u32 << RTAX_IFA) | (1 << RTAX_NETMASK)).to_ne_bytes();
        buf[IFAM_ADDRS_OFF..IFAM_ADDRS_OFF + 4].copy_from_slice(&addrs);
        buf[IFAM_INDEX_OFF..IFAM_INDEX_OFF + 2]
            .copy_from_slice(&(index as u16).to_ne_bytes());
        // sockaddrs in index order: netmask before ifa
        buf.extend_from_slice(&sockaddr_in6(netmask));
        buf.extend_from_slice(&sockaddr_in6(address));
        let len = (buf.len() as u16).to_ne_bytes();
        buf[0..2].copy_from_slice(&len);
        buf
    }

    #[test]
    fn test_addr_add_with_prefix_from_netmask() {
        let address: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let mask: Ipv6Addr = "ffff:ffff:ffff:ffff::".parse().unwrap();
        let msg = addr_msg(RTM_NEWADDR, IFINDEX, &address, &mask);

        match parse_message(&msg, IFINDEX) {
            Some(Parsed::Event(KernelEvent::AddrAdd { addr, prefix_len })) => {
                assert_eq!(addr, address);
                assert_eq!(prefix_len, 64);
            }
            _ => panic!("expected AddrAdd"),
        }
    }

    #[test]
    fn test_link_local_scope_cleared() {
        let scoped: Ipv6Addr = "fe80:0:3::abcd".parse().unwrap();
        let mask: Ipv6Addr = "ffff:ffff:ffff:ffff::".parse().unwrap();
        let msg = addr_msg(RTM_DELADDR, IFINDEX, &scoped, &mask);

        match parse_message(&msg, IFINDEX) {
            Some(Parsed::Event(KernelEvent::AddrDel { addr })) => {
                assert_eq!(addr, "fe80::abcd".parse::<Ipv6Addr>().unwrap());
            }
            _ => panic!("expected AddrDel"),
        }
    }

    #[test]
    fn test_other_interface_filtered() {
        let address: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let mask: Ipv6Addr = "ffff:ffff:ffff:ffff::".parse().unwrap();
        let msg = addr_msg(RTM_NEWADDR, IFINDEX + 1, &address, &mask);

        assert!(parse_message(&msg, IFINDEX).is_none());
    }
}
