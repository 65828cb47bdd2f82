//! MLDv2 report monitor.
//!
//! Linux announces nothing about multicast membership on the netlink
//! routing groups, so the bridge listens on a raw ICMPv6 socket for the
//! MLDv2 reports the kernel itself sends on the tunnel, and synthesizes the
//! missing multicast events from them. Only reports sourced from one of the
//! tunnel's own addresses reflect local state; anything else on the wire is
//! a peer's report and is dropped.

use std::io;
use std::mem;
use std::net::Ipv6Addr;
use std::os::fd::{AsRawFd, RawFd};

use nix::libc;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use super::{EVENT_BUF_LEN, KernelEvent};
use crate::error::{Error, Result};

/// ff02::16, the all-MLDv2-routers group every report is addressed to.
const MLDV2_ROUTERS_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x16);

/// ICMPv6 type of an MLDv2 listener report (RFC 3810).
const MLDV2_REPORT_TYPE: u8 = 143;

/// Record types of interest: CHANGE_TO_EXCLUDE is a join, CHANGE_TO_INCLUDE
/// with an empty source list is a leave.
const RECORD_CHANGE_TO_EXCLUDE: u8 = 3;
const RECORD_CHANGE_TO_INCLUDE: u8 = 4;

/// Wire sizes: report header {type, rsv, checksum, rsv, num_records} and
/// record header {record_type, aux_len, num_sources, group}.
const REPORT_HDR_LEN: usize = 8;
const RECORD_HDR_LEN: usize = 20;

pub struct MldMonitor {
    sock: Socket,
    ifname: String,
    buf: Vec<u8>,
}

impl MldMonitor {
    /// Open the raw ICMPv6 socket, join the MLDv2 routers group on the
    /// tunnel, and pin the socket to the tunnel device.
    pub fn open(ifname: &str, ifindex: u32) -> Result<Self> {
        let sock = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6)).map_err(
            |err| Error::SystemCall {
                op: "socket(ICMPV6)",
                source: err,
            },
        )?;
        sock.set_nonblocking(true).map_err(|err| Error::SystemCall {
            op: "fcntl(O_NONBLOCK)",
            source: err,
        })?;
        sock.join_multicast_v6(&MLDV2_ROUTERS_GROUP, ifindex)
            .map_err(|err| Error::SystemCall {
                op: "setsockopt(IPV6_JOIN_GROUP)",
                source: err,
            })?;
        sock.bind_device(Some(ifname.as_bytes()))
            .map_err(|err| Error::SystemCall {
                op: "setsockopt(SO_BINDTODEVICE)",
                source: err,
            })?;

        Ok(Self {
            sock,
            ifname: ifname.to_string(),
            buf: vec![0; EVENT_BUF_LEN],
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    /// Drain one report into multicast events. Reports from peers and
    /// malformed reports yield an empty list.
    pub fn poll_events(&mut self) -> Result<Vec<KernelEvent>> {
        let mut src_storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut src_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let len = unsafe {
            libc::recvfrom(
                self.sock.as_raw_fd(),
                self.buf.as_mut_ptr().cast(),
                self.buf.len(),
                0,
                &mut src_storage as *mut _ as *mut libc::sockaddr,
                &mut src_len,
            )
        };
        if len < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(Vec::new());
            }
            return Err(Error::SystemCall {
                op: "recvfrom(mld)",
                source: err,
            });
        }

        if src_storage.ss_family != libc::AF_INET6 as libc::sa_family_t {
            return Ok(Vec::new());
        }
        let sin6 = unsafe { &*(&src_storage as *const _ as *const libc::sockaddr_in6) };
        let source = Ipv6Addr::from(sin6.sin6_addr.s6_addr);

        if !self.is_own_address(&source) {
            debug!(source = %source, "ignoring MLDv2 report from peer");
            return Ok(Vec::new());
        }

        Ok(parse_report(&self.buf[..len as usize]))
    }

    /// Whether `source` is currently plumbed on the tunnel interface.
    fn is_own_address(&self, source: &Ipv6Addr) -> bool {
        let ifaddrs = match nix::ifaddrs::getifaddrs() {
            Ok(ifaddrs) => ifaddrs,
            Err(err) => {
                warn!(error = %err, "getifaddrs failed, dropping MLDv2 report");
                return false;
            }
        };

        for ifaddr in ifaddrs {
            if ifaddr.interface_name != self.ifname {
                continue;
            }
            if let Some(storage) = ifaddr.address.as_ref()
                && let Some(sin6) = storage.as_sockaddr_in6()
                && sin6.ip() == *source
            {
                return true;
            }
        }
        false
    }
}

/// Decode the records of one MLDv2 report. Every field is network byte
/// order; records that overrun the datagram are dropped silently.
fn parse_report(data: &[u8]) -> Vec<KernelEvent> {
    let mut events = Vec::new();
    if data.len() < REPORT_HDR_LEN || data[0] != MLDV2_REPORT_TYPE {
        return events;
    }

    let num_records = u16::from_be_bytes([data[6], data[7]]) as usize;
    let mut offset = REPORT_HDR_LEN;

    for _ in 0..num_records {
        if offset + RECORD_HDR_LEN > data.len() {
            break;
        }

        let record_type = data[offset];
        let aux_len = data[offset + 1] as usize; // units of 32-bit words
        let num_sources = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&data[offset + 4..offset + RECORD_HDR_LEN]);
        let group = Ipv6Addr::from(octets);

        match record_type {
            RECORD_CHANGE_TO_EXCLUDE => events.push(KernelEvent::MAddrAdd { addr: group }),
            RECORD_CHANGE_TO_INCLUDE => events.push(KernelEvent::MAddrDel { addr: group }),
            other => debug!(record_type = other, "ignoring MLDv2 record"),
        }

        offset += RECORD_HDR_LEN + 16 * num_sources + 4 * aux_len;
    }

    events
}
