//! Kernel-side configuration of the tunnel interface.
//!
//! Address plumbing, multicast membership, and the UP flag are mutated
//! through a single AF_INET6 control socket. Every operation is idempotent
//! from the caller's point of view: the convergent errno kinds ("already
//! exists", "not found") are mapped to success so mirroring both directions
//! can race without failing.

use std::io;
use std::net::Ipv6Addr;
use std::os::fd::{AsRawFd, RawFd};

use nix::libc;
use socket2::{Domain, Socket, Type};
use tracing::{debug, info, warn};

use crate::addr;
use crate::error::{Error, Result};

/// Mutations and queries the reconciler issues against the kernel.
///
/// The trait is the seam for testing the reconciliation policy without
/// CAP_NET_ADMIN; [`KernelNetConfig`] is the real implementation.
pub trait KernelConfig {
    fn add_unicast(&mut self, addr: Ipv6Addr, prefix_len: u8) -> Result<()>;
    fn del_unicast(&mut self, addr: Ipv6Addr, prefix_len: u8) -> Result<()>;
    fn join_multicast(&mut self, addr: Ipv6Addr) -> Result<()>;
    fn leave_multicast(&mut self, addr: Ipv6Addr) -> Result<()>;
    fn set_link(&mut self, up: bool) -> Result<()>;
    fn query_link(&mut self) -> Result<bool>;
    /// Tear down the tunnel interface where the platform requires explicit
    /// destruction; a no-op elsewhere.
    fn destroy_tunnel(&mut self) -> Result<()>;
}

/// ifreq structure for interface-flags ioctls
#[repr(C)]
struct IfReqFlags {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; IFREQ_PAD], // padding to match kernel struct size
}

#[cfg(target_os = "linux")]
const IFREQ_PAD: usize = 22;
#[cfg(not(target_os = "linux"))]
const IFREQ_PAD: usize = 14;

fn ifreq_for(name: &str) -> IfReqFlags {
    let mut ifr = IfReqFlags {
        ifr_name: [0; libc::IFNAMSIZ],
        ifr_flags: 0,
        _pad: [0; IFREQ_PAD],
    };
    for (i, &b) in name.as_bytes().iter().take(libc::IFNAMSIZ - 1).enumerate() {
        ifr.ifr_name[i] = b as libc::c_char;
    }
    ifr
}

/// Read IFF_UP through an arbitrary socket. Shared with the routing-socket
/// monitor, which re-queries the flag on RTM_IFINFO.
pub(crate) fn query_if_up(fd: RawFd, name: &str) -> io::Result<bool> {
    let mut ifr = ifreq_for(name);
    if unsafe { libc::ioctl(fd, libc::SIOCGIFFLAGS as _, &mut ifr) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ifr.ifr_flags & libc::IFF_UP as libc::c_short != 0)
}

/// Linux address request from linux/ipv6.h
#[cfg(target_os = "linux")]
#[repr(C)]
struct In6Ifreq {
    ifr6_addr: [u8; 16],
    ifr6_prefixlen: u32,
    ifr6_ifindex: libc::c_int,
}

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd"))]
mod bsd {
    use std::mem;

    use super::*;

    /// _IOW encoding shared by the BSDs.
    pub(super) const fn iow(group: u8, num: u8, len: usize) -> libc::c_ulong {
        (0x8000_0000u32 | ((len as u32 & 0x1fff) << 16) | ((group as u32) << 8) | num as u32)
            as libc::c_ulong
    }

    pub(super) const ND6_INFINITE_LIFETIME: u32 = 0xffff_ffff;
    #[cfg(target_os = "macos")]
    pub(super) const IN6_IFF_NODAD: libc::c_int = 0x0020;

    #[repr(C)]
    pub(super) struct In6AddrLifetime {
        pub ia6t_expire: libc::time_t,
        pub ia6t_preferred: libc::time_t,
        pub ia6t_vltime: u32,
        pub ia6t_pltime: u32,
    }

    /// netinet6/in6_var.h
    #[repr(C)]
    pub(super) struct In6Aliasreq {
        pub ifra_name: [libc::c_char; libc::IFNAMSIZ],
        pub ifra_addr: libc::sockaddr_in6,
        pub ifra_dstaddr: libc::sockaddr_in6,
        pub ifra_prefixmask: libc::sockaddr_in6,
        pub ifra_flags: libc::c_int,
        pub ifra_lifetime: In6AddrLifetime,
        #[cfg(target_os = "freebsd")]
        pub ifra_vhid: libc::c_int,
    }

    /// netinet6/in6_var.h; the ifr_ifru union is dominated by the interface
    /// stats members (272 octets).
    #[repr(C)]
    pub(super) struct In6Ifreq {
        pub ifr_name: [libc::c_char; libc::IFNAMSIZ],
        pub ifru_addr: libc::sockaddr_in6,
        pub _pad: [u8; 272 - mem::size_of::<libc::sockaddr_in6>()],
    }

    pub(super) const SIOCAIFADDR_IN6: libc::c_ulong =
        iow(b'i', 26, mem::size_of::<In6Aliasreq>());
    pub(super) const SIOCDIFADDR_IN6: libc::c_ulong = iow(b'i', 25, mem::size_of::<In6Ifreq>());
    #[cfg(any(target_os = "freebsd", target_os = "netbsd"))]
    pub(super) const SIOCIFDESTROY: libc::c_ulong =
        iow(b'i', 121, mem::size_of::<super::IfReqFlags>());

    pub(super) fn sockaddr_for(addr: &Ipv6Addr) -> libc::sockaddr_in6 {
        let mut sa: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        sa.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
        sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        sa.sin6_addr.s6_addr = addr.octets();
        sa
    }
}

/// Kernel interface configuration bound to one tunnel.
pub struct KernelNetConfig {
    ip: Socket,
    name: String,
    index: u32,
}

impl KernelNetConfig {
    /// Open the AF_INET6 control socket for the named interface.
    pub fn new(name: &str, index: u32) -> Result<Self> {
        let ip = Socket::new(Domain::IPV6, Type::DGRAM, None).map_err(|err| Error::SystemCall {
            op: "socket(AF_INET6)",
            source: err,
        })?;
        ip.set_nonblocking(true).map_err(|err| Error::SystemCall {
            op: "fcntl(O_NONBLOCK)",
            source: err,
        })?;

        Ok(Self {
            ip,
            name: name.to_string(),
            index,
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.ip.as_raw_fd()
    }

    #[cfg(target_os = "linux")]
    fn update_unicast(&self, addr: Ipv6Addr, prefix_len: u8, add: bool) -> io::Result<()> {
        let ifr6 = In6Ifreq {
            ifr6_addr: addr.octets(),
            ifr6_prefixlen: prefix_len as u32,
            ifr6_ifindex: self.index as libc::c_int,
        };
        let request = if add {
            libc::SIOCSIFADDR
        } else {
            libc::SIOCDIFADDR
        };
        if unsafe { libc::ioctl(self.ip.as_raw_fd(), request as _, &ifr6) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd"))]
    fn update_unicast(&self, addr: Ipv6Addr, prefix_len: u8, add: bool) -> io::Result<()> {
        let rc = if add {
            let mut ifra: bsd::In6Aliasreq = unsafe { std::mem::zeroed() };
            for (i, &b) in self.name.as_bytes().iter().take(libc::IFNAMSIZ - 1).enumerate() {
                ifra.ifra_name[i] = b as libc::c_char;
            }
            ifra.ifra_addr = bsd::sockaddr_for(&addr);
            ifra.ifra_prefixmask = bsd::sockaddr_for(&addr::mask_from_prefix_len(prefix_len));
            // the stack owns address uniqueness and lifetime
            ifra.ifra_lifetime.ia6t_vltime = bsd::ND6_INFINITE_LIFETIME;
            ifra.ifra_lifetime.ia6t_pltime = bsd::ND6_INFINITE_LIFETIME;
            #[cfg(target_os = "macos")]
            {
                ifra.ifra_lifetime.ia6t_expire = bsd::ND6_INFINITE_LIFETIME as libc::time_t;
                ifra.ifra_lifetime.ia6t_preferred = bsd::ND6_INFINITE_LIFETIME as libc::time_t;
                ifra.ifra_flags |= bsd::IN6_IFF_NODAD;
            }
            unsafe { libc::ioctl(self.ip.as_raw_fd(), bsd::SIOCAIFADDR_IN6 as _, &ifra) }
        } else {
            let mut ifr6: bsd::In6Ifreq = unsafe { std::mem::zeroed() };
            for (i, &b) in self.name.as_bytes().iter().take(libc::IFNAMSIZ - 1).enumerate() {
                ifr6.ifr_name[i] = b as libc::c_char;
            }
            ifr6.ifru_addr = bsd::sockaddr_for(&addr);
            unsafe { libc::ioctl(self.ip.as_raw_fd(), bsd::SIOCDIFADDR_IN6 as _, &ifr6) }
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl KernelConfig for KernelNetConfig {
    fn add_unicast(&mut self, addr: Ipv6Addr, prefix_len: u8) -> Result<()> {
        match self.update_unicast(addr, prefix_len, true) {
            Ok(()) => {
                info!(addr = %addr, prefix_len, "added unicast address");
                Ok(())
            }
            Err(err)
                if matches!(err.raw_os_error(), Some(libc::EEXIST) | Some(libc::EALREADY)) =>
            {
                debug!(addr = %addr, "unicast address already plumbed");
                Ok(())
            }
            Err(err) => Err(Error::SystemCall {
                op: "ioctl(add address)",
                source: err,
            }),
        }
    }

    fn del_unicast(&mut self, addr: Ipv6Addr, prefix_len: u8) -> Result<()> {
        // the kernel matches deletions on address and prefix length both
        match self.update_unicast(addr, prefix_len, false) {
            Ok(()) => {
                info!(addr = %addr, "removed unicast address");
                Ok(())
            }
            Err(err)
                if matches!(
                    err.raw_os_error(),
                    Some(libc::EADDRNOTAVAIL) | Some(libc::ENOENT)
                ) =>
            {
                debug!(addr = %addr, "unicast address already absent");
                Ok(())
            }
            Err(err) => Err(Error::SystemCall {
                op: "ioctl(del address)",
                source: err,
            }),
        }
    }

    fn join_multicast(&mut self, addr: Ipv6Addr) -> Result<()> {
        match self.ip.join_multicast_v6(&addr, self.index) {
            Ok(()) => {
                info!(addr = %addr, "joined multicast group");
                Ok(())
            }
            Err(err) if err.raw_os_error() == Some(libc::EADDRINUSE) => {
                debug!(addr = %addr, "multicast group already joined");
                Ok(())
            }
            Err(err)
                if err.raw_os_error() == Some(libc::EINVAL)
                    && addr::is_multicast_link_local(&addr) =>
            {
                // first join of a link-local group can race interface
                // bring-up on some kernels
                warn!(addr = %addr, "ignoring EINVAL joining link-local group");
                Ok(())
            }
            Err(err) => Err(Error::SystemCall {
                op: "setsockopt(IPV6_JOIN_GROUP)",
                source: err,
            }),
        }
    }

    fn leave_multicast(&mut self, addr: Ipv6Addr) -> Result<()> {
        match self.ip.leave_multicast_v6(&addr, self.index) {
            Ok(()) => {
                info!(addr = %addr, "left multicast group");
                Ok(())
            }
            Err(err)
                if matches!(
                    err.raw_os_error(),
                    Some(libc::EADDRNOTAVAIL) | Some(libc::ENOENT)
                ) =>
            {
                debug!(addr = %addr, "multicast group already absent");
                Ok(())
            }
            Err(err)
                if err.raw_os_error() == Some(libc::EINVAL)
                    && addr::is_multicast_link_local(&addr) =>
            {
                warn!(addr = %addr, "ignoring EINVAL leaving link-local group");
                Ok(())
            }
            Err(err) => Err(Error::SystemCall {
                op: "setsockopt(IPV6_LEAVE_GROUP)",
                source: err,
            }),
        }
    }

    fn set_link(&mut self, up: bool) -> Result<()> {
        let mut ifr = ifreq_for(&self.name);
        if unsafe { libc::ioctl(self.ip.as_raw_fd(), libc::SIOCGIFFLAGS as _, &mut ifr) } < 0 {
            return Err(Error::syscall("ioctl(SIOCGIFFLAGS)"));
        }

        let flag = libc::IFF_UP as libc::c_short;
        let is_up = ifr.ifr_flags & flag != 0;
        if is_up == up {
            debug!(up, "link already in requested state");
            return Ok(());
        }

        if up {
            ifr.ifr_flags |= flag;
        } else {
            ifr.ifr_flags &= !flag;
        }
        if unsafe { libc::ioctl(self.ip.as_raw_fd(), libc::SIOCSIFFLAGS as _, &ifr) } < 0 {
            return Err(Error::syscall("ioctl(SIOCSIFFLAGS)"));
        }

        info!(name = %self.name, up, "changed interface state");
        Ok(())
    }

    fn query_link(&mut self) -> Result<bool> {
        query_if_up(self.ip.as_raw_fd(), &self.name).map_err(|err| Error::SystemCall {
            op: "ioctl(SIOCGIFFLAGS)",
            source: err,
        })
    }

    fn destroy_tunnel(&mut self) -> Result<()> {
        #[cfg(any(target_os = "freebsd", target_os = "netbsd"))]
        {
            let ifr = ifreq_for(&self.name);
            if unsafe { libc::ioctl(self.ip.as_raw_fd(), bsd::SIOCIFDESTROY as _, &ifr) } < 0 {
                return Err(Error::syscall("ioctl(SIOCIFDESTROY)"));
            }
            info!(name = %self.name, "destroyed tunnel interface");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::mem;

    use super::*;

    #[test]
    fn test_ifreq_name_is_nul_terminated() {
        let ifr = ifreq_for("wpan0");
        assert_eq!(ifr.ifr_name[4], b'0' as libc::c_char);
        assert_eq!(ifr.ifr_name[5], 0);
    }

    #[test]
    fn test_ifreq_matches_kernel_size() {
        // struct ifreq is IFNAMSIZ + the ifr_ifru union
        assert_eq!(mem::size_of::<IfReqFlags>(), mem::size_of::<libc::ifreq>());
    }

    // Address and flag mutations need CAP_NET_ADMIN; the reconciliation
    // policy is covered against the KernelConfig mock instead.
}
