//! Linux TUN driver: /dev/net/tun with TUNSETIFF.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;

use nix::libc;
use tracing::debug;

use super::{Framing, name_from_buf};
use crate::error::{Error, Result};

const TUN_DEVICE: &str = "/dev/net/tun";

/// TUN device flags from linux/if_tun.h
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// ioctl request codes for TUNSETIFF / TUNSETLINK
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const TUNSETLINK: libc::c_ulong = 0x400454cd;

/// Link type for interfaces without hardware addressing (net/if_arp.h)
const ARPHRD_VOID: libc::c_ulong = 0xFFFF;

/// Name pattern handed to the kernel when the caller gives no hint; the
/// kernel substitutes the next free unit for `%d`.
const NAME_PATTERN: &str = "wpan%d";

/// ifreq structure for TUN device configuration
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22], // padding to match kernel struct size
}

pub(super) fn open(name_hint: Option<&str>) -> Result<(File, String, Framing)> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(TUN_DEVICE)
        .map_err(|err| Error::SystemCall {
            op: "open /dev/net/tun",
            source: err,
        })?;

    let mut ifr = IfReq {
        ifr_name: [0; libc::IFNAMSIZ],
        ifr_flags: IFF_TUN | IFF_NO_PI,
        _pad: [0; 22],
    };
    let requested = name_hint.unwrap_or(NAME_PATTERN);
    for (i, &b) in requested.as_bytes().iter().enumerate() {
        ifr.ifr_name[i] = b as libc::c_char;
    }

    // TUNSETIFF writes the resolved name back into ifr_name
    if unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut ifr) } < 0 {
        return Err(Error::syscall("ioctl(TUNSETIFF)"));
    }

    if unsafe { libc::ioctl(file.as_raw_fd(), TUNSETLINK as _, ARPHRD_VOID) } < 0 {
        return Err(Error::syscall("ioctl(TUNSETLINK)"));
    }

    let name = name_from_buf(&ifr.ifr_name);
    debug!(requested, name = %name, "tun interface configured");

    Ok((file, name, Framing::Bare))
}
