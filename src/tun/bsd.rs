//! BSD tun driver: clonable /dev/tunN nodes (FreeBSD, NetBSD, and macOS
//! with the tuntaposx kext).
//!
//! The device node fixes the interface name, so a caller-supplied hint is
//! ignored. TUNSIFHEAD switches the descriptor to the 4-octet
//! address-family framing.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;

use nix::libc;
use tracing::debug;

use super::Framing;
use crate::error::{Error, Result};

const TUN_DEVICE: &str = "/dev/tun0";

/// ioctl request codes from net/if_tun.h (tun_ioctl.h for tuntaposx)
#[cfg(any(target_os = "freebsd", target_os = "netbsd"))]
const TUNSIFMODE: libc::c_ulong = 0x8004745e;
const TUNSIFHEAD: libc::c_ulong = 0x80047460;

pub(super) fn open(name_hint: Option<&str>) -> Result<(File, String, Framing)> {
    if let Some(hint) = name_hint {
        debug!(hint, "interface name hint ignored, device node names the interface");
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(TUN_DEVICE)
        .map_err(|err| Error::SystemCall {
            op: "open /dev/tun0",
            source: err,
        })?;

    #[cfg(any(target_os = "freebsd", target_os = "netbsd"))]
    {
        let mode: libc::c_int = libc::IFF_BROADCAST | libc::IFF_MULTICAST;
        if unsafe { libc::ioctl(file.as_raw_fd(), TUNSIFMODE as _, &mode) } < 0 {
            return Err(Error::syscall("ioctl(TUNSIFMODE)"));
        }
    }

    let head: libc::c_int = 1;
    if unsafe { libc::ioctl(file.as_raw_fd(), TUNSIFHEAD as _, &head) } < 0 {
        return Err(Error::syscall("ioctl(TUNSIFHEAD)"));
    }

    let name = TUN_DEVICE.rsplit('/').next().unwrap_or(TUN_DEVICE).to_string();
    Ok((file, name, Framing::AfPrefix))
}
