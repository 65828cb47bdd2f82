//! macOS utun driver: a control socket under PF_SYSTEM/SYSPROTO_CONTROL.
//!
//! The in-kernel utun driver needs no extension but marks its interfaces
//! IFF_POINTTOPOINT, which breaks mDNS on the interface; the tuntaposx
//! driver in `bsd.rs` is the default for that reason.

use std::fs::File;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd};

use nix::libc;
use tracing::debug;

use super::{Framing, name_from_buf};
use crate::error::{Error, Result};

const UTUN_CONTROL_NAME: &[u8] = b"com.apple.net.utun_control";
const UTUN_OPT_IFNAME: libc::c_int = 2;

/// CTLIOCGINFO from sys/kern_control.h
const CTLIOCGINFO: libc::c_ulong = 0xc0644e03;
const AF_SYS_CONTROL: u16 = 2;

#[repr(C)]
struct CtlInfo {
    ctl_id: u32,
    ctl_name: [libc::c_char; 96],
}

#[repr(C)]
struct SockaddrCtl {
    sc_len: u8,
    sc_family: u8,
    ss_sysaddr: u16,
    sc_id: u32,
    sc_unit: u32,
    sc_reserved: [u32; 5],
}

pub(super) fn open(name_hint: Option<&str>) -> Result<(File, String, Framing)> {
    if let Some(hint) = name_hint {
        debug!(hint, "interface name hint ignored, kernel assigns utun unit");
    }

    let fd = unsafe { libc::socket(libc::PF_SYSTEM, libc::SOCK_DGRAM, libc::SYSPROTO_CONTROL) };
    if fd < 0 {
        return Err(Error::syscall("socket(PF_SYSTEM)"));
    }
    let file = unsafe { File::from_raw_fd(fd) };

    if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETFL, libc::O_NONBLOCK) } < 0 {
        return Err(Error::syscall("fcntl(O_NONBLOCK)"));
    }
    if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(Error::syscall("fcntl(FD_CLOEXEC)"));
    }

    let mut info = CtlInfo {
        ctl_id: 0,
        ctl_name: [0; 96],
    };
    for (i, &b) in UTUN_CONTROL_NAME.iter().enumerate() {
        info.ctl_name[i] = b as libc::c_char;
    }
    if unsafe { libc::ioctl(file.as_raw_fd(), CTLIOCGINFO as _, &mut info) } < 0 {
        return Err(Error::syscall("ioctl(CTLIOCGINFO)"));
    }

    let addr = SockaddrCtl {
        sc_len: mem::size_of::<SockaddrCtl>() as u8,
        sc_family: libc::AF_SYSTEM as u8,
        ss_sysaddr: AF_SYS_CONTROL,
        sc_id: info.ctl_id,
        sc_unit: 0, // kernel picks the next free utun unit
        sc_reserved: [0; 5],
    };
    let rc = unsafe {
        libc::connect(
            file.as_raw_fd(),
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<SockaddrCtl>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(Error::syscall("connect(utun)"));
    }

    let mut name_buf = [0 as libc::c_char; libc::IFNAMSIZ];
    let mut name_len = name_buf.len() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            file.as_raw_fd(),
            libc::SYSPROTO_CONTROL,
            UTUN_OPT_IFNAME,
            name_buf.as_mut_ptr().cast(),
            &mut name_len,
        )
    };
    if rc < 0 {
        return Err(Error::syscall("getsockopt(UTUN_OPT_IFNAME)"));
    }

    let name = name_from_buf(&name_buf);
    Ok((file, name, Framing::AfPrefix))
}
