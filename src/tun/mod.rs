//! TUN device management.
//!
//! Opens the platform tunnel device and exposes a byte-oriented packet
//! handle plus the stable interface name and kernel index. Each platform
//! driver is a small shim that reports which framing convention its
//! descriptor speaks.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};

use nix::libc;
use tracing::info;

use crate::error::{Error, Result};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(any(
    target_os = "freebsd",
    target_os = "netbsd",
    all(target_os = "macos", not(feature = "utun"))
))]
mod bsd;
#[cfg(all(target_os = "macos", feature = "utun"))]
mod utun;

#[cfg(target_os = "linux")]
use linux as platform;
#[cfg(any(
    target_os = "freebsd",
    target_os = "netbsd",
    all(target_os = "macos", not(feature = "utun"))
))]
use bsd as platform;
#[cfg(all(target_os = "macos", feature = "utun"))]
use utun as platform;

/// Expected ceiling for one IPv6 datagram on the tunnel.
pub const MAX_IP6_LEN: usize = 1536;

/// Length of the address-family header on platforms that frame with one.
pub const AF_PREFIX_LEN: usize = 4;

/// Framing convention of the tunnel descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Reads and writes carry a bare IPv6 datagram.
    Bare,
    /// Each datagram is preceded by a 4-octet address-family header.
    AfPrefix,
}

/// An open tunnel interface.
///
/// The descriptor is non-blocking and close-on-exec; dropping the device
/// closes it. Name and index are fixed for the lifetime of the device.
pub struct TunDevice {
    file: File,
    name: String,
    index: u32,
    framing: Framing,
}

impl TunDevice {
    /// Open the platform tunnel, optionally requesting an interface name.
    ///
    /// The driver may substitute its own concrete name (on Linux a `%d`
    /// pattern is resolved by the kernel); the actual name and kernel index
    /// are published on the returned device.
    pub fn open(name_hint: Option<&str>) -> Result<Self> {
        if let Some(name) = name_hint
            && name.len() >= libc::IFNAMSIZ
        {
            return Err(Error::InvalidArgument(format!(
                "interface name `{name}` exceeds {} octets",
                libc::IFNAMSIZ - 1
            )));
        }

        let (file, name, framing) = platform::open(name_hint)?;

        let index = nix::net::if_::if_nametoindex(name.as_str()).map_err(|err| {
            Error::SystemCall {
                op: "if_nametoindex",
                source: err.into(),
            }
        })?;

        info!(name = %name, index, ?framing, "tunnel device opened");
        Ok(Self {
            file,
            name,
            index,
            framing,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Read one datagram (with framing header, where the platform uses one).
    pub fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    /// Write one datagram (with framing header, where the platform uses one).
    pub fn write_packet(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }
}

/// Turn a kernel-filled interface-name buffer into a `String`.
#[allow(dead_code)]
pub(crate) fn name_from_buf(raw: &[libc::c_char]) -> String {
    let bytes: Vec<u8> = raw
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_too_long_rejected() {
        let long = "an-interface-name-way-past-the-limit";
        let err = TunDevice::open(Some(long)).err().expect("open must fail");
        match err {
            Error::InvalidArgument(msg) => assert!(msg.contains(long)),
            other => panic!("expected InvalidArgument, got {other}"),
        }
    }

    #[test]
    fn test_name_from_buf_stops_at_nul() {
        let mut raw = [0 as libc::c_char; libc::IFNAMSIZ];
        for (i, b) in b"wpan0".iter().enumerate() {
            raw[i] = *b as libc::c_char;
        }
        assert_eq!(name_from_buf(&raw), "wpan0");
    }

    // Opening a real device requires CAP_NET_ADMIN; integration coverage
    // runs with appropriate privileges outside the unit suite.
}
