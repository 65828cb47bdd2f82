//! Bidirectional per-datagram copy between the tunnel and the stack.
//!
//! No queueing, no fragmentation: one read or write moves one datagram, and
//! the shuttle is lossy under pressure. The address-family framing some
//! platforms demand is stripped on the way in and prepended on the way out.

use std::io;

use nix::libc;
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::tun::{AF_PREFIX_LEN, Framing, MAX_IP6_LEN, TunDevice};

/// The 4-octet address-family header: two zero octets followed by AF_INET6
/// in network byte order.
pub(crate) fn af_header() -> [u8; AF_PREFIX_LEN] {
    let family = (libc::AF_INET6 as u16).to_be_bytes();
    [0, 0, family[0], family[1]]
}

/// Strip the address-family header from an inbound packet when the framing
/// uses one and the header announces AF_INET6.
pub(crate) fn strip_inbound(framing: Framing, packet: &[u8]) -> &[u8] {
    if framing == Framing::AfPrefix
        && packet.len() >= AF_PREFIX_LEN
        && packet[..AF_PREFIX_LEN] == af_header()
    {
        &packet[AF_PREFIX_LEN..]
    } else {
        packet
    }
}

/// Owns the tunnel descriptor and a reusable datagram buffer.
pub struct PacketShuttle {
    tun: TunDevice,
    buf: Vec<u8>,
}

impl PacketShuttle {
    pub fn new(tun: TunDevice) -> Self {
        Self {
            tun,
            buf: vec![0; MAX_IP6_LEN + AF_PREFIX_LEN],
        }
    }

    pub fn tun(&self) -> &TunDevice {
        &self.tun
    }

    pub fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.tun.as_raw_fd()
    }

    /// Write one stack-emitted datagram to the tunnel. Failures cost that
    /// packet only and are logged, never escalated.
    pub fn send(&mut self, datagram: &[u8]) {
        if datagram.len() > MAX_IP6_LEN {
            warn!(len = datagram.len(), "oversized outbound datagram dropped");
            return;
        }

        let len = match self.tun.framing() {
            Framing::Bare => {
                self.buf[..datagram.len()].copy_from_slice(datagram);
                datagram.len()
            }
            Framing::AfPrefix => {
                self.buf[..AF_PREFIX_LEN].copy_from_slice(&af_header());
                self.buf[AF_PREFIX_LEN..AF_PREFIX_LEN + datagram.len()].copy_from_slice(datagram);
                AF_PREFIX_LEN + datagram.len()
            }
        };

        match self.tun.write_packet(&self.buf[..len]) {
            Ok(written) if written == len => {
                trace!(len = datagram.len(), "datagram written to tunnel");
            }
            Ok(written) => {
                warn!(written, len, "short write to tunnel, packet dropped");
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                warn!(len, "tunnel write would block, packet dropped");
            }
            Err(err) => {
                warn!(error = %err, "tunnel write failed, packet dropped");
            }
        }
    }

    /// Read one datagram from the tunnel, framing stripped. `None` when no
    /// data is pending or the kernel handed us an empty read; read errors
    /// other than would-block are fatal to the bridge.
    pub fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        let len = match self.tun.read_packet(&mut self.buf) {
            Ok(0) => return Ok(None),
            Ok(len) => len,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(err) => {
                return Err(Error::SystemCall {
                    op: "read(tun)",
                    source: err,
                });
            }
        };

        let datagram = strip_inbound(self.tun.framing(), &self.buf[..len]).to_vec();
        trace!(len = datagram.len(), "datagram read from tunnel");
        Ok(Some(datagram))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_af_header_layout() {
        assert_eq!(af_header(), [0x00, 0x00, 0x00, libc::AF_INET6 as u8]);
    }

    #[test]
    fn test_strip_inbound_removes_matching_header() {
        let datagram = [0x60, 0x00, 0x00, 0x00, 0x00, 0x04];
        let mut framed = af_header().to_vec();
        framed.extend_from_slice(&datagram);

        assert_eq!(strip_inbound(Framing::AfPrefix, &framed), &datagram);
    }

    #[test]
    fn test_strip_inbound_keeps_bare_packet() {
        let datagram = [0x60, 0x00, 0x00, 0x00];
        assert_eq!(strip_inbound(Framing::Bare, &datagram), &datagram);
    }

    #[test]
    fn test_strip_inbound_keeps_unrecognized_header() {
        // header does not announce AF_INET6, so nothing is stripped
        let packet = [0x00, 0x00, 0x00, 0x02, 0x45, 0x00];
        assert_eq!(strip_inbound(Framing::AfPrefix, &packet), &packet);
    }

    #[test]
    fn test_strip_inbound_short_packet() {
        let packet = [0x00, 0x00];
        assert_eq!(strip_inbound(Framing::AfPrefix, &packet), &packet);
    }

    #[test]
    fn test_framed_write_is_header_plus_payload() {
        let datagram = [0x60, 0x0a, 0x0b, 0x0c];
        let mut expected = af_header().to_vec();
        expected.extend_from_slice(&datagram);

        let stripped = strip_inbound(Framing::AfPrefix, &expected);
        assert_eq!(stripped, &datagram);
        assert_eq!(&expected[..AF_PREFIX_LEN], af_header());
    }
}
