//! IPv6 address classification and prefix math.

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;

/// An address is multicast iff its first octet is 0xFF.
pub fn is_multicast(addr: &Ipv6Addr) -> bool {
    addr.octets()[0] == 0xFF
}

/// Link-local unicast: the first 10 bits are `1111 1110 10` (fe80::/10).
pub fn is_link_local(addr: &Ipv6Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 0xFE && (octets[1] & 0xC0) == 0x80
}

/// Link-local multicast: ff02::/16 scope.
pub fn is_multicast_link_local(addr: &Ipv6Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 0xFF && (octets[1] & 0x0F) == 0x02
}

/// Count of leading one bits in a netmask, e.g. ffff:ffff:: -> 32.
pub fn prefix_len_from_mask(mask: &Ipv6Addr) -> u8 {
    u128::from_be_bytes(mask.octets()).leading_ones() as u8
}

/// All-ones mask with the trailing `128 - prefix_len` bits cleared.
pub fn mask_from_prefix_len(prefix_len: u8) -> Ipv6Addr {
    match Ipv6Net::new(Ipv6Addr::UNSPECIFIED, prefix_len.min(128)) {
        Ok(net) => net.netmask(),
        Err(_) => Ipv6Addr::UNSPECIFIED,
    }
}

/// Zero the KAME embedded scope-id octets of link-local addresses so they
/// compare equal to their canonical form. Non-link-local addresses pass
/// through untouched.
pub fn clear_scope(addr: Ipv6Addr) -> Ipv6Addr {
    if !is_link_local(&addr) && !is_multicast_link_local(&addr) {
        return addr;
    }

    let mut octets = addr.octets();
    octets[2] = 0;
    octets[3] = 0;
    Ipv6Addr::from(octets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multicast_classification() {
        assert!(is_multicast(&"ff02::1".parse().unwrap()));
        assert!(is_multicast(&"ff03::abcd".parse().unwrap()));
        assert!(!is_multicast(&"fe80::1".parse().unwrap()));
        assert!(!is_multicast(&"2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_link_local_classification() {
        assert!(is_link_local(&"fe80::1".parse().unwrap()));
        assert!(is_link_local(&"febf::1".parse().unwrap()));
        assert!(!is_link_local(&"fec0::1".parse().unwrap()));
        assert!(!is_link_local(&"fe00::1".parse().unwrap()));
        assert!(!is_link_local(&"2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_multicast_link_local_classification() {
        assert!(is_multicast_link_local(&"ff02::16".parse().unwrap()));
        assert!(is_multicast_link_local(&"ff12::1".parse().unwrap()));
        assert!(!is_multicast_link_local(&"ff03::1".parse().unwrap()));
        assert!(!is_multicast_link_local(&"fe80::1".parse().unwrap()));
    }

    #[test]
    fn test_prefix_len_round_trips_for_every_length() {
        for len in 0..=128u8 {
            let mask = mask_from_prefix_len(len);
            assert_eq!(prefix_len_from_mask(&mask), len, "prefix length {len}");
        }
    }

    #[test]
    fn test_prefix_len_from_common_masks() {
        assert_eq!(prefix_len_from_mask(&"ffff:ffff:ffff:ffff::".parse().unwrap()), 64);
        assert_eq!(prefix_len_from_mask(&Ipv6Addr::UNSPECIFIED), 0);
        assert_eq!(
            prefix_len_from_mask(&"ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff".parse().unwrap()),
            128
        );
    }

    #[test]
    fn test_mask_from_prefix_len_clamps() {
        assert_eq!(mask_from_prefix_len(200), mask_from_prefix_len(128));
    }

    #[test]
    fn test_clear_scope_on_link_local() {
        let scoped: Ipv6Addr = "fe80:0:3::abcd".parse().unwrap();
        assert_eq!(clear_scope(scoped), "fe80::abcd".parse::<Ipv6Addr>().unwrap());

        let mcast: Ipv6Addr = "ff02:0:7::16".parse().unwrap();
        assert_eq!(clear_scope(mcast), "ff02::16".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn test_clear_scope_leaves_global_addresses() {
        let global: Ipv6Addr = "2001:db8:1:2::1".parse().unwrap();
        assert_eq!(clear_scope(global), global);
    }
}
