//! IP admission: blocks connections to internal/link-local/loopback ranges
//! unless the policy config explicitly disables that default.

use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::OnceLock;

fn internal_v4_ranges() -> &'static [IpNetwork] {
    static RANGES: OnceLock<Vec<IpNetwork>> = OnceLock::new();
    RANGES.get_or_init(|| {
        [
            "0.0.0.0/8",
            "10.0.0.0/8",
            "127.0.0.0/8",
            "169.254.0.0/16",
            "172.16.0.0/12",
            "192.168.0.0/16",
            "100.64.0.0/10",
            "255.0.0.0/8",
        ]
        .iter()
        .map(|s| s.parse().expect("static CIDR literal"))
        .collect()
    })
}

fn internal_v6_ranges() -> &'static [IpNetwork] {
    static RANGES: OnceLock<Vec<IpNetwork>> = OnceLock::new();
    RANGES.get_or_init(|| {
        ["::1/128", "fc00::/7", "fe80::/10"]
            .iter()
            .map(|s| s.parse().expect("static CIDR literal"))
            .collect()
    })
}

/// `true` if `addr` falls in a loopback, link-local, private or otherwise
/// non-routable range, per the fixed CIDR list above. IPv4-mapped IPv6
/// addresses (`::ffff:a.b.c.d`) are unwrapped and checked against the IPv4
/// list before the IPv6 list.
pub fn is_internal(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => internal_v4_ranges().iter().any(|net| net.contains(IpAddr::V4(v4))),
        IpAddr::V6(v6) => {
            if v6 == Ipv6Addr::UNSPECIFIED {
                return true;
            }
            if let Some(mapped) = to_ipv4_mapped(v6) {
                return is_internal(IpAddr::V4(mapped));
            }
            internal_v6_ranges().iter().any(|net| net.contains(IpAddr::V6(v6)))
        }
    }
}

fn to_ipv4_mapped(v6: Ipv6Addr) -> Option<std::net::Ipv4Addr> {
    let segments = v6.segments();
    if segments[0..5] == [0, 0, 0, 0, 0] && segments[5] == 0xffff {
        Some(std::net::Ipv4Addr::new(
            (segments[6] >> 8) as u8,
            (segments[6] & 0xff) as u8,
            (segments[7] >> 8) as u8,
            (segments[7] & 0xff) as u8,
        ))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_private_and_loopback() {
        assert!(is_internal("10.1.2.3".parse().unwrap()));
        assert!(is_internal("127.0.0.1".parse().unwrap()));
        assert!(is_internal("169.254.1.1".parse().unwrap()));
        assert!(is_internal("172.31.0.1".parse().unwrap()));
        assert!(is_internal("192.168.0.5".parse().unwrap()));
        assert!(is_internal("100.64.0.1".parse().unwrap()));
    }

    #[test]
    fn allows_public_v4() {
        assert!(!is_internal("93.184.216.34".parse().unwrap()));
        assert!(!is_internal("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn blocks_v6_loopback_and_ula_and_link_local() {
        assert!(is_internal("::1".parse().unwrap()));
        assert!(is_internal("fc00::1".parse().unwrap()));
        assert!(is_internal("fe80::1".parse().unwrap()));
    }

    #[test]
    fn unwraps_ipv4_mapped_ipv6() {
        assert!(is_internal("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!is_internal("::ffff:93.184.216.34".parse().unwrap()));
    }
}
