//! UDP header parsing/construction and demultiplexing to DHCP (67/68) and
//! DNS (53).

use crate::checksum::transport_checksum;
use std::net::Ipv4Addr;

pub const PORT_DHCP_SERVER: u16 = 67;
pub const PORT_DHCP_CLIENT: u16 = 68;
pub const PORT_DNS: u16 = 53;

pub struct UdpDatagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

impl<'a> UdpDatagram<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        let len = u16::from_be_bytes([data[4], data[5]]) as usize;
        if len < 8 || len > data.len() {
            return None;
        }
        Some(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            payload: &data[8..len],
        })
    }
}

pub fn build_datagram(src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let len = 8 + payload.len();
    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(&src_port.to_be_bytes());
    out.extend_from_slice(&dst_port.to_be_bytes());
    out.extend_from_slice(&(len as u16).to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(payload);

    let checksum = transport_checksum(src, dst, 17, &out);
    // UDP checksum of exactly zero is transmitted as all-ones.
    let checksum = if checksum == 0 { 0xffff } else { checksum };
    out[6] = (checksum >> 8) as u8;
    out[7] = (checksum & 0xff) as u8;
    out
}

/// Which host-side service a UDP datagram destined for the host should be
/// routed to.
pub enum UdpTarget {
    Dhcp,
    Dns,
    Unhandled,
}

pub fn classify_target(dst_port: u16) -> UdpTarget {
    match dst_port {
        PORT_DHCP_SERVER => UdpTarget::Dhcp,
        PORT_DNS => UdpTarget::Dns,
        _ => UdpTarget::Unhandled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_then_parse_round_trips() {
        let dgram = build_datagram(Ipv4Addr::new(10, 0, 2, 2), Ipv4Addr::new(10, 0, 2, 15), 53, 5353, b"hello");
        let parsed = UdpDatagram::parse(&dgram).unwrap();
        assert_eq!(parsed.src_port, 53);
        assert_eq!(parsed.dst_port, 5353);
        assert_eq!(parsed.payload, b"hello");
    }

    #[test]
    fn classifies_well_known_ports() {
        assert!(matches!(classify_target(PORT_DHCP_SERVER), UdpTarget::Dhcp));
        assert!(matches!(classify_target(PORT_DNS), UdpTarget::Dns));
        assert!(matches!(classify_target(9999), UdpTarget::Unhandled));
    }
}
