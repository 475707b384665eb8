//! ARP request/reply handling for the single guest-facing /30-ish subnet
//! the host synthesizes.

use crate::eth::MacAddr;
use std::net::Ipv4Addr;

const ARP_HTYPE_ETHERNET: u16 = 1;
const ARP_PTYPE_IPV4: u16 = 0x0800;
const ARP_OP_REQUEST: u16 = 1;
const ARP_OP_REPLY: u16 = 2;

pub struct ArpPacket {
    pub operation: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 28 {
            return None;
        }
        if u16::from_be_bytes([data[0], data[1]]) != ARP_HTYPE_ETHERNET
            || u16::from_be_bytes([data[2], data[3]]) != ARP_PTYPE_IPV4
            || data[4] != 6
            || data[5] != 4
        {
            return None;
        }
        Some(Self {
            operation: u16::from_be_bytes([data[6], data[7]]),
            sender_mac: MacAddr(data[8..14].try_into().ok()?),
            sender_ip: Ipv4Addr::new(data[14], data[15], data[16], data[17]),
            target_mac: MacAddr(data[18..24].try_into().ok()?),
            target_ip: Ipv4Addr::new(data[24], data[25], data[26], data[27]),
        })
    }

    pub fn is_request(&self) -> bool {
        self.operation == ARP_OP_REQUEST
    }
}

/// Builds an ARP reply asserting that `host_ip` lives at `host_mac`, in
/// response to a request from `requester`.
pub fn build_reply(host_mac: MacAddr, host_ip: Ipv4Addr, requester: &ArpPacket) -> Vec<u8> {
    let mut out = Vec::with_capacity(28);
    out.extend_from_slice(&ARP_HTYPE_ETHERNET.to_be_bytes());
    out.extend_from_slice(&ARP_PTYPE_IPV4.to_be_bytes());
    out.push(6);
    out.push(4);
    out.extend_from_slice(&ARP_OP_REPLY.to_be_bytes());
    out.extend_from_slice(&host_mac.0);
    out.extend_from_slice(&host_ip.octets());
    out.extend_from_slice(&requester.sender_mac.0);
    out.extend_from_slice(&requester.sender_ip.octets());
    out
}
