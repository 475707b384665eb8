//! IPv4 header parsing and construction.

use crate::checksum::internet_checksum;
use std::net::Ipv4Addr;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

pub struct Ipv4Packet<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub ttl: u8,
    pub identification: u16,
    pub payload: &'a [u8],
}

impl<'a> Ipv4Packet<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < 20 {
            return None;
        }
        let version = data[0] >> 4;
        if version != 4 {
            return None;
        }
        let ihl = ((data[0] & 0x0f) as usize) * 4;
        if ihl < 20 || data.len() < ihl {
            return None;
        }
        let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if total_len > data.len() || total_len < ihl {
            return None;
        }
        Some(Self {
            src: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
            protocol: data[9],
            ttl: data[8],
            identification: u16::from_be_bytes([data[4], data[5]]),
            payload: &data[ihl..total_len],
        })
    }
}

/// Builds a minimal (no-options) IPv4 header followed by `payload`.
pub fn build_packet(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, identification: u16, ttl: u8, payload: &[u8]) -> Vec<u8> {
    let total_len = 20 + payload.len();
    let mut out = Vec::with_capacity(total_len);
    out.push(0x45);
    out.push(0);
    out.extend_from_slice(&(total_len as u16).to_be_bytes());
    out.extend_from_slice(&identification.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // flags/fragment offset
    out.push(ttl);
    out.push(protocol);
    out.extend_from_slice(&0u16.to_be_bytes()); // checksum placeholder
    out.extend_from_slice(&src.octets());
    out.extend_from_slice(&dst.octets());

    let checksum = internet_checksum(&out);
    out[10] = (checksum >> 8) as u8;
    out[11] = (checksum & 0xff) as u8;

    out.extend_from_slice(payload);
    out
}
