//! A single-client DHCPv4 server: the guest is the only host on the
//! synthetic subnet, so there is no lease table, only a fixed assignment
//! handed out on every DISCOVER/REQUEST.

use crate::eth::MacAddr;
use std::net::Ipv4Addr;

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;
const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS_SERVERS: u8 = 6;
const OPT_HOSTNAME: u8 = 12;
const OPT_BROADCAST_ADDR: u8 = 28;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_RENEWAL_T1: u8 = 58;
const OPT_REBINDING_T2: u8 = 59;
const OPT_END: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Ack = 5,
    Nak = 6,
}

pub struct DhcpMessage {
    pub xid: u32,
    pub client_mac: MacAddr,
    pub message_type: MessageType,
    pub hostname: Option<String>,
}

impl DhcpMessage {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 240 || data[0] != BOOTREQUEST {
            return None;
        }
        let xid = u32::from_be_bytes(data[4..8].try_into().ok()?);
        let client_mac = MacAddr(data[28..34].try_into().ok()?);
        if data[236..240] != MAGIC_COOKIE {
            return None;
        }

        let mut message_type = None;
        let mut hostname = None;
        let mut cursor = 240;
        while cursor < data.len() {
            let opt = data[cursor];
            if opt == OPT_END {
                break;
            }
            if opt == 0 {
                cursor += 1;
                continue;
            }
            if cursor + 1 >= data.len() {
                break;
            }
            let len = data[cursor + 1] as usize;
            let value_start = cursor + 2;
            if value_start + len > data.len() {
                break;
            }
            let value = &data[value_start..value_start + len];
            match opt {
                OPT_MESSAGE_TYPE if !value.is_empty() => {
                    message_type = match value[0] {
                        1 => Some(MessageType::Discover),
                        3 => Some(MessageType::Request),
                        _ => None,
                    };
                }
                OPT_HOSTNAME => hostname = Some(String::from_utf8_lossy(value).into_owned()),
                _ => {}
            }
            cursor = value_start + len;
        }

        Some(Self {
            xid,
            client_mac,
            message_type: message_type?,
            hostname,
        })
    }
}

/// Fixed lease parameters for the single synthetic guest subnet.
pub struct LeaseConfig {
    pub client_ip: Ipv4Addr,
    pub server_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub router: Ipv4Addr,
    pub dns_servers: Vec<Ipv4Addr>,
    pub broadcast: Ipv4Addr,
    pub lease_seconds: u32,
}

impl LeaseConfig {
    fn build_reply(&self, xid: u32, client_mac: MacAddr, msg_type: MessageType) -> Vec<u8> {
        let mut out = vec![0u8; 240];
        out[0] = BOOTREPLY;
        out[1] = 1; // htype ethernet
        out[2] = 6; // hlen
        out[4..8].copy_from_slice(&xid.to_be_bytes());
        out[16..20].copy_from_slice(&self.client_ip.octets()); // yiaddr
        out[20..24].copy_from_slice(&self.server_ip.octets()); // siaddr
        out[28..34].copy_from_slice(&client_mac.0);
        out[236..240].copy_from_slice(&MAGIC_COOKIE);

        push_option(&mut out, OPT_MESSAGE_TYPE, &[msg_type as u8]);
        push_option(&mut out, OPT_SERVER_ID, &self.server_ip.octets());
        push_option(&mut out, OPT_LEASE_TIME, &self.lease_seconds.to_be_bytes());
        push_option(&mut out, OPT_RENEWAL_T1, &(self.lease_seconds / 2).to_be_bytes());
        push_option(&mut out, OPT_REBINDING_T2, &(self.lease_seconds * 7 / 8).to_be_bytes());
        push_option(&mut out, OPT_SUBNET_MASK, &self.subnet_mask.octets());
        push_option(&mut out, OPT_ROUTER, &self.router.octets());
        push_option(&mut out, OPT_BROADCAST_ADDR, &self.broadcast.octets());

        let mut dns_bytes = Vec::with_capacity(self.dns_servers.len() * 4);
        for dns in &self.dns_servers {
            dns_bytes.extend_from_slice(&dns.octets());
        }
        if !dns_bytes.is_empty() {
            push_option(&mut out, OPT_DNS_SERVERS, &dns_bytes);
        }

        out.push(OPT_END);
        out
    }

    /// Answers a DISCOVER with an OFFER, or a REQUEST with an ACK. NAK is
    /// never produced: this server only ever serves one client and always
    /// has the lease to give.
    pub fn respond(&self, msg: &DhcpMessage) -> Vec<u8> {
        let reply_type = match msg.message_type {
            MessageType::Discover => MessageType::Offer,
            MessageType::Request => MessageType::Ack,
            _ => MessageType::Ack,
        };
        self.build_reply(msg.xid, msg.client_mac, reply_type)
    }
}

fn push_option(out: &mut Vec<u8>, code: u8, value: &[u8]) {
    out.push(code);
    out.push(value.len() as u8);
    out.extend_from_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> LeaseConfig {
        LeaseConfig {
            client_ip: Ipv4Addr::new(10, 0, 2, 15),
            server_ip: Ipv4Addr::new(10, 0, 2, 2),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            router: Ipv4Addr::new(10, 0, 2, 2),
            dns_servers: vec![Ipv4Addr::new(10, 0, 2, 3)],
            broadcast: Ipv4Addr::new(10, 0, 2, 255),
            lease_seconds: 86400,
        }
    }

    fn sample_discover() -> Vec<u8> {
        let mut out = vec![0u8; 240];
        out[0] = BOOTREQUEST;
        out[4..8].copy_from_slice(&0xdeadbeefu32.to_be_bytes());
        out[28..34].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        out[236..240].copy_from_slice(&MAGIC_COOKIE);
        out.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, 1]);
        out.push(OPT_END);
        out
    }

    #[test]
    fn parses_discover_message_type() {
        let msg = DhcpMessage::parse(&sample_discover()).unwrap();
        assert_eq!(msg.message_type, MessageType::Discover);
        assert_eq!(msg.xid, 0xdeadbeef);
    }

    #[test]
    fn offer_carries_required_options() {
        let msg = DhcpMessage::parse(&sample_discover()).unwrap();
        let config = sample_config();
        let offer = config.respond(&msg);
        assert!(offer.contains(&OPT_MESSAGE_TYPE));
        assert_eq!(&offer[16..20], &config.client_ip.octets());
        assert!(offer.contains(&OPT_SUBNET_MASK));
        assert!(offer.contains(&OPT_ROUTER));
        assert!(offer.contains(&OPT_DNS_SERVERS));
        assert!(offer.contains(&OPT_LEASE_TIME));
    }

    #[test]
    fn request_yields_ack_with_same_xid() {
        let mut request_bytes = sample_discover();
        let type_pos = request_bytes.len() - 2;
        request_bytes[type_pos] = 3; // DHCPREQUEST
        let msg = DhcpMessage::parse(&request_bytes).unwrap();
        assert_eq!(msg.message_type, MessageType::Request);

        let config = sample_config();
        let ack = config.respond(&msg);
        assert_eq!(&ack[4..8], &0xdeadbeefu32.to_be_bytes());
    }
}
