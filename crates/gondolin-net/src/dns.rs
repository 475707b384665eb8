//! A DNS stub resolver that never itself performs a real lookup.
//!
//! Every A-record query is answered immediately with a synthetic address
//! drawn from a private pool, and the hostname is remembered against that
//! address for the lifetime of the VM session. The *real* resolution
//! happens later, lazily, at TCP-connect time against the synthetic
//! address — never here. That ordering is the whole point: a DNS response
//! can never itself smuggle a guest connection to an internal address,
//! because the address handed back here is always one the host minted,
//! and admission is (re-)checked against the name's real resolution right
//! before the TCP handshake to the upstream begins.

use dashmap::DashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};

const QTYPE_A: u16 = 1;
const QCLASS_IN: u16 = 1;
const FLAG_QR_RESPONSE: u16 = 0x8000;
const FLAG_RA: u16 = 0x0080;
const FLAG_RD: u16 = 0x0100;

pub struct DnsQuery {
    pub id: u16,
    pub name: String,
    pub qtype: u16,
}

impl DnsQuery {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 12 {
            return None;
        }
        let id = u16::from_be_bytes([data[0], data[1]]);
        let qdcount = u16::from_be_bytes([data[4], data[5]]);
        if qdcount == 0 {
            return None;
        }
        let (name, mut pos) = parse_name(data, 12)?;
        if pos + 4 > data.len() {
            return None;
        }
        let qtype = u16::from_be_bytes([data[pos], data[pos + 1]]);
        pos += 4; // qtype + qclass
        let _ = pos;
        Some(Self { id, name, qtype })
    }
}

/// Reads a (possibly compressed) DNS name starting at `offset`, returning
/// the dotted name and the offset just past it in the *original* message
/// (i.e. past the two-byte pointer, not the jump target).
fn parse_name(data: &[u8], offset: usize) -> Option<(String, usize)> {
    let mut labels = Vec::new();
    let mut cursor = offset;
    let mut jumped = false;
    let mut return_pos = offset;
    let mut hops = 0;

    loop {
        hops += 1;
        if hops > 128 {
            return None; // compression loop guard
        }
        let len = *data.get(cursor)?;
        if len == 0 {
            if !jumped {
                return_pos = cursor + 1;
            }
            break;
        }
        if len & 0xc0 == 0xc0 {
            let next = *data.get(cursor + 1)? as usize;
            let pointer = (((len & 0x3f) as usize) << 8) | next;
            if !jumped {
                return_pos = cursor + 2;
                jumped = true;
            }
            cursor = pointer;
            continue;
        }
        let len = len as usize;
        let start = cursor + 1;
        let label = data.get(start..start + len)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        cursor = start + len;
    }

    Some((labels.join("."), return_pos))
}

/// Builds an A-record response for `query`, pointing `name` at
/// `synthetic_ip`. TTL is kept short (the guest is expected to re-query
/// rather than cache across a session boundary).
pub fn build_a_response(query: &DnsQuery, synthetic_ip: Ipv4Addr) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&query.id.to_be_bytes());
    out.extend_from_slice(&(FLAG_QR_RESPONSE | FLAG_RD | FLAG_RA).to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    out.extend_from_slice(&1u16.to_be_bytes()); // ancount
    out.extend_from_slice(&0u16.to_be_bytes()); // nscount
    out.extend_from_slice(&0u16.to_be_bytes()); // arcount

    write_name(&mut out, &query.name);
    out.extend_from_slice(&QTYPE_A.to_be_bytes());
    out.extend_from_slice(&QCLASS_IN.to_be_bytes());

    // answer record, using a compression pointer back to the question name
    out.extend_from_slice(&0xc00cu16.to_be_bytes());
    out.extend_from_slice(&QTYPE_A.to_be_bytes());
    out.extend_from_slice(&QCLASS_IN.to_be_bytes());
    out.extend_from_slice(&30u32.to_be_bytes()); // ttl
    out.extend_from_slice(&4u16.to_be_bytes()); // rdlength
    out.extend_from_slice(&synthetic_ip.octets());
    out
}

/// Builds a NXDOMAIN response, used when the host denies the name outright
/// (e.g. it matches a denylisted host) rather than handing back a
/// synthetic address that will only be rejected later.
pub fn build_nxdomain(query: &DnsQuery) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&query.id.to_be_bytes());
    out.extend_from_slice(&(FLAG_QR_RESPONSE | FLAG_RD | FLAG_RA | 0x0003).to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    write_name(&mut out, &query.name);
    out.extend_from_slice(&query.qtype.to_be_bytes());
    out.extend_from_slice(&QCLASS_IN.to_be_bytes());
    out
}

fn write_name(out: &mut Vec<u8>, name: &str) {
    for label in name.split('.') {
        if label.is_empty() {
            continue;
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
}

/// Allocates and remembers synthetic IPv4 addresses for hostnames, for the
/// lifetime of the VM session. There is deliberately no eviction: an
/// address must keep meaning the same hostname for as long as the guest
/// might still hold a cached DNS answer, a stale connection, or a renewed
/// TLS session pointing at it.
pub struct NameBindingTable {
    forward: DashMap<String, Ipv4Addr>,
    reverse: DashMap<Ipv4Addr, String>,
    next_host_octet: AtomicU32,
    base: Ipv4Addr,
}

impl NameBindingTable {
    /// `base` should be a /16 (or larger) private block reserved for
    /// synthetic addresses and never routed by the host.
    pub fn new(base: Ipv4Addr) -> Self {
        Self {
            forward: DashMap::new(),
            reverse: DashMap::new(),
            next_host_octet: AtomicU32::new(1),
            base,
        }
    }

    /// Returns the existing synthetic address for `hostname`, or allocates
    /// a fresh one.
    pub fn resolve(&self, hostname: &str) -> Ipv4Addr {
        if let Some(existing) = self.forward.get(hostname) {
            return *existing;
        }
        let offset = self.next_host_octet.fetch_add(1, Ordering::Relaxed);
        let base_bits = u32::from_be_bytes(self.base.octets()) & 0xffff_0000;
        let addr = Ipv4Addr::from(base_bits | (offset & 0x0000_ffff));
        self.forward.insert(hostname.to_string(), addr);
        self.reverse.insert(addr, hostname.to_string());
        addr
    }

    /// The real hostname a synthetic address was minted for, if any.
    /// Looked up at TCP-connect time to perform the deferred real
    /// resolution and the admission checks that depend on it.
    pub fn hostname_for(&self, synthetic_ip: Ipv4Addr) -> Option<String> {
        self.reverse.get(&synthetic_ip).map(|r| r.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_query(name: &str) -> Vec<u8> {
        let mut out = vec![0u8; 12];
        out[0..2].copy_from_slice(&0x1234u16.to_be_bytes());
        out[4..6].copy_from_slice(&1u16.to_be_bytes());
        write_name(&mut out, name);
        out.extend_from_slice(&QTYPE_A.to_be_bytes());
        out.extend_from_slice(&QCLASS_IN.to_be_bytes());
        out
    }

    #[test]
    fn parses_simple_query() {
        let raw = build_query("example.com");
        let query = DnsQuery::parse(&raw).unwrap();
        assert_eq!(query.id, 0x1234);
        assert_eq!(query.name, "example.com");
        assert_eq!(query.qtype, QTYPE_A);
    }

    #[test]
    fn parses_name_with_compression_pointer() {
        let mut raw = build_query("example.com");
        // Append a second question that points back at the first name.
        raw.extend_from_slice(&[0xc0, 12]);
        raw.extend_from_slice(&QTYPE_A.to_be_bytes());
        raw.extend_from_slice(&QCLASS_IN.to_be_bytes());
        let (name, _) = parse_name(&raw, raw.len() - 8).unwrap();
        assert_eq!(name, "example.com");
    }

    #[test]
    fn compression_loop_is_rejected_not_infinite() {
        // A pointer that points at itself must not hang the parser.
        let mut raw = vec![0u8; 12];
        raw.extend_from_slice(&[0xc0, 12]);
        assert!(parse_name(&raw, 12).is_none());
    }

    #[test]
    fn same_hostname_always_gets_same_synthetic_ip() {
        let table = NameBindingTable::new(Ipv4Addr::new(240, 0, 0, 0));
        let a = table.resolve("example.com");
        let b = table.resolve("example.com");
        assert_eq!(a, b);
        let c = table.resolve("other.example.com");
        assert_ne!(a, c);
    }

    #[test]
    fn hostname_for_looks_up_synthetic_binding() {
        let table = NameBindingTable::new(Ipv4Addr::new(240, 0, 0, 0));
        let ip = table.resolve("example.com");
        assert_eq!(table.hostname_for(ip).as_deref(), Some("example.com"));
        assert_eq!(table.hostname_for(Ipv4Addr::new(1, 2, 3, 4)), None);
    }

    #[test]
    fn a_response_contains_synthetic_ip() {
        let raw = build_query("example.com");
        let query = DnsQuery::parse(&raw).unwrap();
        let resp = build_a_response(&query, Ipv4Addr::new(240, 0, 0, 1));
        assert!(resp.windows(4).any(|w| w == [240, 0, 0, 1]));
    }
}
