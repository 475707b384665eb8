//! Ties the link/network/transport layers together: one [`NetworkStack`]
//! per VM, fed raw Ethernet frames from the virtio-net-like backend and
//! producing frames to send back.
//!
//! The stack itself never terminates a TCP connection's application data —
//! it classifies each new stream and emits a [`StackEvent::NewStream`] for
//! the HTTP or TLS layer above to drive. This mirrors how a guest's own
//! kernel hands a completed three-way handshake to `accept()`: the stack's
//! job ends at "here is an established byte stream", not "here is a
//! decoded HTTP request".

use crate::arp::{self, ArpPacket};
use crate::classify::{self, Classification};
use crate::dhcp::{DhcpMessage, LeaseConfig};
use crate::dns::{DnsQuery, NameBindingTable};
use crate::eth::{self, EthernetFrame, MacAddr, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use crate::icmp::{self, EchoRequest};
use crate::ipv4::{self, Ipv4Packet, PROTO_ICMP, PROTO_TCP, PROTO_UDP};
use crate::tcp::{TcpConnection, TcpFlags, TcpSegment};
use crate::udp::{self, UdpDatagram, UdpTarget};
use gondolin_common::flow::FlowKey;
use gondolin_common::metrics::SessionMetrics;
use gondolin_policy::PolicyEngine;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Events the stack hands up to the session orchestrator. `NewStream` is
/// emitted once, right after the handshake completes; `StreamClassified`
/// once flow classification has a verdict; `StreamData` for every
/// in-order byte delivered after that point; `StreamClosed` when the
/// connection tears down.
pub enum StackEvent {
    NewStream { flow: FlowKey, hostname: Option<String> },
    StreamClassified { flow: FlowKey, classification: Classification },
    StreamData { flow: FlowKey, bytes: Vec<u8> },
    StreamClosed { flow: FlowKey },
}

pub struct StackConfig {
    pub host_mac: MacAddr,
    pub guest_mac: MacAddr,
    pub host_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub dns_servers: Vec<Ipv4Addr>,
    pub synthetic_base: Ipv4Addr,
}

pub struct NetworkStack {
    config: StackConfig,
    lease: LeaseConfig,
    names: Arc<NameBindingTable>,
    tcp_conns: HashMap<FlowKey, TcpConnection>,
    classify_buffers: HashMap<FlowKey, Vec<u8>>,
    classified: HashMap<FlowKey, Classification>,
    ip_ident: u16,
    metrics: Arc<SessionMetrics>,
    policy: Arc<PolicyEngine>,
}

impl NetworkStack {
    pub fn new(config: StackConfig, metrics: Arc<SessionMetrics>, policy: Arc<PolicyEngine>) -> Self {
        let lease = LeaseConfig {
            client_ip: config.guest_ip,
            server_ip: config.host_ip,
            subnet_mask: config.subnet_mask,
            router: config.host_ip,
            dns_servers: vec![config.host_ip],
            broadcast: broadcast_of(config.guest_ip, config.subnet_mask),
            lease_seconds: 86400,
        };
        let names = Arc::new(NameBindingTable::new(config.synthetic_base));
        Self {
            config,
            lease,
            names,
            tcp_conns: HashMap::new(),
            classify_buffers: HashMap::new(),
            classified: HashMap::new(),
            ip_ident: 1,
            metrics,
            policy,
        }
    }

    pub fn name_bindings(&self) -> Arc<NameBindingTable> {
        self.names.clone()
    }

    /// Queues `data` for delivery to the guest on an established flow,
    /// returning the frame(s) to send. Used by the HTTP/TLS layer above to
    /// relay an upstream response (or TLS record) back down the stack.
    pub fn send_stream_data(&mut self, flow: FlowKey, data: &[u8]) -> Vec<Vec<u8>> {
        let (guest_ip, synthetic_ip) = match flow_v4_addrs(&flow) {
            Some(addrs) => addrs,
            None => return Vec::new(),
        };
        let Some(conn) = self.tcp_conns.get_mut(&flow) else {
            return Vec::new();
        };
        let mut seg = conn.send_data(data);
        patch_ports(&mut seg, flow.dst_port, flow.src_port);
        vec![self.wrap_ipv4(synthetic_ip, guest_ip, PROTO_TCP, &seg)]
    }

    /// Host-initiated close of a flow (e.g. the upstream connection ended,
    /// or policy aborted the request). Drives `Established`/`CloseWait`
    /// into the FIN sequence and returns the frame(s) to send.
    pub fn close_stream(&mut self, flow: FlowKey) -> Vec<Vec<u8>> {
        let (guest_ip, synthetic_ip) = match flow_v4_addrs(&flow) {
            Some(addrs) => addrs,
            None => return Vec::new(),
        };
        let Some(conn) = self.tcp_conns.get_mut(&flow) else {
            return Vec::new();
        };
        let mut seg = match conn.state {
            gondolin_common::flow::TcpState::CloseWait => conn.close_from_close_wait(),
            gondolin_common::flow::TcpState::Established => conn.initiate_close(),
            _ => return Vec::new(),
        };
        patch_ports(&mut seg, flow.dst_port, flow.src_port);
        vec![self.wrap_ipv4(synthetic_ip, guest_ip, PROTO_TCP, &seg)]
    }

    /// Processes one inbound Ethernet frame from the guest, returning any
    /// frames to write back plus any events for the layer above.
    pub fn on_guest_frame(&mut self, frame: &[u8]) -> (Vec<Vec<u8>>, Vec<StackEvent>) {
        self.metrics.frames_in.incr();
        let mut out = Vec::new();
        let mut events = Vec::new();

        let Some(eth) = EthernetFrame::parse(frame) else {
            self.metrics.frames_dropped_malformed.incr();
            return (out, events);
        };

        match eth.ethertype {
            ETHERTYPE_ARP => {
                if let Some(pkt) = ArpPacket::parse(eth.payload) {
                    if pkt.is_request() && pkt.target_ip == self.config.host_ip {
                        let reply = arp::build_reply(self.config.host_mac, self.config.host_ip, &pkt);
                        out.push(eth::build_frame(eth.src, self.config.host_mac, ETHERTYPE_ARP, &reply));
                    }
                } else {
                    self.metrics.frames_dropped_malformed.incr();
                }
            }
            ETHERTYPE_IPV4 => {
                if let Some(ip) = Ipv4Packet::parse(eth.payload) {
                    self.handle_ipv4(&ip, &mut out, &mut events);
                } else {
                    self.metrics.frames_dropped_malformed.incr();
                }
            }
            _ => {}
        }

        self.metrics.frames_out.add(out.len() as u64);
        (out, events)
    }

    fn handle_ipv4(&mut self, ip: &Ipv4Packet<'_>, out: &mut Vec<Vec<u8>>, events: &mut Vec<StackEvent>) {
        match ip.protocol {
            PROTO_ICMP => {
                if let Some(req) = EchoRequest::parse(ip.payload) {
                    let reply = icmp::build_echo_reply(&req);
                    out.push(self.wrap_ipv4(ip.dst, ip.src, PROTO_ICMP, &reply));
                }
            }
            PROTO_UDP => self.handle_udp(ip, out),
            PROTO_TCP => self.handle_tcp(ip, out, events),
            _ => {}
        }
    }

    fn handle_udp(&mut self, ip: &Ipv4Packet<'_>, out: &mut Vec<Vec<u8>>) {
        let Some(dgram) = UdpDatagram::parse(ip.payload) else {
            self.metrics.frames_dropped_malformed.incr();
            return;
        };
        match udp::classify_target(dgram.dst_port) {
            UdpTarget::Dhcp => {
                if let Some(msg) = DhcpMessage::parse(dgram.payload) {
                    let reply = self.lease.respond(&msg);
                    let udp_reply = udp::build_datagram(ip.dst, Ipv4Addr::BROADCAST, udp::PORT_DHCP_SERVER, udp::PORT_DHCP_CLIENT, &reply);
                    out.push(self.wrap_ipv4(ip.dst, Ipv4Addr::BROADCAST, PROTO_UDP, &udp_reply));
                }
            }
            UdpTarget::Dns => {
                self.metrics.dns_queries.incr();
                if let Some(query) = DnsQuery::parse(dgram.payload) {
                    // A name the policy wouldn't admit a connection to is
                    // never even worth minting a synthetic address for:
                    // answer NXDOMAIN so it's never bound, and so never
                    // reusable once the name is blocked.
                    let resp = if self.policy.is_host_allowed(&query.name) {
                        let synthetic = self.names.resolve(&query.name);
                        crate::dns::build_a_response(&query, synthetic)
                    } else {
                        self.metrics.dns_queries_blocked.incr();
                        crate::dns::build_nxdomain(&query)
                    };
                    let udp_reply = udp::build_datagram(ip.dst, ip.src, udp::PORT_DNS, dgram.src_port, &resp);
                    out.push(self.wrap_ipv4(ip.dst, ip.src, PROTO_UDP, &udp_reply));
                }
            }
            UdpTarget::Unhandled => {}
        }
    }

    fn handle_tcp(&mut self, ip: &Ipv4Packet<'_>, out: &mut Vec<Vec<u8>>, events: &mut Vec<StackEvent>) {
        let Some(seg) = TcpSegment::parse(ip.payload) else {
            self.metrics.frames_dropped_malformed.incr();
            return;
        };
        let flow = FlowKey::from_v4(ip.src, ip.dst, seg.src_port, seg.dst_port, PROTO_TCP);

        if seg.has(TcpFlags::SYN) && !seg.has(TcpFlags::ACK) {
            let mut conn = TcpConnection::new_listener();
            let mut synack = conn.on_syn(&seg);
            patch_ports(&mut synack, seg.dst_port, seg.src_port);
            self.tcp_conns.insert(flow, conn);
            self.metrics.flows_opened.incr();
            out.push(self.wrap_ipv4(ip.dst, ip.src, PROTO_TCP, &synack));
            return;
        }

        let Some(conn) = self.tcp_conns.get_mut(&flow) else {
            return;
        };

        if seg.has(TcpFlags::RST) {
            self.tcp_conns.remove(&flow);
            self.classify_buffers.remove(&flow);
            self.classified.remove(&flow);
            events.push(StackEvent::StreamClosed { flow });
            return;
        }

        if conn.state == gondolin_common::flow::TcpState::SynReceived {
            conn.on_handshake_ack(&seg);
            let hostname = self.names.hostname_for(ip.dst);
            events.push(StackEvent::NewStream { flow, hostname });
            return;
        }

        if seg.has(TcpFlags::FIN) {
            let mut ack = conn.on_fin(&seg);
            patch_ports(&mut ack, seg.dst_port, seg.src_port);
            let conn_state = conn.state;
            out.push(self.wrap_ipv4(ip.dst, ip.src, PROTO_TCP, &ack));
            if conn_state == gondolin_common::flow::TcpState::TimeWait {
                self.classify_buffers.remove(&flow);
                self.classified.remove(&flow);
                events.push(StackEvent::StreamClosed { flow });
            }
            return;
        }

        if let Some(bytes) = conn.on_data(&seg) {
            self.deliver_stream_bytes(flow, &bytes, ip, &seg, out, events);
        }
    }

    /// Routes newly in-order bytes through flow classification (once,
    /// sticky for the connection's lifetime) before handing them up as
    /// [`StackEvent::StreamData`]. Anything that classifies as neither
    /// HTTP nor TLS is reset rather than forwarded blind.
    fn deliver_stream_bytes(
        &mut self,
        flow: FlowKey,
        payload: &[u8],
        ip: &Ipv4Packet<'_>,
        seg: &TcpSegment<'_>,
        out: &mut Vec<Vec<u8>>,
        events: &mut Vec<StackEvent>,
    ) {
        if self.classified.contains_key(&flow) {
            events.push(StackEvent::StreamData { flow, bytes: payload.to_vec() });
            return;
        }

        let buf = self.classify_buffers.entry(flow).or_default();
        buf.extend_from_slice(payload);

        match classify::classify(buf) {
            Classification::NeedMoreData => {}
            Classification::Unrecognized => {
                self.classify_buffers.remove(&flow);
                if let Some(conn) = self.tcp_conns.remove(&flow) {
                    let mut rst = crate::tcp::build_segment(0, 0, conn.snd_nxt, conn.rcv_nxt, TcpFlags::RST | TcpFlags::ACK, 0, &[]);
                    patch_ports(&mut rst, seg.dst_port, seg.src_port);
                    out.push(self.wrap_ipv4(ip.dst, ip.src, PROTO_TCP, &rst));
                }
                events.push(StackEvent::StreamClosed { flow });
            }
            verdict => {
                self.classified.insert(flow, verdict);
                let buffered = self.classify_buffers.remove(&flow).unwrap_or_default();
                events.push(StackEvent::StreamClassified { flow, classification: verdict });
                events.push(StackEvent::StreamData { flow, bytes: buffered });
            }
        }
    }

    fn wrap_ipv4(&mut self, src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<u8> {
        let ident = self.ip_ident;
        self.ip_ident = self.ip_ident.wrapping_add(1);
        let ip_pkt = ipv4::build_packet(src, dst, protocol, ident, 64, payload);
        eth::build_frame(self.config.guest_mac, self.config.host_mac, ETHERTYPE_IPV4, &ip_pkt)
    }
}

/// Rewrites the source/destination port fields of a raw TCP segment built
/// by [`TcpConnection`], which doesn't itself track ports (those live one
/// level up, in the flow key).
fn patch_ports(segment: &mut [u8], src_port: u16, dst_port: u16) {
    segment[0..2].copy_from_slice(&src_port.to_be_bytes());
    segment[2..4].copy_from_slice(&dst_port.to_be_bytes());
}

/// The guest-facing and synthetic IPv4 addresses for a flow, used when the
/// orchestrator drives data back into the stack from outside the normal
/// guest-frame path (`send_stream_data`/`close_stream`).
fn flow_v4_addrs(flow: &FlowKey) -> Option<(Ipv4Addr, Ipv4Addr)> {
    if flow.src_ip > u32::MAX as u128 || flow.dst_ip > u32::MAX as u128 {
        return None;
    }
    Some((Ipv4Addr::from(flow.src_ip as u32), Ipv4Addr::from(flow.dst_ip as u32)))
}

fn broadcast_of(ip: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    let ip_bits = u32::from_be_bytes(ip.octets());
    let mask_bits = u32::from_be_bytes(mask.octets());
    Ipv4Addr::from(ip_bits | !mask_bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gondolin_policy::PolicyConfig;

    fn test_stack() -> NetworkStack {
        test_stack_with_policy(PolicyEngine::new(PolicyConfig::default()))
    }

    fn test_stack_with_policy(policy: PolicyEngine) -> NetworkStack {
        let config = StackConfig {
            host_mac: MacAddr([2, 0, 0, 0, 0, 1]),
            guest_mac: MacAddr([2, 0, 0, 0, 0, 2]),
            host_ip: Ipv4Addr::new(10, 0, 2, 2),
            guest_ip: Ipv4Addr::new(10, 0, 2, 15),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            dns_servers: vec![Ipv4Addr::new(10, 0, 2, 2)],
            synthetic_base: Ipv4Addr::new(240, 0, 0, 0),
        };
        NetworkStack::new(config, Arc::new(SessionMetrics::default()), Arc::new(policy))
    }

    fn established_flow(stack: &mut NetworkStack) -> (FlowKey, Ipv4Addr, Ipv4Addr) {
        let peer = Ipv4Addr::new(240, 0, 0, 5);
        let syn = crate::tcp::build_segment(54321, 443, 1000, 0, TcpFlags::SYN, 65535, &[]);
        let ip_pkt = ipv4::build_packet(stack.config.guest_ip, peer, PROTO_TCP, 1, 64, &syn);
        let frame = eth::build_frame(stack.config.host_mac, stack.config.guest_mac, ETHERTYPE_IPV4, &ip_pkt);
        let (_out, _events) = stack.on_guest_frame(&frame);

        let flow = FlowKey::from_v4(stack.config.guest_ip, peer, 54321, 443, PROTO_TCP);
        let server_seq = stack.tcp_conns[&flow].iss.wrapping_add(1);
        let ack = crate::tcp::build_segment(54321, 443, 1001, server_seq, TcpFlags::ACK, 65535, &[]);
        let ip_pkt = ipv4::build_packet(stack.config.guest_ip, peer, PROTO_TCP, 2, 64, &ack);
        let frame = eth::build_frame(stack.config.host_mac, stack.config.guest_mac, ETHERTYPE_IPV4, &ip_pkt);
        let (_out, events) = stack.on_guest_frame(&frame);
        assert!(matches!(events.as_slice(), [StackEvent::NewStream { .. }]));
        (flow, stack.config.guest_ip, peer)
    }

    #[test]
    fn data_is_classified_once_and_then_streamed() {
        let mut stack = test_stack();
        let (flow, guest_ip, peer) = established_flow(&mut stack);

        let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let data = crate::tcp::build_segment(54321, 443, 1001, stack.tcp_conns[&flow].rcv_nxt, TcpFlags::ACK | TcpFlags::PSH, 65535, request);
        let ip_pkt = ipv4::build_packet(guest_ip, peer, PROTO_TCP, 3, 64, &data);
        let frame = eth::build_frame(stack.config.host_mac, stack.config.guest_mac, ETHERTYPE_IPV4, &ip_pkt);
        let (_out, events) = stack.on_guest_frame(&frame);

        assert!(events.iter().any(|e| matches!(e, StackEvent::StreamClassified { classification: Classification::PlaintextHttp, .. })));
        assert!(events.iter().any(|e| matches!(e, StackEvent::StreamData { bytes, .. } if bytes.as_slice() == &request[..])));
    }

    #[test]
    fn unrecognized_prefix_resets_the_connection() {
        let mut stack = test_stack();
        let (flow, guest_ip, peer) = established_flow(&mut stack);

        let garbage = b"\x01\x02\x03garbage-not-http-or-tls";
        let data = crate::tcp::build_segment(54321, 443, 1001, stack.tcp_conns[&flow].rcv_nxt, TcpFlags::ACK | TcpFlags::PSH, 65535, garbage);
        let ip_pkt = ipv4::build_packet(guest_ip, peer, PROTO_TCP, 3, 64, &data);
        let frame = eth::build_frame(stack.config.host_mac, stack.config.guest_mac, ETHERTYPE_IPV4, &ip_pkt);
        let (out, events) = stack.on_guest_frame(&frame);

        assert!(events.iter().any(|e| matches!(e, StackEvent::StreamClosed { .. })));
        assert!(!out.is_empty(), "expected an RST frame back to the guest");
        assert!(!stack.tcp_conns.contains_key(&flow));
    }

    fn dns_query_frame(stack: &NetworkStack, name: &str) -> Vec<u8> {
        let mut query = vec![0u8; 12];
        query[0..2].copy_from_slice(&0x1234u16.to_be_bytes());
        query[4..6].copy_from_slice(&1u16.to_be_bytes());
        for label in name.split('.') {
            query.push(label.len() as u8);
            query.extend_from_slice(label.as_bytes());
        }
        query.push(0);
        query.extend_from_slice(&1u16.to_be_bytes()); // qtype A
        query.extend_from_slice(&1u16.to_be_bytes()); // qclass IN

        let peer = Ipv4Addr::new(10, 0, 2, 2);
        let udp = udp::build_datagram(stack.config.guest_ip, peer, 55000, udp::PORT_DNS, &query);
        let ip_pkt = ipv4::build_packet(stack.config.guest_ip, peer, PROTO_UDP, 1, 64, &udp);
        eth::build_frame(stack.config.host_mac, stack.config.guest_mac, ETHERTYPE_IPV4, &ip_pkt)
    }

    #[test]
    fn dns_query_for_allowed_host_gets_a_synthetic_address() {
        let mut stack = test_stack();
        let frame = dns_query_frame(&stack, "example.com");
        let (out, _events) = stack.on_guest_frame(&frame);
        assert_eq!(out.len(), 1);
        assert_eq!(stack.metrics.dns_queries_blocked.get(), 0);
        let synthetic = stack.names.resolve("example.com");
        assert_eq!(stack.names.hostname_for(synthetic).as_deref(), Some("example.com"));
    }

    #[test]
    fn dns_query_for_denied_host_returns_nxdomain_and_never_binds_it() {
        let policy = PolicyEngine::new(PolicyConfig { denied_hosts: vec!["blocked.example".into()], ..Default::default() });
        let mut stack = test_stack_with_policy(policy);
        let frame = dns_query_frame(&stack, "blocked.example");
        let (out, _events) = stack.on_guest_frame(&frame);
        assert_eq!(out.len(), 1);
        assert_eq!(stack.metrics.dns_queries_blocked.get(), 1);
        assert!(stack.names.hostname_for(Ipv4Addr::new(240, 0, 0, 1)).is_none());
    }

    #[test]
    fn answers_arp_for_host_ip() {
        let mut stack = test_stack();
        let arp_req = {
            let mut out = Vec::new();
            out.extend_from_slice(&1u16.to_be_bytes());
            out.extend_from_slice(&0x0800u16.to_be_bytes());
            out.push(6);
            out.push(4);
            out.extend_from_slice(&1u16.to_be_bytes());
            out.extend_from_slice(&stack.config.guest_mac.0);
            out.extend_from_slice(&stack.config.guest_ip.octets());
            out.extend_from_slice(&[0u8; 6]);
            out.extend_from_slice(&stack.config.host_ip.octets());
            out
        };
        let frame = eth::build_frame(MacAddr::BROADCAST, stack.config.guest_mac, ETHERTYPE_ARP, &arp_req);
        let (out, _events) = stack.on_guest_frame(&frame);
        assert_eq!(out.len(), 1);
    }
}
