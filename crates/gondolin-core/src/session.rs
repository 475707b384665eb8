//! The VM session orchestrator: owns the network stack, the policy
//! engine and the TLS materials for one guest, and runs the single link
//! task that drives them. Everything else — one task per classified
//! connection — is spawned from here and talks back only through
//! [`LinkCommand`]s, matching the cooperative-scheduler model: the
//! network stack itself is never shared across tasks.

use crate::config::GondolinConfig;
use crate::connection;
use crate::duplex::{FlowMessage, LinkCommand};
use crate::frame_io::FrameIo;
use crate::resolver::HostResolver;
use gondolin_common::error::GondolinResult;
use gondolin_common::metrics::{SessionMetrics, SessionMetricsSnapshot};
use gondolin_http::{NoopHooks, RequestHooks};
use gondolin_net::stack::{NetworkStack, StackEvent};
use gondolin_policy::PolicyEngine;
use gondolin_tls::{CertCache, CertificateAuthority};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared, read-mostly state every connection task needs. Cheap to
/// clone (everything behind an `Arc`) so each spawned task gets its own
/// handle without touching the link task's exclusive state.
pub struct SessionCtx {
    pub policy: Arc<PolicyEngine>,
    pub resolver: Arc<dyn HostResolver>,
    pub hooks: Arc<dyn RequestHooks>,
    pub cert_cache: Arc<CertCache>,
    pub metrics: Arc<SessionMetrics>,
}

pub struct VmSession {
    config: GondolinConfig,
    ca: Arc<CertificateAuthority>,
    ctx: Arc<SessionCtx>,
}

impl VmSession {
    pub fn new(config: GondolinConfig, resolver: Arc<dyn HostResolver>, hooks: Arc<dyn RequestHooks>) -> GondolinResult<Self> {
        let ca = Arc::new(CertificateAuthority::generate()?);
        let cert_cache = Arc::new(CertCache::new(ca.clone(), config.cert_cache_capacity));
        let policy = Arc::new(PolicyEngine::new(config.policy.clone()));
        let metrics = Arc::new(SessionMetrics::default());
        let ctx = Arc::new(SessionCtx { policy, resolver, hooks, cert_cache, metrics });
        Ok(Self { config, ca, ctx })
    }

    /// Convenience constructor for a session with no custom hooks and
    /// Tokio's resolver — the common case for a host that only needs
    /// admission and secret substitution.
    pub fn with_defaults(config: GondolinConfig) -> GondolinResult<Self> {
        Self::new(config, Arc::new(crate::resolver::TokioResolver), Arc::new(NoopHooks))
    }

    /// The CA's public certificate, PEM-encoded, for installation into
    /// the guest's trust store. There is no corresponding private-key
    /// export: the key never leaves this process.
    pub fn public_ca_cert_pem(&self) -> String {
        self.ca.public_cert_pem()
    }

    /// `name -> placeholder` pairs the host should set in the guest's
    /// environment before boot, so guest code can reference `$NAME`
    /// without the real secret ever reaching the guest.
    pub fn guest_env_exports(&self) -> HashMap<String, String> {
        self.config.secret_env.clone()
    }

    pub fn metrics(&self) -> SessionMetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.ctx.policy
    }

    /// Runs the link task: reads frames from `link`, drives the network
    /// stack, and spawns one connection task per classified flow. Returns
    /// once `link` reports the VM has gone away.
    pub async fn run(self: Arc<Self>, mut link: impl FrameIo + 'static) -> GondolinResult<()> {
        let mut stack = NetworkStack::new(self.config.stack_config(), self.ctx.metrics.clone(), self.ctx.policy.clone());
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<LinkCommand>();
        let mut flows: HashMap<gondolin_common::flow::FlowKey, mpsc::UnboundedSender<FlowMessage>> = HashMap::new();

        loop {
            tokio::select! {
                frame = link.recv() => {
                    let Some(frame) = frame? else { break };
                    self.ctx.metrics.frames_in.incr();
                    let (out_frames, events) = stack.on_guest_frame(&frame);
                    for out in out_frames {
                        self.ctx.metrics.frames_out.incr();
                        link.send(&out).await?;
                    }
                    for event in events {
                        self.handle_event(event, &mut flows, &cmd_tx);
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(LinkCommand::SendData { flow, data }) => {
                            for out in stack.send_stream_data(flow, &data) {
                                self.ctx.metrics.frames_out.incr();
                                link.send(&out).await?;
                            }
                        }
                        Some(LinkCommand::Close { flow }) => {
                            for out in stack.close_stream(flow) {
                                self.ctx.metrics.frames_out.incr();
                                link.send(&out).await?;
                            }
                            flows.remove(&flow);
                        }
                        None => {}
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_event(
        &self,
        event: StackEvent,
        flows: &mut HashMap<gondolin_common::flow::FlowKey, mpsc::UnboundedSender<FlowMessage>>,
        cmd_tx: &mpsc::UnboundedSender<LinkCommand>,
    ) {
        match event {
            StackEvent::NewStream { .. } => {
                // Nothing to do until classification has a verdict.
            }
            StackEvent::StreamClassified { flow, classification } => {
                let (data_tx, data_rx) = mpsc::unbounded_channel();
                flows.insert(flow, data_tx);
                tokio::spawn(connection::run(self.ctx.clone(), flow, classification, Vec::new(), data_rx, cmd_tx.clone()));
            }
            StackEvent::StreamData { flow, bytes } => {
                if let Some(tx) = flows.get(&flow) {
                    tx.send(FlowMessage::Data(bytes)).ok();
                }
            }
            StackEvent::StreamClosed { flow } => {
                if let Some(tx) = flows.remove(&flow) {
                    tx.send(FlowMessage::Closed).ok();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_io::test_support::MemoryLink;
    use gondolin_net::eth::{self, MacAddr, ETHERTYPE_ARP};

    fn test_config() -> GondolinConfig {
        GondolinConfig {
            host_mac: [2, 0, 0, 0, 0, 1],
            guest_mac: [2, 0, 0, 0, 0, 2],
            ..GondolinConfig::default()
        }
    }

    fn arp_request_for_host(config: &GondolinConfig) -> Vec<u8> {
        let mut arp = Vec::new();
        arp.extend_from_slice(&1u16.to_be_bytes());
        arp.extend_from_slice(&0x0800u16.to_be_bytes());
        arp.push(6);
        arp.push(4);
        arp.extend_from_slice(&1u16.to_be_bytes());
        arp.extend_from_slice(&config.guest_mac);
        arp.extend_from_slice(&config.guest_ip.octets());
        arp.extend_from_slice(&[0u8; 6]);
        arp.extend_from_slice(&config.host_ip.octets());
        eth::build_frame(MacAddr::BROADCAST, MacAddr(config.guest_mac), ETHERTYPE_ARP, &arp)
    }

    #[tokio::test]
    async fn run_answers_arp_and_reports_frame_metrics() {
        let config = test_config();
        let frame = arp_request_for_host(&config);
        let session = Arc::new(VmSession::with_defaults(config).unwrap());
        let link = MemoryLink::new(vec![frame]);

        session.clone().run(link).await.unwrap();

        let snapshot = session.metrics();
        assert_eq!(snapshot.frames_in, 1);
        assert_eq!(snapshot.frames_out, 1);
    }

    #[tokio::test]
    async fn guest_env_exports_round_trip_from_config() {
        let mut config = test_config();
        config.secret_env.insert("API_TOKEN".to_string(), "SECRET_API_TOKEN".to_string());
        let session = VmSession::with_defaults(config).unwrap();
        assert_eq!(session.guest_env_exports().get("API_TOKEN").map(String::as_str), Some("SECRET_API_TOKEN"));
    }
}
