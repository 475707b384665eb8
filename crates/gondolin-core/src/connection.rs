//! Per-flow tasks: one spawned for every classified TCP stream, running
//! independently of every other connection and of the link task once it
//! has its channel endpoints. This is the "task per active TCP
//! connection" half of the cooperative scheduling model; the link task
//! is the other half.

use crate::duplex::{FlowMessage, GuestDuplex, LinkCommand};
use crate::framing::ByteReader;
use crate::session::SessionCtx;
use crate::upstream;
use gondolin_common::error::{GondolinError, GondolinResult};
use gondolin_common::flow::FlowKey;
use gondolin_http::{process_request, process_response, InterceptOutcome, ResponseOutcome};
use gondolin_net::Classification;
use gondolin_tls::{extract_sni, mitm};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

const MAX_CLIENT_HELLO_BYTES: usize = 16 * 1024;
const TLS_ALERT_ACCESS_DENIED: u8 = 49;
const TLS_ALERT_DECODE_ERROR: u8 = 50;

/// Classifies, then drives, one flow to completion. Never panics on
/// policy/IO failure: every error path closes this flow only.
pub async fn run(
    ctx: Arc<SessionCtx>,
    flow: FlowKey,
    classification: Classification,
    first_bytes: Vec<u8>,
    rx: mpsc::UnboundedReceiver<FlowMessage>,
    cmd_tx: mpsc::UnboundedSender<LinkCommand>,
) {
    let result = match classification {
        Classification::Tls => run_tls(ctx, flow, first_bytes, rx, cmd_tx.clone()).await,
        Classification::PlaintextHttp => run_plaintext(ctx, flow, first_bytes, rx, cmd_tx.clone()).await,
        Classification::NeedMoreData | Classification::Unrecognized => Ok(()),
    };
    if let Err(e) = result {
        tracing::debug!(?flow, error = %e, "connection task ended");
    }
    cmd_tx.send(LinkCommand::Close { flow }).ok();
}

async fn run_tls(
    ctx: Arc<SessionCtx>,
    flow: FlowKey,
    first_bytes: Vec<u8>,
    mut rx: mpsc::UnboundedReceiver<FlowMessage>,
    cmd_tx: mpsc::UnboundedSender<LinkCommand>,
) -> GondolinResult<()> {
    let mut hello = first_bytes;
    let sni = loop {
        if let Some(sni) = extract_sni(&hello) {
            break sni;
        }
        if hello.len() > MAX_CLIENT_HELLO_BYTES {
            send_alert(&cmd_tx, flow, TLS_ALERT_DECODE_ERROR);
            return Err(GondolinError::TlsHandshakeFailed("ClientHello exceeded size cap without a parseable SNI".into()));
        }
        match rx.recv().await {
            Some(FlowMessage::Data(bytes)) => hello.extend_from_slice(&bytes),
            Some(FlowMessage::Closed) | None => {
                return Err(GondolinError::TlsHandshakeFailed("guest closed connection before ClientHello completed".into()))
            }
        }
    };

    if !ctx.policy.is_host_allowed(&sni) {
        send_alert(&cmd_tx, flow, TLS_ALERT_ACCESS_DENIED);
        return Err(GondolinError::AdmissionDenied(format!("host {sni} not allowed")));
    }

    let candidates = ctx.resolver.resolve(&sni).await?;
    let Some(chosen_ip) = candidates.into_iter().find(|ip| ctx.policy.is_ip_allowed(*ip)) else {
        send_alert(&cmd_tx, flow, TLS_ALERT_ACCESS_DENIED);
        return Err(GondolinError::AdmissionDenied(format!("no admitted IP for {sni}")));
    };

    let acceptor = mitm::acceptor_for_sni(&ctx.cert_cache, &sni)?;
    ctx.metrics.tls_handshakes_intercepted.incr();

    let guest_duplex = GuestDuplex::new(flow, cmd_tx.clone(), rx, hello);
    let guest_tls = acceptor
        .accept(guest_duplex)
        .await
        .map_err(|e| GondolinError::TlsHandshakeFailed(e.to_string()))?;

    let upstream = upstream::connect_tls(SocketAddr::new(chosen_ip, flow.dst_port), &sni).await?;
    run_keepalive_loop(ByteReader::new(guest_tls), upstream, ctx, None).await
}

async fn run_plaintext(
    ctx: Arc<SessionCtx>,
    flow: FlowKey,
    first_bytes: Vec<u8>,
    rx: mpsc::UnboundedReceiver<FlowMessage>,
    cmd_tx: mpsc::UnboundedSender<LinkCommand>,
) -> GondolinResult<()> {
    let guest = GuestDuplex::new(flow, cmd_tx, rx, first_bytes);
    let mut reader = ByteReader::new(guest);
    let Some(head) = reader.read_head().await? else {
        return Ok(());
    };
    let host = gondolin_http::parse_request_head(&head)
        .and_then(|h| h.host().map(|s| s.to_string()))
        .ok_or_else(|| GondolinError::MalformedPacket("request missing Host header".into()))?;

    if !ctx.policy.is_host_allowed(&host) {
        return Err(GondolinError::AdmissionDenied(format!("host {host} not allowed")));
    }
    let candidates = ctx.resolver.resolve(&host).await?;
    let Some(chosen_ip) = candidates.into_iter().find(|ip| ctx.policy.is_ip_allowed(*ip)) else {
        return Err(GondolinError::AdmissionDenied(format!("no admitted IP for {host}")));
    };

    let upstream = upstream::connect_plain(SocketAddr::new(chosen_ip, flow.dst_port)).await?;
    run_keepalive_loop(reader, upstream, ctx, Some(head)).await
}

/// Services requests on one already-connected guest<->upstream pair
/// until the guest closes the connection. A denied request fails only
/// that request with a synthetic 502; the keep-alive connection is left
/// open for whatever the guest sends next.
async fn run_keepalive_loop<G>(
    mut guest: ByteReader<G>,
    mut upstream: upstream::UpstreamConnection,
    ctx: Arc<SessionCtx>,
    mut first_head: Option<Vec<u8>>,
) -> GondolinResult<()>
where
    G: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let head_bytes = match first_head.take() {
            Some(head) => head,
            None => match guest.read_head().await? {
                Some(head) => head,
                None => return Ok(()),
            },
        };
        let parsed = gondolin_http::parse_request_head(&head_bytes)
            .ok_or_else(|| GondolinError::MalformedPacket("malformed request head".into()))?;
        let body_len = parsed.content_length().unwrap_or(0);
        let body = guest.read_body(body_len).await?;

        match process_request(ctx.policy.as_ref(), ctx.hooks.as_ref(), &head_bytes, body)? {
            InterceptOutcome::Deny { reason } => {
                tracing::debug!(%reason, "request denied on keep-alive connection");
                guest.write_all(&synthetic_502(&reason)).await?;
                continue;
            }
            InterceptOutcome::Forward { request_head, body } => {
                upstream.write_all(&request_head).await.map_err(GondolinError::Io)?;
                upstream.write_all(&body).await.map_err(GondolinError::Io)?;
                upstream.flush().await.map_err(GondolinError::Io)?;
            }
        }

        let mut upstream_reader = ByteReader::new(&mut upstream);
        let Some(resp_head) = upstream_reader.read_head().await? else {
            return Err(GondolinError::UpstreamConnectFailed("upstream closed before sending a response".into()));
        };
        let parsed_resp = gondolin_http::parse_response_head(&resp_head)
            .ok_or_else(|| GondolinError::MalformedPacket("malformed response head".into()))?;
        let resp_body_len = parsed_resp.content_length().unwrap_or(0);
        let resp_body = upstream_reader.read_body(resp_body_len).await?;

        match process_response(ctx.hooks.as_ref(), &resp_head, resp_body)? {
            ResponseOutcome::Forward { head, body } => {
                guest.write_all(&head).await?;
                guest.write_all(&body).await?;
            }
            ResponseOutcome::Deny => {
                guest.write_all(&synthetic_502("response denied by onResponse hook")).await?;
            }
        }
    }
}

fn synthetic_502(reason: &str) -> Vec<u8> {
    let body = format!("Gondolin blocked this request: {reason}");
    format!(
        "HTTP/1.1 502 Bad Gateway\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

fn send_alert(cmd_tx: &mpsc::UnboundedSender<LinkCommand>, flow: FlowKey, description: u8) {
    let alert = vec![0x15, 0x03, 0x03, 0x00, 0x02, 0x02, description];
    cmd_tx.send(LinkCommand::SendData { flow, data: alert }).ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionCtx;
    use async_trait::async_trait;
    use gondolin_common::metrics::SessionMetrics;
    use gondolin_http::NoopHooks;
    use gondolin_policy::{PolicyConfig, PolicyEngine};
    use gondolin_tls::{CertCache, CertificateAuthority};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct FixedResolver(IpAddr);

    #[async_trait]
    impl crate::resolver::HostResolver for FixedResolver {
        async fn resolve(&self, _hostname: &str) -> GondolinResult<Vec<IpAddr>> {
            Ok(vec![self.0])
        }
    }

    fn test_ctx(resolver_ip: IpAddr, policy_config: PolicyConfig) -> Arc<SessionCtx> {
        let ca = Arc::new(CertificateAuthority::generate().unwrap());
        let cert_cache = Arc::new(CertCache::new(ca, 16));
        Arc::new(SessionCtx {
            policy: Arc::new(PolicyEngine::new(policy_config)),
            resolver: Arc::new(FixedResolver(resolver_ip)),
            hooks: Arc::new(NoopHooks),
            cert_cache,
            metrics: Arc::new(SessionMetrics::default()),
        })
    }

    fn test_flow(dst_port: u16) -> FlowKey {
        FlowKey::from_v4(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(240, 0, 0, 5), 5555, dst_port, 6)
    }

    #[tokio::test]
    async fn plaintext_request_is_forwarded_and_response_relayed_to_guest() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = sock.read(&mut buf).await;
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK").await.unwrap();
        });

        let policy_config = PolicyConfig { block_internal_ranges: false, ..PolicyConfig::default() };
        let ctx = test_ctx(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), policy_config);
        let flow = test_flow(port);
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();

        let request = b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n".to_vec();
        let handle = tokio::spawn(run_plaintext(ctx, flow, request, data_rx, cmd_tx));

        let mut forwarded = Vec::new();
        loop {
            match cmd_rx.recv().await.unwrap() {
                LinkCommand::SendData { data, .. } => {
                    forwarded.extend_from_slice(&data);
                    if forwarded.windows(2).any(|w| w == b"OK") {
                        break;
                    }
                }
                LinkCommand::Close { .. } => break,
            }
        }
        data_tx.send(FlowMessage::Closed).ok();
        handle.await.unwrap().unwrap();

        assert!(String::from_utf8_lossy(&forwarded).contains("200 OK"));
    }

    #[tokio::test]
    async fn plaintext_request_to_denied_host_fails_without_connecting() {
        let policy_config = PolicyConfig { denied_hosts: vec!["blocked.example".into()], ..PolicyConfig::default() };
        let ctx = test_ctx(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)), policy_config);
        let flow = test_flow(80);
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
        let (_data_tx, data_rx) = mpsc::unbounded_channel();
        let request = b"GET / HTTP/1.1\r\nHost: blocked.example\r\n\r\n".to_vec();

        let result = run_plaintext(ctx, flow, request, data_rx, cmd_tx).await;
        assert!(matches!(result, Err(GondolinError::AdmissionDenied(_))));
    }

    #[test]
    fn synthetic_502_is_well_formed_http() {
        let bytes = synthetic_502("host not allowed");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway"));
        assert!(text.contains("Connection: keep-alive"));
        assert!(text.ends_with("host not allowed"));
    }
}
