//! The host-side DNS resolution external interface (spec "host DNS"):
//! `resolve(hostname) -> list<IP>`, consulted lazily at connect time
//! rather than trusted from the guest's earlier DNS query. This lazy
//! re-resolution is the DNS-rebinding defence: the guest only ever holds
//! a synthetic IP, and the real destination is looked up fresh on every
//! TCP/TLS connect.

use async_trait::async_trait;
use gondolin_common::error::{GondolinError, GondolinResult};
use std::net::IpAddr;

#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, hostname: &str) -> GondolinResult<Vec<IpAddr>>;
}

/// Resolves through Tokio's getaddrinfo-backed resolver. This is the
/// "real" resolution path; it is deliberately never consulted from the
/// guest-facing DNS stub, only from the TLS/HTTP connect path.
pub struct TokioResolver;

#[async_trait]
impl HostResolver for TokioResolver {
    async fn resolve(&self, hostname: &str) -> GondolinResult<Vec<IpAddr>> {
        let lookup_target = format!("{hostname}:0");
        let addrs = tokio::net::lookup_host(&lookup_target)
            .await
            .map_err(|e| GondolinError::DnsResolutionFailed { name: hostname.to_string(), reason: e.to_string() })?;
        let ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        if ips.is_empty() {
            return Err(GondolinError::DnsResolutionFailed {
                name: hostname.to_string(),
                reason: "no addresses returned".into(),
            });
        }
        Ok(ips)
    }
}
