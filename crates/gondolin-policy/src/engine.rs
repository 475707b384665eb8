//! The admission and secret-substitution policy engine.
//!
//! One `PolicyEngine` is constructed per VM session from the host-supplied
//! config and then consulted on every TCP accept, DNS resolution and HTTP
//! request the session processes. Lookups are expected to run on every
//! packet in the connect path, so host/IP checks are kept allocation-free
//! where possible and glob compilation is cached.

use crate::admission::is_internal;
use crate::glob::GlobCache;
use crate::secrets::SecretPolicy;
use gondolin_common::metrics::AtomicCounter;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Host-supplied policy configuration, loaded once at session start and
/// swappable at runtime via [`PolicyEngine::reload`].
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct PolicyConfig {
    /// Reject connections to loopback/link-local/private ranges. Defaults
    /// to `true`; a host that wants the guest to reach its own LAN must
    /// set this to `false` explicitly.
    #[serde(default = "default_true")]
    pub block_internal_ranges: bool,

    /// Host globs the guest may connect to. Empty means "no explicit
    /// allowlist" (everything not otherwise denied is allowed); callers
    /// needing default-deny must supply an explicit, restrictive list.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    /// Host globs the guest may never reach regardless of `allowed_hosts`.
    #[serde(default)]
    pub denied_hosts: Vec<String>,

    #[serde(default)]
    pub secrets: Vec<SecretPolicy>,
}

fn default_true() -> bool {
    true
}

impl PolicyConfig {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug, Default, Serialize)]
pub struct EngineStats {
    pub host_lookups: u64,
    pub ip_lookups: u64,
    pub denied: u64,
}

pub struct PolicyEngine {
    config: parking_lot::RwLock<PolicyConfig>,
    globs: GlobCache,
    host_lookups: AtomicCounter,
    ip_lookups: AtomicCounter,
    denied: AtomicCounter,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config: parking_lot::RwLock::new(config),
            globs: GlobCache::new(),
            host_lookups: AtomicCounter::new(),
            ip_lookups: AtomicCounter::new(),
            denied: AtomicCounter::new(),
        }
    }

    pub fn reload(&self, config: PolicyConfig) {
        *self.config.write() = config;
    }

    /// `isRequestAllowed`: is the guest allowed to open a connection to
    /// `host`? Denylist wins over allowlist; an empty allowlist is treated
    /// as "allow anything not denied".
    pub fn is_host_allowed(&self, host: &str) -> bool {
        self.host_lookups.incr();
        let config = self.config.read();

        for pattern in &config.denied_hosts {
            if self.globs.matches(pattern, host) {
                self.denied.incr();
                return false;
            }
        }
        if config.allowed_hosts.is_empty() {
            return true;
        }
        let allowed = config.allowed_hosts.iter().any(|pattern| self.globs.matches(pattern, host));
        if !allowed {
            self.denied.incr();
        }
        allowed
    }

    /// `isIpAllowed`: is the guest allowed to open a connection to
    /// `addr`? Runs after DNS resolution (or immediately for a literal
    /// IPv4/IPv6 destination) so that a name which resolves to an internal
    /// address is rejected even when `host` passed `is_host_allowed`.
    pub fn is_ip_allowed(&self, addr: IpAddr) -> bool {
        self.ip_lookups.incr();
        let blocked = self.config.read().block_internal_ranges && is_internal(addr);
        if blocked {
            self.denied.incr();
        }
        !blocked
    }

    /// Finds the secret whose placeholder occurs in `text`, if any.
    pub fn find_secret<'a>(&'a self, text: &str) -> Option<SecretPolicy> {
        self.config.read().secrets.iter().find(|s| text.contains(&s.placeholder)).cloned()
    }

    /// Whether `secret` may be substituted for a request bound to `host`.
    pub fn secret_allowed_for_host(&self, secret: &SecretPolicy, host: &str) -> bool {
        secret.allowed_hosts.iter().any(|pattern| self.globs.matches(pattern, host))
    }

    /// Every configured secret whose allowlist does *not* cover `host`.
    /// Used to scan outbound traffic for a raw secret value leaking to a
    /// destination it was never cleared for, independent of whether the
    /// request ever contained that secret's placeholder.
    pub fn secrets_not_allowed_for(&self, host: &str) -> Vec<SecretPolicy> {
        self.config.read().secrets.iter().filter(|s| !self.secret_allowed_for_host(s, host)).cloned().collect()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            host_lookups: self.host_lookups.get(),
            ip_lookups: self.ip_lookups.get(),
            denied: self.denied.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with_allowlist() -> PolicyEngine {
        PolicyEngine::new(PolicyConfig {
            block_internal_ranges: true,
            allowed_hosts: vec!["*.example.com".into(), "api.github.com".into()],
            denied_hosts: vec!["evil.example.com".into()],
            secrets: vec![],
        })
    }

    #[test]
    fn denylist_overrides_allowlist() {
        let engine = engine_with_allowlist();
        assert!(!engine.is_host_allowed("evil.example.com"));
    }

    #[test]
    fn allowlist_restricts_hosts() {
        let engine = engine_with_allowlist();
        assert!(engine.is_host_allowed("api.example.com"));
        assert!(engine.is_host_allowed("api.github.com"));
        assert!(!engine.is_host_allowed("attacker.net"));
    }

    #[test]
    fn empty_allowlist_allows_everything_not_denied() {
        let engine = PolicyEngine::new(PolicyConfig {
            denied_hosts: vec!["blocked.example.com".into()],
            ..Default::default()
        });
        assert!(engine.is_host_allowed("anything.example.com"));
        assert!(!engine.is_host_allowed("blocked.example.com"));
    }

    #[test]
    fn internal_ranges_blocked_by_default() {
        let engine = engine_with_allowlist();
        assert!(!engine.is_ip_allowed("127.0.0.1".parse().unwrap()));
        assert!(engine.is_ip_allowed("93.184.216.34".parse().unwrap()));
    }

    #[test]
    fn block_internal_ranges_can_be_disabled() {
        let engine = PolicyEngine::new(PolicyConfig {
            block_internal_ranges: false,
            ..Default::default()
        });
        assert!(engine.is_ip_allowed("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn secret_allowed_for_host_respects_allowlist() {
        let engine = PolicyEngine::new(PolicyConfig::default());
        let secret = SecretPolicy {
            placeholder: "{{secrets.token}}".into(),
            value: "shh".into(),
            allowed_hosts: vec!["api.example.com".into()],
            replace_in_query: false,
        };
        assert!(engine.secret_allowed_for_host(&secret, "api.example.com"));
        assert!(!engine.secret_allowed_for_host(&secret, "attacker.net"));
    }
}
