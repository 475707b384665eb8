//! Session configuration: the guest-facing network parameters, the
//! admission/secret policy, and the cert-cache sizing a host operator
//! tunes per VM.

use gondolin_net::stack::StackConfig;
use gondolin_net::eth::MacAddr;
use gondolin_policy::PolicyConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Top-level configuration for one Gondolin session, loaded once at VM
/// start and not reloaded mid-session except for the embedded
/// [`PolicyConfig`], which [`gondolin_policy::PolicyEngine::reload`]
/// accepts at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GondolinConfig {
    /// Host side of the point-to-point link presented to the guest.
    pub host_mac: [u8; 6],
    /// Guest's MAC, learned from its first frame if left as the
    /// broadcast-adjacent default, but normally pinned by the VMM.
    pub guest_mac: [u8; 6],
    pub host_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    /// Base of the private /16 the DNS stub allocates synthetic
    /// addresses from.
    pub synthetic_base: Ipv4Addr,
    /// Maximum number of minted leaf certificates kept warm in the
    /// [`gondolin_tls::CertCache`].
    pub cert_cache_capacity: u64,
    /// Admission and secret-substitution policy.
    pub policy: PolicyConfig,
    /// `name -> placeholder` pairs exported into the guest's environment
    /// so guest-side code can reference `$NAME` without ever seeing the
    /// real secret value.
    #[serde(default)]
    pub secret_env: HashMap<String, String>,
}

impl Default for GondolinConfig {
    fn default() -> Self {
        Self {
            host_mac: [0x52, 0x54, 0x00, 0x00, 0x00, 0x01],
            guest_mac: [0x52, 0x54, 0x00, 0x00, 0x00, 0x02],
            host_ip: Ipv4Addr::new(10, 77, 0, 1),
            guest_ip: Ipv4Addr::new(10, 77, 0, 2),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            synthetic_base: Ipv4Addr::new(10, 78, 0, 0),
            cert_cache_capacity: 512,
            policy: PolicyConfig::default(),
            secret_env: HashMap::new(),
        }
    }
}

impl GondolinConfig {
    /// Loads configuration from a JSON file on disk.
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Writes configuration to a JSON file on disk.
    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    pub fn stack_config(&self) -> StackConfig {
        StackConfig {
            host_mac: MacAddr(self.host_mac),
            guest_mac: MacAddr(self.guest_mac),
            host_ip: self.host_ip,
            guest_ip: self.guest_ip,
            subnet_mask: self.subnet_mask,
            dns_servers: vec![self.host_ip],
            synthetic_base: self.synthetic_base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_json() {
        let config = GondolinConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: GondolinConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.host_ip, config.host_ip);
        assert_eq!(back.synthetic_base, config.synthetic_base);
    }

    #[test]
    fn secret_env_defaults_to_empty() {
        let json = r#"{"host_mac":[0,0,0,0,0,1],"guest_mac":[0,0,0,0,0,2],"host_ip":"10.0.0.1",
                        "guest_ip":"10.0.0.2","subnet_mask":"255.255.255.0","synthetic_base":"10.1.0.0",
                        "cert_cache_capacity":64,"policy":{}}"#;
        let config: GondolinConfig = serde_json::from_str(json).unwrap();
        assert!(config.secret_env.is_empty());
    }
}
