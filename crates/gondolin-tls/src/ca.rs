//! The process-local certificate authority. Its private key is generated
//! once per host process, lives only in process memory, and is never
//! written to disk or handed to the guest — only the public certificate
//! (so the guest, or the operator, can install it as a trust anchor) is
//! ever exported.

use gondolin_common::error::{GondolinError, GondolinResult};
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};

pub struct CertificateAuthority {
    key: KeyPair,
    cert: rcgen::Certificate,
}

impl CertificateAuthority {
    /// Generates a fresh CA keypair and self-signed root certificate.
    /// Called exactly once at process start.
    pub fn generate() -> GondolinResult<Self> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Gondolin Interception CA");
        dn.push(DnType::OrganizationName, "Gondolin");
        params.distinguished_name = dn;

        let key = KeyPair::generate().map_err(|e| GondolinError::CertMintingFailed(e.to_string()))?;
        let cert = params.self_signed(&key).map_err(|e| GondolinError::CertMintingFailed(e.to_string()))?;

        Ok(Self { key, cert })
    }

    /// Mints a leaf certificate for `sni`, with `CN` and the sole `SAN`
    /// entry both set to `sni`, signed by this CA.
    pub fn mint_leaf(&self, sni: &str) -> GondolinResult<MintedCert> {
        let mut params = CertificateParams::new(vec![sni.to_string()])
            .map_err(|e| GondolinError::CertMintingFailed(e.to_string()))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, sni);
        params.distinguished_name = dn;

        let leaf_key = KeyPair::generate().map_err(|e| GondolinError::CertMintingFailed(e.to_string()))?;
        let leaf_cert = params
            .signed_by(&leaf_key, &self.cert, &self.key)
            .map_err(|e| GondolinError::CertMintingFailed(e.to_string()))?;

        Ok(MintedCert {
            cert_der: leaf_cert.der().to_vec(),
            key_der: leaf_key.serialize_der(),
        })
    }

    /// The CA's public certificate, PEM-encoded. This is the only material
    /// this type ever exposes; there is deliberately no method that
    /// returns the private key.
    pub fn public_cert_pem(&self) -> String {
        self.cert.pem()
    }
}

/// A minted leaf certificate and its private key, both DER-encoded, ready
/// to hand to a `rustls::ServerConfig`.
pub struct MintedCert {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_pem_never_contains_private_key_marker() {
        let ca = CertificateAuthority::generate().unwrap();
        let pem = ca.public_cert_pem();
        assert!(pem.contains("BEGIN CERTIFICATE"));
        assert!(!pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn minted_leaf_has_distinct_key_from_ca() {
        let ca = CertificateAuthority::generate().unwrap();
        let leaf = ca.mint_leaf("example.com").unwrap();
        assert!(!leaf.cert_der.is_empty());
        assert!(!leaf.key_der.is_empty());
    }

    #[test]
    fn minting_is_deterministic_per_call_but_keys_differ() {
        let ca = CertificateAuthority::generate().unwrap();
        let a = ca.mint_leaf("example.com").unwrap();
        let b = ca.mint_leaf("example.com").unwrap();
        // Each mint draws a fresh leaf key, so even same-SNI certs differ.
        assert_ne!(a.key_der, b.key_der);
    }
}
