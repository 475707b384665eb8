//! A bounded cache of minted leaf certificates, keyed by SNI.
//!
//! Minting is CPU-bound (an RSA/ECDSA signature per leaf) and every TLS
//! connection to the same host should reuse the same leaf rather than pay
//! that cost again. The cache is capacity-bounded with LRU eviction so a
//! guest that churns through thousands of distinct hosts can't grow it
//! without bound; a cert already handed out for an in-flight handshake
//! stays valid even if evicted from the index in the meantime, because the
//! handshake holds its own `Arc` clone, not a cache lookup.

use crate::ca::{CertificateAuthority, MintedCert};
use gondolin_common::error::GondolinResult;
use moka::sync::Cache;
use std::sync::Arc;

pub struct CertCache {
    ca: Arc<CertificateAuthority>,
    cache: Cache<String, Arc<MintedCert>>,
}

impl CertCache {
    pub fn new(ca: Arc<CertificateAuthority>, capacity: u64) -> Self {
        Self {
            ca,
            cache: Cache::builder().max_capacity(capacity).build(),
        }
    }

    /// Returns the cached leaf for `sni`, minting and inserting one if
    /// this is the first connection to that host.
    pub fn get_or_mint(&self, sni: &str) -> GondolinResult<Arc<MintedCert>> {
        if let Some(existing) = self.cache.get(sni) {
            return Ok(existing);
        }
        let minted = Arc::new(self.ca.mint_leaf(sni)?);
        self.cache.insert(sni.to_string(), minted.clone());
        Ok(minted)
    }

    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lookup_for_same_sni_reuses_minted_cert() {
        let ca = Arc::new(CertificateAuthority::generate().unwrap());
        let cache = CertCache::new(ca, 64);

        let a = cache.get_or_mint("example.com").unwrap();
        let b = cache.get_or_mint("example.com").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn different_hosts_get_different_certs() {
        let ca = Arc::new(CertificateAuthority::generate().unwrap());
        let cache = CertCache::new(ca, 64);

        let a = cache.get_or_mint("a.example.com").unwrap();
        let b = cache.get_or_mint("b.example.com").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn eviction_from_index_does_not_invalidate_an_outstanding_handle() {
        let ca = Arc::new(CertificateAuthority::generate().unwrap());
        let cache = CertCache::new(ca, 1);

        let a = cache.get_or_mint("a.example.com").unwrap();
        let _b = cache.get_or_mint("b.example.com").unwrap();
        cache.cache.run_pending_tasks();
        // `a` may or may not still be indexed, but the handle we already
        // hold remains a valid, usable certificate either way.
        assert!(!a.cert_der.is_empty());
    }
}
