//! Builds the two halves of a terminated TLS connection: a server config
//! presenting a freshly-minted leaf to the guest, and a client config used
//! to open the real upstream TLS connection the HTTP layer relays through.

use crate::cache::CertCache;
use gondolin_common::error::{GondolinError, GondolinResult};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Builds a `TlsAcceptor` that will present a leaf certificate for `sni`
/// to the guest, minting (or reusing a cached mint of) that leaf first.
pub fn acceptor_for_sni(cache: &CertCache, sni: &str) -> GondolinResult<TlsAcceptor> {
    let minted = cache.get_or_mint(sni)?;
    let cert_chain = vec![CertificateDer::from(minted.cert_der.clone())];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(minted.key_der.clone()));

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| GondolinError::TlsHandshakeFailed(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Builds a `TlsConnector` trusting the platform's native root store, used
/// to open the real connection to the upstream origin. This is a normal
/// TLS client: the host fully validates the upstream's certificate chain,
/// it is only the guest-facing side that is intercepted.
pub fn upstream_connector() -> GondolinResult<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_roots()? {
        roots.add(cert).map_err(|e| GondolinError::TlsHandshakeFailed(e.to_string()))?;
    }
    let config = rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

fn rustls_native_roots() -> GondolinResult<Vec<CertificateDer<'static>>> {
    let native = rustls_native_certs::load_native_certs();
    if !native.errors.is_empty() && native.certs.is_empty() {
        return Err(GondolinError::TlsHandshakeFailed(format!(
            "failed to load native root store: {:?}",
            native.errors
        )));
    }
    Ok(native.certs)
}

pub fn server_name(host: &str) -> GondolinResult<ServerName<'static>> {
    ServerName::try_from(host.to_string()).map_err(|e| GondolinError::TlsHandshakeFailed(e.to_string()))
}
