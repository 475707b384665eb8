//! Process-local CA, bounded leaf-certificate cache, ClientHello/SNI
//! parsing and the TLS MITM acceptor/connector pair.

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod ca;
pub mod cache;
pub mod mitm;
pub mod sni;

pub use ca::{CertificateAuthority, MintedCert};
pub use cache::CertCache;
pub use sni::extract_sni;
