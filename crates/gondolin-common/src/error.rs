//! Shared error taxonomy for the interception plane.

use thiserror::Error;

/// Errors that can surface anywhere along the frame-in, frame-out path.
///
/// Variants map onto the error classes used to decide whether a fault is
/// reset-and-continue (drop the packet, close the flow) or fatal (tear down
/// the whole VM session).
#[derive(Debug, Error)]
pub enum GondolinError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("admission denied: {0}")]
    AdmissionDenied(String),

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("dns resolution failed for {name}: {reason}")]
    DnsResolutionFailed { name: String, reason: String },

    #[error("tls handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("certificate minting failed: {0}")]
    CertMintingFailed(String),

    #[error("upstream connect failed: {0}")]
    UpstreamConnectFailed(String),

    #[error("secret policy violation: secret {secret} not allowlisted for host {host}")]
    SecretPolicyViolation { secret: String, host: String },

    #[error("resource limit exceeded: {0}")]
    CapacityExceeded(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the crate family.
pub type GondolinResult<T> = Result<T, GondolinError>;

impl GondolinError {
    /// Whether this error should tear down the entire VM session rather
    /// than just the flow or packet that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GondolinError::Internal(_) | GondolinError::CertMintingFailed(_))
    }
}
