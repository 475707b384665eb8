//! Opens the real connection to an admitted origin: the "host HTTP
//! client" and "host TLS client" external interfaces. The interceptor
//! above this layer works on raw, possibly-rewritten bytes rather than
//! structured requests, so upstream connections are plain byte streams —
//! a [`tokio::net::TcpStream`] for plaintext HTTP, or that stream wrapped
//! in a [`tokio_rustls::client::TlsStream`] for MITM'd TLS — rather than
//! a higher-level HTTP client.

use gondolin_common::error::{GondolinError, GondolinResult};
use gondolin_tls::mitm;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{self, AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// A live byte stream to an origin, already past admission and (for the
/// TLS case) already past certificate validation. Implements
/// [`AsyncRead`]/[`AsyncWrite`] directly so the HTTP interceptor can
/// drive either variant without matching on it.
pub enum UpstreamConnection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamConnection {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamConnection::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamConnection::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamConnection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamConnection::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamConnection::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamConnection::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamConnection::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamConnection::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamConnection::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Opens a plain TCP connection to `addr`.
pub async fn connect_plain(addr: SocketAddr) -> GondolinResult<UpstreamConnection> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| GondolinError::UpstreamConnectFailed(e.to_string()))?;
    stream.set_nodelay(true).ok();
    Ok(UpstreamConnection::Plain(stream))
}

/// Opens a TLS connection to `addr`, validating the origin's certificate
/// chain against the platform's native root store under `sni`. This is a
/// normal TLS client: the origin's certificate is fully verified, only
/// the guest-facing side of the proxy is ever intercepted.
pub async fn connect_tls(addr: SocketAddr, sni: &str) -> GondolinResult<UpstreamConnection> {
    let connector = mitm::upstream_connector()?;
    let server_name = mitm::server_name(sni)?;
    let tcp = TcpStream::connect(addr)
        .await
        .map_err(|e| GondolinError::UpstreamConnectFailed(e.to_string()))?;
    tcp.set_nodelay(true).ok();
    let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| GondolinError::TlsHandshakeFailed(e.to_string()))?;
    Ok(UpstreamConnection::Tls(Box::new(tls)))
}
