//! A small incremental reader that turns a raw byte stream into
//! head-then-body chunks for the HTTP interceptor, which otherwise only
//! knows how to parse a head it has already been handed in full.

use gondolin_common::error::{GondolinError, GondolinResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub struct ByteReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> ByteReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, buf: Vec::new() }
    }

    /// Reads until `\r\n\r\n` is seen, returning the head bytes (terminator
    /// included). Returns `Ok(None)` if the peer closed the connection
    /// before any bytes arrived at all (clean end of a keep-alive
    /// connection); any other EOF mid-head is a malformed-packet error.
    pub async fn read_head(&mut self) -> GondolinResult<Option<Vec<u8>>> {
        loop {
            if let Some(pos) = find_double_crlf(&self.buf) {
                let head: Vec<u8> = self.buf.drain(..pos + 4).collect();
                return Ok(Some(head));
            }
            if self.buf.len() > MAX_HEAD_BYTES {
                return Err(GondolinError::MalformedPacket("request head exceeded size cap".into()));
            }
            let mut chunk = [0u8; 4096];
            let n = self.inner.read(&mut chunk).await.map_err(GondolinError::Io)?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(GondolinError::MalformedPacket("connection closed mid-head".into()));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Reads exactly `len` bytes of body, bounded by `MAX_BODY_BYTES`.
    pub async fn read_body(&mut self, len: usize) -> GondolinResult<Vec<u8>> {
        if len > MAX_BODY_BYTES {
            return Err(GondolinError::CapacityExceeded(format!("body of {len} bytes exceeds cap")));
        }
        while self.buf.len() < len {
            let mut chunk = [0u8; 4096];
            let n = self.inner.read(&mut chunk).await.map_err(GondolinError::Io)?;
            if n == 0 {
                return Err(GondolinError::MalformedPacket("connection closed mid-body".into()));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
        Ok(self.buf.drain(..len).collect())
    }
}

impl<R: AsyncWrite + Unpin> ByteReader<R> {
    pub async fn write_all(&mut self, data: &[u8]) -> GondolinResult<()> {
        self.inner.write_all(data).await.map_err(GondolinError::Io)
    }
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn reads_head_split_across_reads() {
        let data = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\nBODYDATA".to_vec();
        let mut reader = ByteReader::new(Cursor::new(data));
        let head = reader.read_head().await.unwrap().unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        let body = reader.read_body(8).await.unwrap();
        assert_eq!(body, b"BODYDATA");
    }

    #[tokio::test]
    async fn clean_eof_before_any_bytes_returns_none() {
        let mut reader = ByteReader::new(Cursor::new(Vec::new()));
        assert!(reader.read_head().await.unwrap().is_none());
    }
}
