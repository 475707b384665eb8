//! Gondolin host agent entry point.
//!
//! Wires a [`gondolin_core::VmSession`] to a length-prefixed Ethernet
//! frame stream on stdio. A real deployment swaps [`StdioFrameIo`] for
//! whatever virtio-net backend the VMM exposes; the session itself makes
//! no assumption about the transport beyond "write frame / await frame".

use async_trait::async_trait;
use gondolin_common::error::{GondolinError, GondolinResult};
use gondolin_core::{FrameIo, GondolinConfig, VmSession};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter, Stdin, Stdout};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const MAX_FRAME_BYTES: usize = 64 * 1024;

struct StdioFrameIo {
    input: BufReader<Stdin>,
    output: BufWriter<Stdout>,
}

impl StdioFrameIo {
    fn new() -> Self {
        Self { input: BufReader::new(tokio::io::stdin()), output: BufWriter::new(tokio::io::stdout()) }
    }
}

#[async_trait]
impl FrameIo for StdioFrameIo {
    async fn recv(&mut self) -> GondolinResult<Option<Vec<u8>>> {
        let mut len_bytes = [0u8; 4];
        match self.input.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(GondolinError::Io(e)),
        }
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(GondolinError::MalformedPacket(format!("frame of {len} bytes exceeds cap")));
        }
        let mut frame = vec![0u8; len];
        self.input.read_exact(&mut frame).await.map_err(GondolinError::Io)?;
        Ok(Some(frame))
    }

    async fn send(&mut self, frame: &[u8]) -> GondolinResult<()> {
        self.output.write_all(&(frame.len() as u32).to_be_bytes()).await.map_err(GondolinError::Io)?;
        self.output.write_all(frame).await.map_err(GondolinError::Io)?;
        self.output.flush().await.map_err(GondolinError::Io)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into())))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("gondolin v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::var("GONDOLIN_CONFIG").unwrap_or_else(|_| "/etc/gondolin/session.json".into());
    let config = GondolinConfig::load(&config_path).unwrap_or_else(|_| {
        tracing::warn!(path = %config_path, "config not found, using defaults");
        GondolinConfig::default()
    });

    let session = Arc::new(VmSession::with_defaults(config)?);
    tracing::info!(ca_cert_len = session.public_ca_cert_pem().len(), "process-local CA ready");

    let link = StdioFrameIo::new();
    session.run(link).await?;

    Ok(())
}
