//! Abstracts the virtio-net-like backend: a bidirectional stream of
//! Ethernet frames. The core assumes nothing about queue depth, ring
//! layout or batching beyond "write a frame" / "await the next frame".

use async_trait::async_trait;
use gondolin_common::error::GondolinResult;

#[async_trait]
pub trait FrameIo: Send {
    /// Blocks (cooperatively) until the next frame from the guest is
    /// available, or returns `None` once the link is closed.
    async fn recv(&mut self) -> GondolinResult<Option<Vec<u8>>>;

    /// Sends one frame to the guest.
    async fn send(&mut self, frame: &[u8]) -> GondolinResult<()>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::VecDeque;

    /// An in-memory [`FrameIo`] driven by a fixed inbound queue, recording
    /// every outbound frame for assertions.
    pub struct MemoryLink {
        pub inbound: VecDeque<Vec<u8>>,
        pub outbound: Vec<Vec<u8>>,
    }

    impl MemoryLink {
        pub fn new(inbound: Vec<Vec<u8>>) -> Self {
            Self { inbound: inbound.into(), outbound: Vec::new() }
        }
    }

    #[async_trait]
    impl FrameIo for MemoryLink {
        async fn recv(&mut self) -> GondolinResult<Option<Vec<u8>>> {
            Ok(self.inbound.pop_front())
        }

        async fn send(&mut self, frame: &[u8]) -> GondolinResult<()> {
            self.outbound.push(frame.to_vec());
            Ok(())
        }
    }
}
