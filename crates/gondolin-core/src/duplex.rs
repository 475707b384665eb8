//! Adapts one classified TCP flow, which the link task drives through
//! channels, into an `AsyncRead + AsyncWrite` stream a per-connection
//! task (and, for TLS, `rustls`) can read and write like any other
//! socket.

use gondolin_common::flow::FlowKey;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{self, AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// Messages the link task forwards to a connection task for its flow.
pub enum FlowMessage {
    Data(Vec<u8>),
    Closed,
}

/// Commands a connection task sends back to the link task, which is the
/// sole owner of the `NetworkStack` and therefore the only place these
/// can be applied.
pub enum LinkCommand {
    SendData { flow: FlowKey, data: Vec<u8> },
    Close { flow: FlowKey },
}

/// The guest side of one proxied TCP connection. Reads come from the
/// link task via an unbounded channel (already-window-accounted, in
/// order); writes go back the same way. An unbounded internal channel is
/// safe here because TCP flow control toward the guest is enforced by
/// the network stack's own receive-window accounting, not by this
/// channel.
pub struct GuestDuplex {
    flow: FlowKey,
    cmd_tx: mpsc::UnboundedSender<LinkCommand>,
    rx: mpsc::UnboundedReceiver<FlowMessage>,
    pending: VecDeque<u8>,
    eof: bool,
}

impl GuestDuplex {
    pub fn new(
        flow: FlowKey,
        cmd_tx: mpsc::UnboundedSender<LinkCommand>,
        rx: mpsc::UnboundedReceiver<FlowMessage>,
        prebuffered: Vec<u8>,
    ) -> Self {
        Self { flow, cmd_tx, rx, pending: prebuffered.into(), eof: false }
    }
}

impl AsyncRead for GuestDuplex {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.pending.is_empty() {
            let n = buf.remaining().min(this.pending.len());
            let chunk: Vec<u8> = this.pending.drain(..n).collect();
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        if this.eof {
            return Poll::Ready(Ok(()));
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(FlowMessage::Data(bytes))) => {
                let n = buf.remaining().min(bytes.len());
                buf.put_slice(&bytes[..n]);
                if bytes.len() > n {
                    this.pending.extend(bytes[n..].iter().copied());
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(FlowMessage::Closed)) | Poll::Ready(None) => {
                this.eof = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for GuestDuplex {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.cmd_tx
            .send(LinkCommand::SendData { flow: this.flow, data: buf.to_vec() })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "link task gone"))?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.cmd_tx.send(LinkCommand::Close { flow: this.flow }).ok();
        Poll::Ready(Ok(()))
    }
}
