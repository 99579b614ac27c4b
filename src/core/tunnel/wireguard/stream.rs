//! Channel-backed virtual TCP stream.
//!
//! The event loop owns the smoltcp socket; probe code holds a
//! [`VirtualStream`] whose reads and writes travel over bounded
//! channels. An empty inbound `Bytes` marks EOF.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

const CHANNEL_DEPTH: usize = 64;

/// Outbound instructions from a stream to the event loop.
#[derive(Debug)]
pub enum StreamMessage {
    Data(Bytes),
    Close,
}

/// The event-loop side of one stream.
pub struct StreamChannels {
    pub inbound_tx: mpsc::Sender<Bytes>,
    pub outbound_rx: mpsc::Receiver<StreamMessage>,
}

pub struct VirtualStream {
    inbound_rx: mpsc::Receiver<Bytes>,
    outbound: PollSender<StreamMessage>,
    /// Unconsumed tail of the last inbound chunk.
    leftover: Option<Bytes>,
    eof: bool,
}

impl VirtualStream {
    pub fn new_pair() -> (VirtualStream, StreamChannels) {
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_DEPTH);
        (
            VirtualStream {
                inbound_rx,
                outbound: PollSender::new(outbound_tx),
                leftover: None,
                eof: false,
            },
            StreamChannels {
                inbound_tx,
                outbound_rx,
            },
        )
    }

    fn fill_from(buf: &mut ReadBuf<'_>, chunk: Bytes) -> Option<Bytes> {
        let n = buf.remaining().min(chunk.len());
        buf.put_slice(&chunk[..n]);
        if n < chunk.len() {
            Some(chunk.slice(n..))
        } else {
            None
        }
    }
}

impl AsyncRead for VirtualStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(chunk) = self.leftover.take() {
            self.leftover = Self::fill_from(buf, chunk);
            return Poll::Ready(Ok(()));
        }
        if self.eof {
            return Poll::Ready(Ok(()));
        }
        match self.inbound_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) if chunk.is_empty() => {
                self.eof = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(chunk)) => {
                self.leftover = Self::fill_from(buf, chunk);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => {
                self.eof = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for VirtualStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.outbound.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let chunk = Bytes::copy_from_slice(data);
                self.outbound
                    .send_item(StreamMessage::Data(chunk))
                    .map_err(|_| closed())?;
                Poll::Ready(Ok(data.len()))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(closed())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        match self.outbound.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let _ = self.outbound.send_item(StreamMessage::Close);
                Poll::Ready(Ok(()))
            }
            // The event loop is gone; nothing left to close.
            Poll::Ready(Err(_)) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "wireguard stream closed")
}
