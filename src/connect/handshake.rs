use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error;
use crate::util::Escape;

/// The proxy stream while a negotiation runs on it.
///
/// Every read and write is bounded by the read timeout on its own; the
/// budget is not shared across steps.
pub(super) struct Handshake<'a, S> {
    io: &'a mut S,
    read_timeout: Option<Duration>,
}

impl<'a, S> Handshake<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(super) fn new(io: &'a mut S, read_timeout: Option<Duration>) -> Self {
        Handshake { io, read_timeout }
    }

    pub(super) async fn send(&mut self, buf: &[u8]) -> crate::Result<()> {
        log::trace!("handshake send {:?}", Escape::new(buf));
        let io = &mut *self.io;
        step(self.read_timeout, async move {
            io.write_all(buf).await?;
            io.flush().await
        })
        .await
    }

    /// Reads exactly `buf.len()` bytes, an early EOF is a lost connection.
    pub(super) async fn recv_exact(&mut self, buf: &mut [u8]) -> crate::Result<()> {
        step(self.read_timeout, self.io.read_exact(buf)).await?;
        log::trace!("handshake recv {:?}", Escape::new(buf));
        Ok(())
    }

    /// Reads whatever is available into the spare capacity of `buf`.
    pub(super) async fn recv_buf(&mut self, buf: &mut BytesMut) -> crate::Result<usize> {
        let n = step(self.read_timeout, self.io.read_buf(buf)).await?;
        log::trace!("handshake recv {n} bytes");
        Ok(n)
    }
}

async fn step<F, T>(timeout: Option<Duration>, fut: F) -> crate::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    let res = match timeout {
        Some(dur) => tokio::time::timeout(dur, fut)
            .await
            .map_err(|_| error::read_timeout())?,
        None => fut.await,
    };
    res.map_err(error::handshake_io)
}
