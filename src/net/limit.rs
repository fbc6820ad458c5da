//! Concurrent-connection limiter.
//!
//! Each accepted connection carries a semaphore permit that is released when
//! the connection is dropped, so `accept` blocks once `max` connections are
//! alive at the same time.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::Listener;

/// A listener that admits at most `max` live connections.
pub struct LimitListener<L> {
    inner: L,
    slots: Arc<Semaphore>,
    max: usize,
}

impl<L: Listener> LimitListener<L> {
    pub fn new(inner: L, max: usize) -> Self {
        Self {
            inner,
            slots: Arc::new(Semaphore::new(max.min(Semaphore::MAX_PERMITS))),
            max,
        }
    }

    /// Currently free connection slots.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

impl<L: Listener> Listener for LimitListener<L> {
    type Io = LimitedConn<L::Io>;

    async fn accept(&mut self) -> io::Result<(Self::Io, SocketAddr)> {
        // Acquire the slot before accepting so a full server leaves
        // connections queued in the kernel backlog.
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| io::Error::other("connection limiter closed"))?;
        let (io, peer) = self.inner.accept().await?;
        Ok((LimitedConn { io, _permit: permit }, peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// A connection holding one limiter slot for as long as it lives.
pub struct LimitedConn<T> {
    io: T,
    _permit: OwnedSemaphorePermit,
}

impl<T: AsyncRead + Unpin> AsyncRead for LimitedConn<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for LimitedConn<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Network;
    use std::time::Duration;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn accept_blocks_at_limit_until_release() {
        let inner = crate::net::bind(Network::Tcp, "127.0.0.1:0").unwrap();
        let addr = Listener::local_addr(&inner).unwrap();
        let mut listener = LimitListener::new(inner, 1);

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let _c2 = TcpStream::connect(addr).await.unwrap();

        let (first, _) = listener.accept().await.unwrap();
        assert_eq!(listener.available(), 0);

        let blocked = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(blocked.is_err(), "second accept must wait for a free slot");

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(5), listener.accept()).await;
        assert!(second.unwrap().is_ok());
        assert_eq!(listener.max(), 1);
    }
}
