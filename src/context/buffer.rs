//! Reusable read/write buffers backing a buffered [`Context`](super::Context).
//!
//! Both buffers outlive the connection they serve: on reset they are emptied
//! but keep their allocation, and are reallocated only when the configured
//! size changes.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[derive(Debug)]
pub(crate) struct ReadBuffer {
    buf: Box<[u8]>,
    pos: usize,
    filled: usize,
}

impl ReadBuffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            pos: 0,
            filled: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.filled
    }

    pub(crate) fn clear(&mut self) {
        self.pos = 0;
        self.filled = 0;
    }

    /// Returns buffered bytes, reading from `io` once if none are left.
    /// An empty slice means end of stream.
    pub(crate) fn poll_fill<R>(
        &mut self,
        io: &mut R,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<&[u8]>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if self.is_empty() {
            let mut rb = ReadBuf::new(&mut self.buf);
            ready!(Pin::new(io).poll_read(cx, &mut rb))?;
            self.filled = rb.filled().len();
            self.pos = 0;
        }
        Poll::Ready(Ok(&self.buf[self.pos..self.filled]))
    }

    pub(crate) fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.filled);
    }
}

#[derive(Debug)]
pub(crate) struct WriteBuffer {
    buf: BytesMut,
    capacity: usize,
}

impl WriteBuffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn clear(&mut self) {
        self.buf.clear();
    }

    /// Buffers `data`, flushing pending bytes first when they would overflow.
    /// Writes larger than the buffer go straight to `io`.
    pub(crate) fn poll_write<W>(
        &mut self,
        io: &mut W,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if self.buf.len() + data.len() > self.capacity {
            ready!(self.poll_drain(io, cx))?;
        }
        if data.len() >= self.capacity {
            Pin::new(io).poll_write(cx, data)
        } else {
            self.buf.extend_from_slice(data);
            Poll::Ready(Ok(data.len()))
        }
    }

    /// Writes out every pending byte. Bytes already written are dropped from
    /// the buffer even when a later write fails.
    pub(crate) fn poll_drain<W>(&mut self, io: &mut W, cx: &mut Context<'_>) -> Poll<io::Result<()>>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        while !self.buf.is_empty() {
            match ready!(Pin::new(&mut *io).poll_write(cx, &self.buf)) {
                Ok(0) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write the buffered data",
                    )));
                }
                Ok(n) => self.buf.advance(n),
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
        Poll::Ready(Ok(()))
    }
}
