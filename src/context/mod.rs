//! Per-connection context: stream access, optional buffering and a
//! connection-scoped key/value store.
//!
//! A [`Context`] implements [`AsyncRead`] and [`AsyncWrite`], so handlers use
//! the usual `tokio::io::{AsyncReadExt, AsyncWriteExt}` helpers on it. Reads
//! and writes go through the configured buffers; [`Context::io_mut`] gives
//! raw access to the underlying stream for anything the buffers don't cover.
//!
//! Contexts are recycled through a [`ContextPool`]; see [`pool`].

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{self, Poll, ready};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::config::BufferSize;
use crate::net::{BoxedIo, Io};

mod buffer;
pub mod pool;

use buffer::{ReadBuffer, WriteBuffer};
pub use pool::ContextPool;

/// Connection-scoped key/value store.
///
/// Keys are strings; values are [`serde_json::Value`]s, so anything
/// serializable can be stored and read back with [`Values::get_as`].
/// Last write wins per key.
#[derive(Debug, Default, Clone)]
pub struct Values {
    map: HashMap<String, Value>,
}

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous one for `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.map.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    /// Deserialize the value stored under `key`.
    pub fn get_as<T>(&self, key: &str) -> Option<Result<T, serde_json::Error>>
    where
        T: serde::de::DeserializeOwned,
    {
        self.map.get(key).map(|value| T::deserialize(value))
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.map.remove(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn clear(&mut self) {
        self.map.clear();
    }
}

/// Per-connection handling state.
///
/// Owns exactly one live connection between [`attach`](Self::attach) and
/// [`reset`](Self::reset). Every handler in the chain receives the same
/// `&mut Context`.
#[derive(Default)]
pub struct Context {
    io: Option<BoxedIo>,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    reader: Option<ReadBuffer>,
    writer: Option<WriteBuffer>,
    buffered_read: bool,
    buffered_write: bool,
    // Allocated on first `set`.
    values: Option<Values>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("connected", &self.io.is_some())
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("buffered_read", &self.buffered_read)
            .field("buffered_write", &self.buffered_write)
            .field("values", &self.values)
            .finish()
    }
}

impl Context {
    /// Create an empty, unattached context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind this context to a freshly accepted connection.
    ///
    /// Existing buffers are reused when their size matches the requested
    /// one.
    pub fn attach(
        &mut self,
        io: impl Io,
        peer_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
        read_buffer: BufferSize,
        write_buffer: BufferSize,
    ) {
        self.io = Some(Box::new(io));
        self.peer_addr = peer_addr;
        self.local_addr = local_addr;

        self.buffered_read = match read_buffer.capacity() {
            Some(size) => {
                if self.reader.as_ref().is_none_or(|r| r.capacity() != size) {
                    self.reader = Some(ReadBuffer::with_capacity(size));
                }
                true
            }
            None => false,
        };
        self.buffered_write = match write_buffer.capacity() {
            Some(size) => {
                if self.writer.as_ref().is_none_or(|w| w.capacity() != size) {
                    self.writer = Some(WriteBuffer::with_capacity(size));
                }
                true
            }
            None => false,
        };
    }

    /// Detach the connection and clear all per-connection state.
    ///
    /// Dropping the stream closes it without flushing; call
    /// [`close`](Self::close) first to deliver buffered output.
    pub fn reset(&mut self) {
        self.io = None;
        self.peer_addr = None;
        self.local_addr = None;
        if let Some(reader) = self.reader.as_mut() {
            reader.clear();
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.clear();
        }
        self.buffered_read = false;
        self.buffered_write = false;
        if let Some(values) = self.values.as_mut() {
            values.clear();
        }
    }

    /// Returns `true` while a connection is attached and not yet closed.
    pub fn is_connected(&self) -> bool {
        self.io.is_some()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_read_buffered(&self) -> bool {
        self.buffered_read
    }

    pub fn is_write_buffered(&self) -> bool {
        self.buffered_write
    }

    /// Number of bytes written but not yet flushed.
    pub fn pending_output(&self) -> usize {
        match &self.writer {
            Some(writer) if self.buffered_write => writer.len(),
            _ => 0,
        }
    }

    /// Raw access to the underlying stream, bypassing the buffers.
    pub fn io_mut(&mut self) -> Option<&mut (dyn Io + 'static)> {
        self.io.as_deref_mut()
    }

    /// Flush buffered output and close the connection.
    ///
    /// The stream is shut down and released even if the flush fails; the
    /// flush error is reported in preference to the shutdown error. Closing
    /// an already closed context is a no-op.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.io.is_none() {
            return Ok(());
        }
        let flushed = self.flush().await;

        let Some(mut io) = self.io.take() else {
            return flushed;
        };
        let shut = io.shutdown().await;
        if let Some(writer) = self.writer.as_mut() {
            writer.clear();
        }
        flushed.and(shut)
    }

    /// Store `value` under `key` for the rest of this connection.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.get_or_insert_with(Values::new).insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.as_ref().and_then(|values| values.get(key))
    }

    /// Deserialize the value stored under `key`.
    pub fn get_as<T>(&self, key: &str) -> Option<Result<T, serde_json::Error>>
    where
        T: serde::de::DeserializeOwned,
    {
        self.values.as_ref().and_then(|values| values.get_as(key))
    }

    pub fn delete(&mut self, key: &str) -> Option<Value> {
        self.values.as_mut().and_then(|values| values.remove(key))
    }

    /// The key/value store, if anything was ever set on this context.
    pub fn values(&self) -> Option<&Values> {
        self.values.as_ref()
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "context has no open connection")
}

impl AsyncRead for Context {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(io) = this.io.as_mut() else {
            return Poll::Ready(Err(not_connected()));
        };
        let reader = match this.reader.as_mut() {
            Some(reader) if this.buffered_read => reader,
            _ => return Pin::new(io).poll_read(cx, buf),
        };

        // Large reads skip the buffer when it holds nothing.
        if reader.is_empty() && buf.remaining() >= reader.capacity() {
            return Pin::new(io).poll_read(cx, buf);
        }

        let available = ready!(reader.poll_fill(io, cx))?;
        let n = available.len().min(buf.remaining());
        buf.put_slice(&available[..n]);
        reader.consume(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Context {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some(io) = this.io.as_mut() else {
            return Poll::Ready(Err(not_connected()));
        };
        match this.writer.as_mut() {
            Some(writer) if this.buffered_write => writer.poll_write(io, cx, data),
            _ => Pin::new(io).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(io) = this.io.as_mut() else {
            return Poll::Ready(Err(not_connected()));
        };
        if let Some(writer) = this.writer.as_mut() {
            if this.buffered_write {
                ready!(writer.poll_drain(io, cx))?;
            }
        }
        Pin::new(io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(io) = this.io.as_mut() else {
            return Poll::Ready(Err(not_connected()));
        };
        if let Some(writer) = this.writer.as_mut() {
            if this.buffered_write {
                ready!(writer.poll_drain(io, cx))?;
            }
        }
        Pin::new(io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tokio::io::{AsyncReadExt, DuplexStream, duplex};

    fn attached(read: BufferSize, write: BufferSize) -> (Context, DuplexStream) {
        let (server, client) = duplex(64 * 1024);
        let mut ctx = Context::new();
        ctx.attach(server, None, None, read, write);
        (ctx, client)
    }

    #[tokio::test]
    async fn reads_exactly_in_both_modes() {
        for mode in [BufferSize::Unbuffered, BufferSize::Size(4096), BufferSize::Size(2)] {
            let (mut ctx, mut client) = attached(mode, BufferSize::Unbuffered);
            client.write_all(b"Hello").await.unwrap();

            let mut got = [0u8; 5];
            ctx.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, b"Hello", "mode {mode:?}");
        }
    }

    #[tokio::test]
    async fn buffered_write_is_held_until_flush() {
        let (mut ctx, mut client) = attached(BufferSize::Unbuffered, BufferSize::Size(4096));
        ctx.write_all(b"Hello").await.unwrap();
        assert_eq!(ctx.pending_output(), 5);

        let mut peek = [0u8; 5];
        let early = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            client.read(&mut peek),
        )
        .await;
        assert!(early.is_err(), "nothing may reach the peer before flush");

        ctx.flush().await.unwrap();
        assert_eq!(ctx.pending_output(), 0);
        client.read_exact(&mut peek).await.unwrap();
        assert_eq!(&peek, b"Hello");
    }

    #[tokio::test]
    async fn overflowing_write_flushes_first() {
        let (mut ctx, mut client) = attached(BufferSize::Unbuffered, BufferSize::Size(4));
        ctx.write_all(b"abc").await.unwrap();
        ctx.write_all(b"defgh").await.unwrap();
        assert_eq!(ctx.pending_output(), 0);

        let mut got = [0u8; 8];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"abcdefgh");
    }

    #[tokio::test]
    async fn close_flushes_then_signals_eof() {
        let (mut ctx, mut client) = attached(BufferSize::Size(16), BufferSize::Size(16));
        ctx.write_all(b"Hello").await.unwrap();
        ctx.close().await.unwrap();
        assert!(!ctx.is_connected());

        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"Hello");

        // Idempotent; I/O after close fails.
        ctx.close().await.unwrap();
        let err = ctx.write(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn eof_is_zero_length_read() {
        let (mut ctx, client) = attached(BufferSize::Size(8), BufferSize::Unbuffered);
        drop(client);
        let mut buf = [0u8; 4];
        assert_eq!(ctx.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn raw_io_bypasses_pending_output() {
        let (mut ctx, mut client) = attached(BufferSize::Unbuffered, BufferSize::Size(64));
        ctx.write_all(b"queued").await.unwrap();
        assert_eq!(ctx.pending_output(), 6);

        let raw = ctx.io_mut().expect("attached context exposes its stream");
        raw.write_all(b"raw:").await.unwrap();
        raw.flush().await.unwrap();
        assert_eq!(ctx.pending_output(), 6);

        ctx.flush().await.unwrap();
        let mut got = [0u8; 10];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"raw:queued");

        ctx.close().await.unwrap();
        assert!(ctx.io_mut().is_none());
    }

    #[test]
    fn values_are_lazy_and_last_write_wins() {
        let mut ctx = Context::new();
        assert!(ctx.values().is_none());
        assert!(ctx.get("user").is_none());
        assert!(ctx.delete("user").is_none());

        ctx.set("user", "alice");
        ctx.set("user", "bob");
        ctx.set("hits", 3);
        assert_eq!(ctx.get("user"), Some(&Value::from("bob")));
        assert_eq!(ctx.values().map(Values::len), Some(2));

        assert_eq!(ctx.delete("hits"), Some(Value::from(3)));
        assert!(ctx.get("hits").is_none());
    }

    #[test]
    fn typed_values_round_trip() {
        #[derive(Debug, PartialEq, Deserialize)]
        struct Session {
            id: u32,
            name: String,
        }

        let mut ctx = Context::new();
        ctx.set("session", serde_json::json!({ "id": 7, "name": "x" }));
        let session: Session = ctx.get_as("session").unwrap().unwrap();
        assert_eq!(session, Session { id: 7, name: "x".into() });
        assert!(ctx.get_as::<u32>("session").unwrap().is_err());
        assert!(ctx.get_as::<u32>("missing").is_none());
    }

    #[tokio::test]
    async fn reset_leaves_no_residue() {
        let (mut ctx, mut client) = attached(BufferSize::Size(8), BufferSize::Size(8));
        ctx.set("k", true);
        client.write_all(b"0123456789").await.unwrap();
        let mut one = [0u8; 1];
        ctx.read_exact(&mut one).await.unwrap();
        ctx.write_all(b"pending").await.unwrap();

        ctx.reset();
        assert!(!ctx.is_connected());
        assert!(ctx.get("k").is_none());
        assert_eq!(ctx.pending_output(), 0);

        let (server, mut client) = duplex(1024);
        ctx.attach(server, None, None, BufferSize::Size(8), BufferSize::Size(8));
        client.write_all(b"fresh").await.unwrap();
        let mut got = [0u8; 5];
        ctx.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"fresh");
    }
}
