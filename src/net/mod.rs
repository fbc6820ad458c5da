//! Listener abstraction and socket setup.
//!
//! # Data Flow
//! ```text
//! ServerConfig (network, addr)
//!     → bind()              (resolve + bind a tokio TcpListener)
//!     → limit::LimitListener (optional concurrent-connection cap)
//!     → accept loop         (server::accept)
//!     → tls::acceptor       (handshake inside the connection task)
//! ```

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::config::Network;
use crate::error::ServerError;

pub mod limit;
pub mod tls;

pub use limit::{LimitListener, LimitedConn};

/// A bidirectional byte stream a [`Context`](crate::Context) can own.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased connection stream.
pub type BoxedIo = Box<dyn Io>;

/// A bound socket that yields connections.
///
/// The accept loop owns its listener for its whole lifetime and drops it
/// when the loop exits; dropping is what releases the socket.
pub trait Listener: Send + 'static {
    /// Stream type yielded for each accepted connection.
    type Io: Io;

    /// Waits for the next connection.
    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Io, SocketAddr)>> + Send;

    /// Address the listener is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Listener for TcpListener {
    type Io = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Binds a tokio listener for `network` on `addr`.
///
/// Candidates are tried in resolution order; the last bind error is
/// returned when none succeeds. Must be called from within a Tokio runtime.
/// Hostnames are resolved with the blocking system resolver; prefer
/// [`bind_async`] from async code.
///
/// # Errors
///
/// - [`ServerError::Config`] if `addr` cannot be resolved for `network`.
/// - [`ServerError::Bind`] if the address is in use or not permitted.
pub fn bind(network: Network, addr: &str) -> Result<TcpListener, ServerError> {
    let candidates = network.resolve(addr)?;
    bind_first(network, addr, candidates)
}

/// Like [`bind`], resolving `addr` without blocking the runtime.
pub async fn bind_async(network: Network, addr: &str) -> Result<TcpListener, ServerError> {
    let candidates = network.lookup(addr).await?;
    bind_first(network, addr, candidates)
}

fn bind_first(
    network: Network,
    addr: &str,
    candidates: Vec<SocketAddr>,
) -> Result<TcpListener, ServerError> {
    let mut last_err = None;
    for candidate in candidates {
        match bind_one(candidate) {
            Ok(listener) => {
                debug!(address = %candidate, network = %network, "listener bound");
                return Ok(listener);
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(ServerError::Bind {
        addr: addr.to_owned(),
        source: last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable)),
    })
}

fn bind_one(addr: SocketAddr) -> io::Result<TcpListener> {
    let std_listener = std::net::TcpListener::bind(addr)?;
    std_listener.set_nonblocking(true)?;
    TcpListener::from_std(std_listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;

    #[tokio::test]
    async fn binds_ephemeral_port() {
        let listener = bind(Network::Tcp4, "127.0.0.1:0").unwrap();
        let addr = Listener::local_addr(&listener).unwrap();
        assert!(addr.is_ipv4());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn address_in_use_is_bind_error() {
        let first = bind(Network::Tcp, "127.0.0.1:0").unwrap();
        let taken = Listener::local_addr(&first).unwrap().to_string();
        match bind(Network::Tcp, &taken) {
            Err(ServerError::Bind { addr, source }) => {
                assert_eq!(addr, taken);
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
            }
            other => panic!("expected bind error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unresolvable_address_is_config_error() {
        let err = bind(Network::Tcp, "nonsense").unwrap_err();
        assert!(matches!(err, ServerError::Config(ConfigError::InvalidAddress { .. })));
    }

    #[tokio::test]
    async fn async_bind_accepts_hostnames() {
        let listener = bind_async(Network::Tcp4, "localhost:0").await.unwrap();
        let addr = Listener::local_addr(&listener).unwrap();
        assert!(addr.ip().is_loopback());

        let err = bind_async(Network::Tcp, "nonsense").await.unwrap_err();
        assert!(matches!(err, ServerError::Config(ConfigError::InvalidAddress { .. })));
    }

    #[tokio::test]
    async fn accept_through_trait() {
        let mut listener = bind(Network::Tcp, "127.0.0.1:0").unwrap();
        let addr = Listener::local_addr(&listener).unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (_stream, peer) = Listener::accept(&mut listener).await.unwrap();
        let client = client.await.unwrap().unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    }
}
