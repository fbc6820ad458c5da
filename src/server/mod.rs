//! Server entry points and per-connection dispatch.
//!
//! [`Server`] holds the configuration surface. Its blocking entry points
//! (`listen_and_serve*`, `serve*`) run the accept loop on the caller's task
//! and only return when it stops; the `start*` entry points run it in the
//! background and hand back a [`Graceful`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use crate::config::{BufferSize, ConnLimit, Resolved, ServerConfig};
use crate::context::{Context, ContextPool};
use crate::error::ServerError;
use crate::handler::{Chain, Handler, HandlerFuture, echo, handler_fn};
use crate::logging::ErrorLog;
use crate::net::{self, Io, LimitListener, Listener, tls};

pub mod accept;
pub mod graceful;

use accept::accept_loop;
use graceful::Closer;
pub use graceful::{Graceful, Outcome};

/// A configurable TCP server running a chain of connection handlers.
///
/// A server with no handlers echoes every connection back to its peer.
///
/// # Examples
///
/// ```rust,no_run
/// use tcpkit::{Server, ServerConfig};
/// use tokio::io::AsyncWriteExt;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     Server::new(ServerConfig::with_addr("127.0.0.1:7000"))
///         .handler(|ctx| {
///             Box::pin(async move {
///                 let _ = ctx.write_all(b"hello\n").await;
///             })
///         })
///         .listen_and_serve()
///         .await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Server {
    config: ServerConfig,
    handlers: Vec<Handler>,
    tls: Option<Arc<rustls::ServerConfig>>,
    error_log: ErrorLog,
    pool: Arc<ContextPool>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("handlers", &self.handlers.len())
            .field("tls", &self.tls.is_some())
            .field("error_log", &self.error_log)
            .finish_non_exhaustive()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            handlers: Vec::new(),
            tls: None,
            error_log: ErrorLog::default(),
            pool: Arc::new(ContextPool::default()),
        }
    }

    /// Append a handler closure to the chain.
    pub fn handler<F>(self, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut Context) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        self.with_handler(handler_fn(f))
    }

    /// Append an already type-erased handler to the chain.
    pub fn with_handler(mut self, handler: Handler) -> Self {
        self.handlers.push(handler);
        self
    }

    /// TLS configuration used when no certificate/key files are passed to a
    /// TLS entry point. Certificate resolvers are set on the rustls config.
    pub fn tls_config(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    pub fn error_log(mut self, log: ErrorLog) -> Self {
        self.error_log = log;
        self
    }

    /// Share a context pool between servers.
    pub fn context_pool(mut self, pool: Arc<ContextPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address and serve plain TCP until the accept
    /// loop fails.
    ///
    /// # Errors
    ///
    /// This only returns with an error: [`ServerError::Config`] before
    /// anything is bound, [`ServerError::Bind`], or the fatal
    /// [`ServerError::Accept`] that stopped the loop.
    pub async fn listen_and_serve(&self) -> Result<(), ServerError> {
        let (resolved, dispatcher) = self.prepare(None)?;
        let listener = net::bind_async(resolved.network, &resolved.addr).await?;
        run(listener, resolved.limit, dispatcher, Closer::new()).await
    }

    /// Like [`listen_and_serve`](Self::listen_and_serve), terminating TLS on
    /// every connection.
    ///
    /// A non-empty `cert_file`/`key_file` pair is loaded from PEM; two empty
    /// paths use the config set with [`tls_config`](Self::tls_config).
    pub async fn listen_and_serve_tls(
        &self,
        cert_file: &str,
        key_file: &str,
    ) -> Result<(), ServerError> {
        let (resolved, dispatcher) = self.prepare(Some((cert_file, key_file)))?;
        let listener = net::bind_async(resolved.network, &resolved.addr).await?;
        run(listener, resolved.limit, dispatcher, Closer::new()).await
    }

    /// Serve plain TCP on a listener supplied by the caller. The configured
    /// network and address are ignored.
    pub async fn serve<L: Listener>(&self, listener: L) -> Result<(), ServerError> {
        let (resolved, dispatcher) = self.prepare(None)?;
        run(listener, resolved.limit, dispatcher, Closer::new()).await
    }

    /// Serve TLS on a listener supplied by the caller.
    pub async fn serve_tls<L: Listener>(
        &self,
        listener: L,
        cert_file: &str,
        key_file: &str,
    ) -> Result<(), ServerError> {
        let (resolved, dispatcher) = self.prepare(Some((cert_file, key_file)))?;
        run(listener, resolved.limit, dispatcher, Closer::new()).await
    }

    /// Bind and serve plain TCP in the background.
    ///
    /// Must be called from within a Tokio runtime. Setup failures are
    /// reported through the returned handle, which is then already done.
    /// A hostname address is resolved on the calling thread.
    pub fn start(&self) -> Graceful {
        self.start_with(None)
    }

    /// Bind and serve TLS in the background.
    pub fn start_tls(&self, cert_file: &str, key_file: &str) -> Graceful {
        self.start_with(Some((cert_file, key_file)))
    }

    /// Serve plain TCP on a caller-supplied listener in the background.
    pub fn start_on<L: Listener>(&self, listener: L) -> Graceful {
        match self.prepare(None) {
            Ok((resolved, dispatcher)) => launch(listener, resolved.limit, dispatcher),
            Err(e) => Graceful::failed(e),
        }
    }

    fn start_with(&self, tls: Option<(&str, &str)>) -> Graceful {
        let prepared = self.prepare(tls).and_then(|(resolved, dispatcher)| {
            let listener = net::bind(resolved.network, &resolved.addr)?;
            Ok((listener, resolved.limit, dispatcher))
        });
        match prepared {
            Ok((listener, limit, dispatcher)) => launch(listener, limit, dispatcher),
            Err(e) => Graceful::failed(e),
        }
    }

    /// Validate settings and build the dispatcher. Performs no network I/O.
    fn prepare(
        &self,
        tls: Option<(&str, &str)>,
    ) -> Result<(Resolved, Arc<Dispatcher>), ServerError> {
        let resolved = self.config.resolve()?;
        let acceptor = match tls {
            Some((cert_file, key_file)) => Some(tls::acceptor(tls::select_config(
                self.tls.as_ref(),
                cert_file,
                key_file,
            )?)),
            None => None,
        };

        let chain = if self.handlers.is_empty() {
            Chain::new(vec![echo()])
        } else {
            Chain::new(self.handlers.clone())
        };

        let dispatcher = Dispatcher::new(
            chain,
            resolved.read_buffer,
            resolved.write_buffer,
            acceptor,
            self.error_log.clone(),
        )
        .with_pool(Arc::clone(&self.pool));
        Ok((resolved, Arc::new(dispatcher)))
    }
}

fn launch<L: Listener>(listener: L, limit: ConnLimit, dispatcher: Arc<Dispatcher>) -> Graceful {
    let local_addr = listener.local_addr().ok();
    Graceful::spawn(local_addr, move |closer| run(listener, limit, dispatcher, closer))
}

async fn run<L: Listener>(
    listener: L,
    limit: ConnLimit,
    dispatcher: Arc<Dispatcher>,
    closer: Closer,
) -> Result<(), ServerError> {
    info!(
        address = ?listener.local_addr().ok(),
        tls = dispatcher.tls.is_some(),
        limit = ?limit,
        "server listening"
    );
    match limit {
        ConnLimit::Unlimited => accept_loop(listener, dispatcher, closer).await,
        ConnLimit::Max(max) => {
            accept_loop(LimitListener::new(listener, max), dispatcher, closer).await
        }
    }
}

/// Runs the handler chain for each accepted connection on its own task.
pub(crate) struct Dispatcher {
    chain: Chain,
    pool: Arc<ContextPool>,
    read_buffer: BufferSize,
    write_buffer: BufferSize,
    tls: Option<TlsAcceptor>,
    log: ErrorLog,
}

impl Dispatcher {
    pub(crate) fn new(
        chain: Chain,
        read_buffer: BufferSize,
        write_buffer: BufferSize,
        tls: Option<TlsAcceptor>,
        log: ErrorLog,
    ) -> Self {
        Self {
            chain,
            pool: Arc::new(ContextPool::default()),
            read_buffer,
            write_buffer,
            tls,
            log,
        }
    }

    pub(crate) fn with_pool(mut self, pool: Arc<ContextPool>) -> Self {
        self.pool = pool;
        self
    }

    pub(crate) fn error_log(&self) -> &ErrorLog {
        &self.log
    }

    /// Spawn the connection task. Never waits for the handlers.
    pub(crate) fn dispatch<I: Io>(
        self: &Arc<Self>,
        io: I,
        peer: SocketAddr,
        local_addr: Option<SocketAddr>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.serve_conn(io, peer, local_addr).await });
    }

    async fn serve_conn<I: Io>(&self, io: I, peer: SocketAddr, local_addr: Option<SocketAddr>) {
        let (read, write) = (self.read_buffer, self.write_buffer);
        let mut ctx = self.pool.acquire();
        match &self.tls {
            Some(acceptor) => match acceptor.accept(io).await {
                Ok(stream) => ctx.attach(stream, Some(peer), local_addr, read, write),
                Err(e) => {
                    self.log.warn(format_args!("tls handshake with {peer} failed: {e}"));
                    self.pool.release(ctx);
                    return;
                }
            },
            None => ctx.attach(io, Some(peer), local_addr, read, write),
        }

        if let Err(panic) = self.chain.run(&mut ctx).await {
            self.log.error(format_args!(
                "connection {peer}: {panic}\n{}",
                panic.backtrace
            ));
        }
        if let Err(e) = ctx.close().await {
            self.log.error(format_args!("connection {peer}: close failed: {e}"));
        }
        self.pool.release(ctx);
        debug!(peer = %peer, "connection finished");
    }
}
