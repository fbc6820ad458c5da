//! Connection handlers and the chain that runs them.
//!
//! A handler is an async function over `&mut Context`. Handlers don't
//! return errors: they report failures by logging or by writing to the
//! connection. The only hard failure boundary is the panic isolation in
//! [`Chain::run`], which keeps a misbehaving handler from taking down the
//! server.
//!
//! ```rust,no_run
//! use tcpkit::{Context, handler_fn};
//! use tokio::io::AsyncWriteExt;
//!
//! let greet = handler_fn(|ctx: &mut Context| {
//!     Box::pin(async move {
//!         let _ = ctx.write_all(b"hello\n").await;
//!     })
//! });
//! ```

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::Cell;
use std::fmt;
use std::future::{Future, poll_fn};
use std::panic::{self, AssertUnwindSafe};
use std::pin::{Pin, pin};
use std::sync::{Arc, Once};

use futures_util::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::context::Context;

/// Future returned by a handler, borrowing the connection's [`Context`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Type-erased, reference-counted connection handler.
pub type Handler =
    Arc<dyn for<'a> Fn(&'a mut Context) -> HandlerFuture<'a> + Send + Sync + 'static>;

/// Wrap a closure as a [`Handler`].
///
/// The closure must return a boxed future; `|ctx| Box::pin(async move { .. })`
/// is the usual shape.
pub fn handler_fn<F>(f: F) -> Handler
where
    F: for<'a> Fn(&'a mut Context) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Default handler: copies everything read back to the peer until EOF.
pub fn echo() -> Handler {
    handler_fn(|ctx| Box::pin(echo_connection(ctx)))
}

async fn echo_connection(ctx: &mut Context) {
    let peer = ctx.peer_addr();
    debug!(peer = ?peer, "echo: incoming connection");

    let mut buf = [0u8; 4096];
    let mut copied = 0u64;
    loop {
        let n = match ctx.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(peer = ?peer, copied, error = %e, "echo: read failed");
                return;
            }
        };
        let written = match ctx.write_all(&buf[..n]).await {
            Ok(()) => ctx.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(peer = ?peer, copied, error = %e, "echo: write failed");
            return;
        }
        copied += n as u64;
    }
    debug!(peer = ?peer, copied, "echo: peer closed connection");
}

/// A handler that panicked while serving a connection.
#[derive(Debug)]
pub struct HandlerPanic {
    /// Position of the panicking handler in the chain.
    pub index: usize,
    pub message: String,
    /// Captured where the handler panicked.
    pub backtrace: Backtrace,
}

impl fmt::Display for HandlerPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler #{} panicked: {}", self.index, self.message)
    }
}

impl std::error::Error for HandlerPanic {}

/// Ordered handlers run sequentially over one connection.
#[derive(Clone)]
pub struct Chain {
    handlers: Arc<[Handler]>,
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain").field("len", &self.handlers.len()).finish()
    }
}

impl Chain {
    pub fn new(handlers: impl Into<Arc<[Handler]>>) -> Self {
        Self {
            handlers: handlers.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run every handler in index order against `ctx`.
    ///
    /// A panic stops the chain; the remaining handlers are skipped and the
    /// panic is returned instead of unwinding further.
    pub async fn run(&self, ctx: &mut Context) -> Result<(), HandlerPanic> {
        install_panic_hook();
        for (index, handler) in self.handlers.iter().enumerate() {
            let mut call = pin!(async { handler(&mut *ctx).await });
            let traced = poll_fn(|cx| {
                let _scope = PanicScope::enter();
                call.as_mut().poll(cx)
            });
            let outcome = AssertUnwindSafe(traced).catch_unwind().await;
            if let Err(payload) = outcome {
                // The unwind ends on the polling thread, so the hook's trace is here.
                let backtrace = PANIC_TRACE
                    .with(Cell::take)
                    .unwrap_or_else(Backtrace::force_capture);
                return Err(HandlerPanic {
                    index,
                    message: panic_message(payload.as_ref()),
                    backtrace,
                });
            }
        }
        Ok(())
    }
}

thread_local! {
    static IN_HANDLER: Cell<bool> = const { Cell::new(false) };
    static PANIC_TRACE: Cell<Option<Backtrace>> = const { Cell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a hook in front of the existing one that records a backtrace for
/// panics raised while a handler is being polled.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if IN_HANDLER.try_with(Cell::get).unwrap_or(false) {
                let _ = PANIC_TRACE.try_with(|t| t.set(Some(Backtrace::force_capture())));
            }
            previous(info);
        }));
    });
}

/// Marks the current thread as polling a handler until dropped.
struct PanicScope {
    outer: bool,
}

impl PanicScope {
    fn enter() -> Self {
        Self {
            outer: IN_HANDLER.with(|f| f.replace(true)),
        }
    }
}

impl Drop for PanicScope {
    fn drop(&mut self) {
        IN_HANDLER.with(|f| f.set(self.outer));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
