//! Background serving with an observable, idempotent shutdown.
//!
//! ```text
//! idle ──start──▶ serving ──accept loop returns──▶ done
//!   │                                              ▲
//!   └──────────── bind / config failure ───────────┘
//! ```
//!
//! A [`Graceful`] distinguishes "closed by the caller" from "failed": once
//! [`Graceful::close`] has run, the terminal result is `Ok(())` no matter
//! what the accept loop returned.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::ServerError;

/// Terminal result shared by every observer.
pub type Outcome = Result<(), Arc<ServerError>>;

/// Run-once close guard for a listener.
///
/// The flag is set before the close signal is sent, so an accept loop that
/// wakes up on the signal always sees the flag.
#[derive(Debug, Clone)]
pub(crate) struct Closer {
    inner: Arc<CloserInner>,
}

#[derive(Debug)]
struct CloserInner {
    closed: AtomicBool,
    signal: watch::Sender<bool>,
}

impl Closer {
    pub(crate) fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            inner: Arc::new(CloserInner {
                closed: AtomicBool::new(false),
                signal,
            }),
        }
    }

    /// Set the closed flag and wake the accept loop. Returns `false` if
    /// this closer had already been closed.
    pub(crate) fn close(&self) -> bool {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.inner.signal.send_replace(true);
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub(crate) async fn closed(&self) {
        let mut rx = self.inner.signal.subscribe();
        // The sender lives in `self`, so this only returns once the flag is up.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Handle to a server running in the background.
///
/// Cloning is cheap; all clones observe and control the same server.
#[derive(Debug, Clone)]
pub struct Graceful {
    inner: Arc<GraceState>,
}

#[derive(Debug)]
struct GraceState {
    closer: Closer,
    done: watch::Receiver<Option<Outcome>>,
    local_addr: Option<SocketAddr>,
}

impl Graceful {
    /// Handle that is already done with `err`; used when setup fails before
    /// anything is served.
    pub(crate) fn failed(err: ServerError) -> Self {
        warn!(error = %err, "server failed to start");
        let (_tx, done) = watch::channel(Some(Err(Arc::new(err))));
        Self {
            inner: Arc::new(GraceState {
                closer: Closer::new(),
                done,
                local_addr: None,
            }),
        }
    }

    /// Spawn `serve` on the runtime and track its result.
    ///
    /// `serve` receives the closer it must honour; its return value becomes
    /// the terminal result unless [`close`](Self::close) ran first.
    pub(crate) fn spawn<F, Fut>(local_addr: Option<SocketAddr>, serve: F) -> Self
    where
        F: FnOnce(Closer) -> Fut,
        Fut: Future<Output = Result<(), ServerError>> + Send + 'static,
    {
        let closer = Closer::new();
        let (tx, done) = watch::channel(None);
        let task = serve(closer.clone());
        let task_closer = closer.clone();

        tokio::spawn(async move {
            let result = task.await;
            let outcome = settle(task_closer.is_closed(), result);
            match &outcome {
                Ok(()) => info!("server stopped"),
                Err(e) => error!(error = %e, "server stopped with error"),
            }
            tx.send_replace(Some(outcome));
        });

        Self {
            inner: Arc::new(GraceState {
                closer,
                done,
                local_addr,
            }),
        }
    }

    /// Stop accepting connections. Only the first call has any effect;
    /// in-flight connections are left to finish on their own.
    pub fn close(&self) {
        if self.inner.closer.close() {
            debug!(address = ?self.inner.local_addr, "closing listener");
        }
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closer.is_closed()
    }

    /// Wait for the server to stop and return its terminal result.
    ///
    /// Any number of tasks may wait at once; each receives the same result,
    /// and calls made after the server stopped return immediately.
    pub async fn done(&self) -> Outcome {
        let mut done = self.inner.done.clone();
        match done.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Ok(())),
            Err(_) => Err(Arc::new(ServerError::Aborted)),
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.borrow().is_some()
    }

    /// The terminal error, if the server has stopped with one.
    pub fn error(&self) -> Option<Arc<ServerError>> {
        match &*self.inner.done.borrow() {
            Some(Err(e)) => Some(Arc::clone(e)),
            _ => None,
        }
    }

    /// Address the listener was bound to; `None` if setup failed.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }
}

// A close requested by the caller is never a failure.
fn settle(closed: bool, result: Result<(), ServerError>) -> Outcome {
    if closed {
        Ok(())
    } else {
        result.map_err(Arc::new)
    }
}
