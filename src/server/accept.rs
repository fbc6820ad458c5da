//! The accept loop: accept, classify failures, back off, dispatch.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::Dispatcher;
use super::graceful::Closer;
use crate::error::ServerError;
use crate::net::Listener;

/// First delay after a transient accept failure.
pub const MIN_BACKOFF: Duration = Duration::from_millis(5);

/// Upper bound for the accept backoff.
pub const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Exponential backoff for transient accept errors: zero after a success,
/// then 5ms, doubling per consecutive failure, capped at 1s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance to, and return, the next delay.
    pub fn next_delay(&mut self) -> Duration {
        self.current = if self.current.is_zero() {
            MIN_BACKOFF
        } else {
            (self.current * 2).min(MAX_BACKOFF)
        };
        self.current
    }

    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

/// Whether an accept error is worth retrying.
///
/// Covers aborted/reset handshakes, interrupted or timed-out calls, and
/// descriptor or memory exhaustion.
pub fn is_transient(err: &io::Error) -> bool {
    use io::ErrorKind::*;

    if matches!(
        err.kind(),
        ConnectionAborted
            | ConnectionReset
            | ConnectionRefused
            | Interrupted
            | WouldBlock
            | TimedOut
    ) {
        return true;
    }
    matches!(err.raw_os_error(), Some(code) if EXHAUSTION_ERRNOS.contains(&code))
}

// ENOMEM, ENFILE, EMFILE, ENOBUFS.
#[cfg(target_os = "linux")]
const EXHAUSTION_ERRNOS: &[i32] = &[12, 23, 24, 105];
#[cfg(all(unix, not(target_os = "linux")))]
const EXHAUSTION_ERRNOS: &[i32] = &[12, 23, 24, 55];
// WSAEMFILE, WSAENOBUFS.
#[cfg(windows)]
const EXHAUSTION_ERRNOS: &[i32] = &[10024, 10055];
#[cfg(not(any(unix, windows)))]
const EXHAUSTION_ERRNOS: &[i32] = &[];

/// Accept connections from `listener` until it fails or `closer` fires.
///
/// Each connection is handed to `dispatcher` on its own task; the loop
/// never waits for a handler. Returns `Ok(())` when the listener was closed
/// through `closer`, including when the close races with a fatal accept
/// error.
pub(crate) async fn accept_loop<L: Listener>(
    mut listener: L,
    dispatcher: Arc<Dispatcher>,
    closer: Closer,
) -> Result<(), ServerError> {
    let local_addr = listener.local_addr().ok();
    let mut backoff = Backoff::new();

    loop {
        let accepted = tokio::select! {
            biased;
            () = closer.closed() => return Ok(()),
            res = listener.accept() => res,
        };

        match accepted {
            Ok((io, peer)) => {
                backoff.reset();
                debug!(peer = %peer, "connection accepted");
                dispatcher.dispatch(io, peer, local_addr);
            }
            Err(e) if is_transient(&e) => {
                let delay = backoff.next_delay();
                dispatcher
                    .error_log()
                    .warn(format_args!("accept error: {e}; retrying in {delay:?}"));
                tokio::select! {
                    biased;
                    () = closer.closed() => return Ok(()),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(_) if closer.is_closed() => return Ok(()),
            Err(e) => return Err(ServerError::Accept(e)),
        }
    }
}
