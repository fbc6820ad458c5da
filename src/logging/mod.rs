//! Error sink for events that never surface as a return value: accept
//! retries, handler panics, and connection close failures.

use std::fmt;
use std::sync::Arc;

use tracing::{error, warn};

/// Destination for error-class log lines.
///
/// Defaults to the `tracing` subscriber installed by the application. A
/// custom sink receives the fully formatted message instead.
#[derive(Clone, Default)]
pub enum ErrorLog {
    #[default]
    Tracing,
    Sink(Arc<dyn Fn(&str) + Send + Sync + 'static>),
}

impl ErrorLog {
    /// Routes messages to `sink` instead of `tracing`.
    pub fn sink<F>(sink: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self::Sink(Arc::new(sink))
    }

    pub(crate) fn error(&self, args: fmt::Arguments<'_>) {
        match self {
            Self::Tracing => error!("{args}"),
            Self::Sink(sink) => sink(&args.to_string()),
        }
    }

    pub(crate) fn warn(&self, args: fmt::Arguments<'_>) {
        match self {
            Self::Tracing => warn!("{args}"),
            Self::Sink(sink) => sink(&args.to_string()),
        }
    }
}

impl fmt::Debug for ErrorLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tracing => f.write_str("ErrorLog::Tracing"),
            Self::Sink(_) => f.write_str("ErrorLog::Sink(<fn>)"),
        }
    }
}
