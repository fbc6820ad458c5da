//! Free-list of reusable [`Context`]s.
//!
//! Acquire never waits: an empty pool allocates a fresh context. Release
//! resets the context before it becomes visible to other tasks, so a context
//! is only ever owned by one connection at a time.

use std::sync::{Mutex, MutexGuard, PoisonError};

use super::Context;

/// Idle contexts kept by [`ContextPool::default`].
pub const DEFAULT_MAX_IDLE: usize = 1024;

#[derive(Debug)]
pub struct ContextPool {
    idle: Mutex<Vec<Context>>,
    max_idle: usize,
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE)
    }
}

impl ContextPool {
    /// Pool retaining at most `max_idle` released contexts.
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Take an idle context, or allocate one.
    pub fn acquire(&self) -> Context {
        self.lock().pop().unwrap_or_default()
    }

    /// Reset `ctx` and return it to the pool. Contexts beyond `max_idle` are
    /// dropped.
    pub fn release(&self, mut ctx: Context) {
        ctx.reset();
        let mut idle = self.lock();
        if idle.len() < self.max_idle {
            idle.push(ctx);
        }
    }

    /// Number of idle contexts.
    pub fn idle(&self) -> usize {
        self.lock().len()
    }

    // A panic while holding the lock cannot leave the Vec half-updated.
    fn lock(&self) -> MutexGuard<'_, Vec<Context>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
