//! Exclusive turn over the relay state
//!
//! Callers queue on a fair mutex, so turns are granted in arrival order. The
//! guard releases the turn on every exit path, including cancellation of the
//! holder's future.

use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, trace};

/// FIFO gate owning the state it protects
#[derive(Debug)]
pub struct TurnGate<S> {
    state: Mutex<S>,
    limit: Option<Duration>,
}

impl<S> TurnGate<S> {
    /// Gate over `state`; `limit` bounds how long a routed call may run
    pub fn new(state: S, limit: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(state),
            limit,
        }
    }

    /// Safety limit for one call holding the turn
    pub fn limit(&self) -> Option<Duration> {
        self.limit
    }

    /// Wait for the turn
    pub async fn acquire(&self) -> Turn<'_, S> {
        let queued = Instant::now();
        let guard = self.state.lock().await;
        trace!(waited = ?queued.elapsed(), "turn acquired");
        Turn {
            guard,
            acquired: Instant::now(),
        }
    }
}

/// Held turn; dereferences to the state
pub struct Turn<'a, S> {
    guard: MutexGuard<'a, S>,
    acquired: Instant,
}

impl<S> Deref for Turn<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.guard
    }
}

impl<S> DerefMut for Turn<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.guard
    }
}

impl<S> Drop for Turn<'_, S> {
    fn drop(&mut self) {
        debug!(held = ?self.acquired.elapsed(), "turn released");
    }
}
