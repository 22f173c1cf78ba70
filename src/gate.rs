//! Access gate for outbound requests
//!
//! The gate admits one holder at a time and keeps at least `interval` between the
//! release of one holder and the admission of the next. Waiters queue on the
//! gate's mutex; only the waiter at the head of the queue sleeps on the timer.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Errors returned while acquiring the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GateError {
    /// The wait was cancelled; no request was made and the gate is untouched
    #[error("cancel")]
    Cancelled,
}

#[derive(Debug, Default)]
struct GateState {
    /// Earliest admission instant; `None` until the first release
    next_allowed: Option<Instant>,
}

/// Single-slot interval limiter anchored on release time
#[derive(Debug, Clone)]
pub struct AccessGate {
    interval: Duration,
    state: Arc<Mutex<GateState>>,
}

impl AccessGate {
    /// Creates a gate that spaces holders `interval` apart
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Arc::new(Mutex::new(GateState::default())),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits for the gate
    ///
    /// Returns a guard once the previous holder's release is at least `interval` in
    /// the past. If `cancel` fires first, returns `GateError::Cancelled` and leaves
    /// the gate as it was.
    ///
    /// # Arguments
    /// * `cancel` - Aborts the wait, whether queued on the mutex or on the timer
    ///
    /// # Returns
    /// * `Ok(GateGuard)` that sets the next admission time when released
    /// * `Err(GateError::Cancelled)` if `cancel` fired first
    pub async fn lock(&self, cancel: &CancellationToken) -> Result<GateGuard, GateError> {
        if cancel.is_cancelled() {
            return Err(GateError::Cancelled);
        }

        let state = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GateError::Cancelled),
            state = Arc::clone(&self.state).lock_owned() => state,
        };

        if let Some(next_allowed) = state.next_allowed {
            tokio::select! {
                biased;
                // Dropping `state` here releases the mutex without touching it
                _ = cancel.cancelled() => return Err(GateError::Cancelled),
                _ = time::sleep_until(next_allowed) => {}
            }
        }

        debug!("access gate admitted");
        Ok(GateGuard {
            state,
            interval: self.interval,
        })
    }
}

/// Proof of holding the gate
///
/// Releasing (by `unlock` or by dropping) sets the next admission instant to now
/// plus the interval and admits the next waiter.
#[derive(Debug)]
#[must_use = "the gate is released as soon as the guard is dropped"]
pub struct GateGuard {
    state: OwnedMutexGuard<GateState>,
    interval: Duration,
}

impl GateGuard {
    /// Releases the gate
    pub fn unlock(self) {
        drop(self);
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.state.next_allowed = Some(Instant::now() + self.interval);
    }
}
