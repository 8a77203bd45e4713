//! Bounded waiting.
//!
//! Every place the transport suspends a thread goes through [`Deadline`] and
//! [`wait_on`]: completion polling, the unblock wait of the request queue,
//! connect retries and the accept loop. A deadline may be unbounded, but a
//! single suspension is always cut into slices so cancellation is observed.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, MutexGuard};

/// Absolute point in time after which a wait gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    started: Instant,
    expires_at: Option<Instant>,
}

impl Deadline {
    /// Deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            expires_at: started.checked_add(timeout),
        }
    }

    /// Deadline that never expires.
    pub fn never() -> Self {
        Self {
            started: Instant::now(),
            expires_at: None,
        }
    }

    /// `None` means no deadline.
    pub fn from_timeout(timeout: Option<Duration>) -> Self {
        match timeout {
            Some(timeout) => Self::after(timeout),
            None => Self::never(),
        }
    }

    /// Returns `true` if the deadline has passed.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }

    /// Time left before expiry; `Duration::MAX` when unbounded.
    pub fn remaining(&self) -> Duration {
        match self.expires_at {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    /// Length of the next wait slice: at most `max`, never past the deadline.
    ///
    /// Returns `Duration::ZERO` once the deadline has passed.
    pub fn slice(&self, max: Duration) -> Duration {
        self.remaining().min(max)
    }

    /// Time since the deadline was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Elapsed time in whole milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }
}

/// Blocks on `cond` until `ready` holds or the deadline passes.
///
/// Returns `true` if `ready` was satisfied. The guard is re-acquired before
/// returning in both cases.
pub fn wait_on<T>(
    cond: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    deadline: Deadline,
    mut ready: impl FnMut(&mut T) -> bool,
) -> bool {
    loop {
        if ready(&mut **guard) {
            return true;
        }
        if deadline.is_expired() {
            return false;
        }
        let _ = cond.wait_for(guard, deadline.remaining());
    }
}
