//! Cooperative cancellation.
//!
//! A transport owns one [`CancelToken`]. Every bounded loop in the driver
//! checks it once per iteration; raising it through a [`CancelHandle`] makes
//! pending waits return `ECANCELED` and stops the accept thread. There is no
//! preemption of an operation already posted to the NIC.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::deadline::{wait_on, Deadline};

/// Why a transport's waits were interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// `fini` was called or the transport was dropped.
    Shutdown,
    /// A caller raised the transport's [`CancelHandle`].
    #[default]
    UserRequested,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CancelReason::Shutdown => "transport shutdown",
            CancelReason::UserRequested => "cancelled by caller",
        })
    }
}

/// Shared between a token and its handle. `raised` mirrors `reason.is_some()`
/// so hot poll loops can check it without the lock.
struct Flag {
    raised: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    wake: Condvar,
}

impl Flag {
    fn raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}

/// Polled by waits, retry loops and the accept thread.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<Flag>,
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CancelToken({:?})", self.cancelled_reason())
    }
}

impl CancelToken {
    /// True once the paired handle has fired.
    pub fn is_cancelled(&self) -> bool {
        self.flag.raised()
    }

    /// The reason given to the first `cancel` call, if any.
    pub fn cancelled_reason(&self) -> Option<CancelReason> {
        *self.flag.reason.lock()
    }

    /// Sleeps for `pause`, waking early on cancellation.
    ///
    /// Returns `true` if the token is cancelled when the sleep ends.
    pub fn sleep(&self, pause: Duration) -> bool {
        let mut reason = self.flag.reason.lock();
        wait_on(&self.flag.wake, &mut reason, Deadline::after(pause), |r| {
            r.is_some()
        })
    }
}

/// Fires the paired [`CancelToken`]. Cloneable so other threads can stop a
/// blocked `wait`.
#[derive(Clone)]
pub struct CancelHandle {
    flag: Arc<Flag>,
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CancelHandle(raised: {})", self.flag.raised())
    }
}

impl CancelHandle {
    /// Raises the flag and wakes sleepers. Later reasons are ignored.
    pub fn cancel(&self, reason: CancelReason) {
        let mut slot = self.flag.reason.lock();
        slot.get_or_insert(reason);
        self.flag.raised.store(true, Ordering::Release);
        self.flag.wake.notify_all();
    }

    /// True once `cancel` has been called on this handle or a clone.
    pub fn is_cancelled(&self) -> bool {
        self.flag.raised()
    }
}

/// Builds a connected token and handle, both clear.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let flag = Arc::new(Flag {
        raised: AtomicBool::new(false),
        reason: Mutex::new(None),
        wake: Condvar::new(),
    });
    (CancelToken { flag: flag.clone() }, CancelHandle { flag })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_fresh_pair_not_raised() {
        let (token, handle) = new_cancel_pair();
        assert!(!handle.is_cancelled());
        assert!(token.cancelled_reason().is_none());
    }

    #[test]
    fn test_shutdown_after_user_cancel_keeps_user_reason() {
        let (token, handle) = new_cancel_pair();
        let other = handle.clone();
        handle.cancel(CancelReason::UserRequested);
        other.cancel(CancelReason::Shutdown);
        assert!(other.is_cancelled());
        assert_eq!(token.cancelled_reason(), Some(CancelReason::UserRequested));
    }

    #[test]
    fn test_retry_pause_elapses_without_cancel() {
        let (token, _handle) = new_cancel_pair();
        let begun = Instant::now();
        let interrupted = token.sleep(Duration::from_millis(15));
        assert!(!interrupted);
        assert!(begun.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_shutdown_interrupts_retry_pause() {
        let (token, handle) = new_cancel_pair();
        let sleeper = thread::spawn(move || {
            let begun = Instant::now();
            (token.sleep(Duration::from_secs(30)), begun.elapsed())
        });
        thread::sleep(Duration::from_millis(10));
        handle.cancel(CancelReason::Shutdown);
        let (interrupted, waited) = sleeper.join().unwrap();
        assert!(interrupted);
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn test_sleep_after_cancel_returns_immediately() {
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::UserRequested);
        let begun = Instant::now();
        assert!(token.sleep(Duration::from_secs(30)));
        assert!(begun.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_reason_text() {
        assert_eq!(CancelReason::Shutdown.to_string(), "transport shutdown");
        assert_eq!(CancelReason::default(), CancelReason::UserRequested);
    }
}
