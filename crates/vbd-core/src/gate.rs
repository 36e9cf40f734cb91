//! Admission gate: in-flight request accounting with drain-to-zero.
//!
//! The gate packs the deleting flag and the in-flight count into one
//! `AtomicU64` so that "is the device deleting?" and "count this request"
//! are a single compare-and-swap. A request can therefore never be admitted
//! after [`AdmissionGate::close`] has been observed by the drain wait.
//!
//! ```text
//!  bit 63      bits 0..63
//! ┌────────┬─────────────────┐
//! │ CLOSED │ in-flight count │
//! └────────┴─────────────────┘
//! ```

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

const CLOSED: u64 = 1 << 63;
const COUNT_MASK: u64 = CLOSED - 1;

/// In-flight counter plus deleting flag.
pub struct AdmissionGate {
    state: AtomicU64,
    drain_lock: Mutex<()>,
    drained: Condvar,
}

impl AdmissionGate {
    /// A new gate starts closed: nothing is admitted until [`Self::open`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU64::new(CLOSED),
            drain_lock: Mutex::new(()),
            drained: Condvar::new(),
        }
    }

    /// Admit one request, or `None` if the gate is closed.
    pub fn try_admit(self: &Arc<Self>) -> Option<InflightToken> {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                if state & CLOSED != 0 || state & COUNT_MASK == COUNT_MASK {
                    None
                } else {
                    Some(state + 1)
                }
            })
            .ok()
            .map(|_| InflightToken {
                gate: Arc::clone(self),
            })
    }

    /// Start admitting requests.
    pub fn open(&self) {
        self.state.fetch_and(COUNT_MASK, Ordering::AcqRel);
    }

    /// Stop admitting requests. Requests already admitted keep running.
    pub fn close(&self) {
        self.state.fetch_or(CLOSED, Ordering::AcqRel);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) & CLOSED != 0
    }

    /// Requests admitted and not yet completed.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.state.load(Ordering::Acquire) & COUNT_MASK
    }

    /// Block until the in-flight count is zero or `timeout` passes. Returns
    /// whether the gate drained.
    ///
    /// Only meaningful after [`Self::close`]; on an open gate new admissions
    /// can keep the count above zero indefinitely.
    pub fn wait_drained_for(&self, timeout: Duration) -> bool {
        let mut guard = self.drain_lock.lock();
        while self.in_flight() != 0 {
            if self.drained.wait_for(&mut guard, timeout).timed_out() {
                return self.in_flight() == 0;
            }
        }
        true
    }

    fn release(&self) {
        let prev = self.state.fetch_sub(1, Ordering::AcqRel);
        if prev & COUNT_MASK == 1 {
            // Taking the lock orders this notify after any waiter that has
            // already checked the count and is about to sleep.
            let _guard = self.drain_lock.lock();
            if prev & CLOSED != 0 {
                debug!("last in-flight request completed during drain");
            }
            self.drained.notify_all();
        }
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("closed", &self.is_closed())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

/// One admitted request. Dropping the token releases the admission.
#[must_use = "dropping the token immediately releases the admission"]
pub struct InflightToken {
    gate: Arc<AdmissionGate>,
}

impl Drop for InflightToken {
    fn drop(&mut self) {
        self.gate.release();
    }
}

impl std::fmt::Debug for InflightToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightToken").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicBool;

    const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

    fn open_gate() -> Arc<AdmissionGate> {
        let gate = Arc::new(AdmissionGate::new());
        gate.open();
        gate
    }

    #[test]
    fn starts_closed() {
        let gate = Arc::new(AdmissionGate::new());
        assert!(gate.is_closed());
        assert!(gate.try_admit().is_none());
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn tokens_count_in_flight() {
        let gate = open_gate();
        let a = gate.try_admit().expect("admit a");
        let b = gate.try_admit().expect("admit b");
        assert_eq!(gate.in_flight(), 2);
        drop(a);
        assert_eq!(gate.in_flight(), 1);
        drop(b);
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn close_rejects_but_keeps_count() {
        let gate = open_gate();
        let token = gate.try_admit().expect("admit");
        gate.close();
        assert!(gate.try_admit().is_none());
        assert_eq!(gate.in_flight(), 1);
        drop(token);
        assert_eq!(gate.in_flight(), 0);
        assert!(gate.is_closed());
        gate.open();
        assert!(gate.try_admit().is_some());
    }

    #[test]
    fn wait_drained_returns_immediately_when_idle() {
        let gate = open_gate();
        gate.close();
        assert!(gate.wait_drained_for(Duration::from_millis(1)));
    }

    #[test]
    fn wait_drained_times_out_while_busy() {
        let gate = open_gate();
        let _token = gate.try_admit().expect("admit");
        gate.close();
        assert!(!gate.wait_drained_for(Duration::from_millis(20)));
    }

    #[test]
    fn drain_waits_for_last_release() {
        let gate = open_gate();
        let tokens: Vec<_> = (0..4).map(|_| gate.try_admit().expect("admit")).collect();
        gate.close();

        let drained = AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                assert!(gate.wait_drained_for(DRAIN_TIMEOUT));
                drained.store(true, Ordering::SeqCst);
            });
            std::thread::sleep(Duration::from_millis(20));
            assert!(!drained.load(Ordering::SeqCst));
            for token in tokens {
                std::thread::sleep(Duration::from_millis(2));
                drop(token);
            }
        });
        assert!(drained.load(Ordering::SeqCst));
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn no_admission_after_close_is_observed() {
        // Racing admitters against close: once close() returns, every
        // later try_admit fails and the drain observes every earlier one.
        let gate = open_gate();
        let barrier = Barrier::new(9);
        let closed = AtomicBool::new(false);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    barrier.wait();
                    for _ in 0..2000 {
                        let seen_closed = closed.load(Ordering::SeqCst);
                        let token = gate.try_admit();
                        if seen_closed {
                            assert!(token.is_none());
                        }
                        drop(token);
                    }
                });
            }
            barrier.wait();
            std::thread::sleep(Duration::from_millis(1));
            gate.close();
            closed.store(true, Ordering::SeqCst);
            assert!(gate.wait_drained_for(DRAIN_TIMEOUT));
            assert_eq!(gate.in_flight(), 0);
        });
    }
}
