//! Guard - reference-counted gate around a closable resource
//!
//! Lets any number of threads run operations against a resource while
//! guaranteeing its destroy callback runs exactly once, and only after the
//! last in-flight operation has finished. Once destruction is requested new
//! operations are rejected with [`PlanBError::TryAgain`] instead of blocking,
//! so the caller can re-read the owner's current guard and retry.
//!
//! # State
//!
//! A single `AtomicU64` holds both the holder count (low 63 bits) and the
//! destroy-requested flag (top bit). Acquire is a CAS loop that never moves
//! the count once the flag is set, so only holders that actually ran an
//! operation release. No lock is taken on the read path.
//!
//! ```text
//! LIVE ──destroy()──> DESTROY_REQUESTED ──last holder exits──> DESTROYED
//!   │                                                              ^
//!   └──────────destroy() with no holders (runs inline)─────────────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{PlanBError, Result};

const DESTROY_BIT: u64 = 1 << 63;
const COUNT_MASK: u64 = DESTROY_BIT - 1;

type DestroyFn = Box<dyn FnOnce() + Send>;

/// Observable lifecycle state of a [`Guard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Live,
    DestroyRequested,
    Destroyed,
}

pub struct Guard {
    state: AtomicU64,
    /// Taken exactly once by whichever thread observes the count reach zero
    /// after the destroy bit is set.
    on_destroy: Mutex<Option<DestroyFn>>,
    destroyed: AtomicBool,
}

/// Releases one hold on drop, so a panicking operation still counts down.
struct Hold<'a> {
    guard: &'a Guard,
}

impl Drop for Hold<'_> {
    fn drop(&mut self) {
        self.guard.release();
    }
}

impl Guard {
    pub fn new(on_destroy: impl FnOnce() + Send + 'static) -> Self {
        Self {
            state: AtomicU64::new(0),
            on_destroy: Mutex::new(Some(Box::new(on_destroy))),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Run `op` while holding the guard.
    ///
    /// Returns `TryAgain` without running `op` if destruction was requested.
    pub fn acquire<T>(&self, op: impl FnOnce() -> T) -> Result<T> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & DESTROY_BIT != 0 {
                return Err(PlanBError::TryAgain);
            }
            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        let hold = Hold { guard: self };
        let value = op();
        drop(hold);
        Ok(value)
    }

    /// Request destruction. Idempotent.
    ///
    /// Runs the callback on this thread when nothing holds the guard,
    /// otherwise on the thread of the last holder to exit.
    pub fn destroy(&self) {
        let prev = self.state.fetch_or(DESTROY_BIT, Ordering::AcqRel);
        if prev & DESTROY_BIT != 0 {
            return;
        }
        if prev & COUNT_MASK == 0 {
            self.run_destroy();
        }
    }

    pub fn state(&self) -> GuardState {
        if self.destroyed.load(Ordering::Acquire) {
            GuardState::Destroyed
        } else if self.state.load(Ordering::Acquire) & DESTROY_BIT != 0 {
            GuardState::DestroyRequested
        } else {
            GuardState::Live
        }
    }

    /// Number of threads currently inside `acquire`.
    pub fn holders(&self) -> u64 {
        self.state.load(Ordering::Acquire) & COUNT_MASK
    }

    pub fn is_destroy_requested(&self) -> bool {
        self.state.load(Ordering::Acquire) & DESTROY_BIT != 0
    }

    fn release(&self) {
        let prev = self.state.fetch_sub(1, Ordering::AcqRel);
        if prev == DESTROY_BIT | 1 {
            self.run_destroy();
        }
    }

    fn run_destroy(&self) {
        let callback = self.on_destroy.lock().take();
        if let Some(callback) = callback {
            callback();
            self.destroyed.store(true, Ordering::Release);
        }
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard")
            .field("state", &self.state())
            .field("holders", &self.holders())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    fn counting_guard() -> (Arc<Guard>, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let guard = Arc::new(Guard::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        (guard, fired)
    }

    #[test]
    fn test_acquire_runs_operation() {
        let (guard, fired) = counting_guard();
        assert_eq!(guard.acquire(|| 7).unwrap(), 7);
        assert_eq!(guard.holders(), 0);
        assert_eq!(guard.state(), GuardState::Live);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_destroy_without_holders_runs_inline() {
        let (guard, fired) = counting_guard();
        guard.destroy();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(guard.state(), GuardState::Destroyed);
    }

    #[test]
    fn test_repeated_destroy_fires_once() {
        let (guard, fired) = counting_guard();
        guard.destroy();
        guard.destroy();
        guard.destroy();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_destroy_fires_once() {
        for threads in 1..=16 {
            let (guard, fired) = counting_guard();
            let barrier = Arc::new(Barrier::new(threads));
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    let guard = Arc::clone(&guard);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        guard.destroy();
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(fired.load(Ordering::SeqCst), 1, "threads = {}", threads);
        }
    }

    #[test]
    fn test_acquire_after_destroy_fails_fast() {
        let (guard, _) = counting_guard();
        guard.destroy();

        let ran = AtomicBool::new(false);
        for _ in 0..5 {
            let result = guard.acquire(|| ran.store(true, Ordering::SeqCst));
            assert!(matches!(result, Err(PlanBError::TryAgain)));
        }
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(guard.holders(), 0);
    }

    #[test]
    fn test_destroy_deferred_until_holder_exits() {
        let (guard, fired) = counting_guard();
        let entered = Arc::new(Barrier::new(2));
        let proceed = Arc::new(Barrier::new(2));

        let holder = {
            let guard = Arc::clone(&guard);
            let entered = Arc::clone(&entered);
            let proceed = Arc::clone(&proceed);
            thread::spawn(move || {
                guard
                    .acquire(|| {
                        entered.wait();
                        proceed.wait();
                    })
                    .unwrap();
            })
        };

        entered.wait();
        guard.destroy();
        assert_eq!(fired.load(Ordering::SeqCst), 0, "holder still active");
        assert_eq!(guard.state(), GuardState::DestroyRequested);
        assert!(matches!(guard.acquire(|| ()), Err(PlanBError::TryAgain)));

        proceed.wait();
        holder.join().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(guard.state(), GuardState::Destroyed);
    }

    #[test]
    fn test_concurrent_holders_then_destroy() {
        let (guard, fired) = counting_guard();
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(Barrier::new(21));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let guard = Arc::clone(&guard);
                let active = Arc::clone(&active);
                let max_active = Arc::clone(&max_active);
                let started = Arc::clone(&started);
                thread::spawn(move || {
                    guard
                        .acquire(|| {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            max_active.fetch_max(now, Ordering::SeqCst);
                            started.wait();
                            thread::sleep(Duration::from_millis(50));
                            active.fetch_sub(1, Ordering::SeqCst);
                        })
                        .unwrap();
                })
            })
            .collect();

        // All 20 are inside acquire before destroy is requested.
        started.wait();
        guard.destroy();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        for h in handles {
            h.join().unwrap();
        }

        assert!(max_active.load(Ordering::SeqCst) > 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(guard.holders(), 0);
    }

    #[test]
    fn test_rejected_acquirers_never_run_destroy() {
        for _ in 0..50 {
            let ran_on = Arc::new(Mutex::new(None));
            let r = Arc::clone(&ran_on);
            let guard = Arc::new(Guard::new(move || {
                thread::sleep(Duration::from_millis(1));
                *r.lock() = Some(thread::current().id());
            }));
            let entered = Arc::new(Barrier::new(2));
            let proceed = Arc::new(Barrier::new(2));

            let holder = {
                let guard = Arc::clone(&guard);
                let entered = Arc::clone(&entered);
                let proceed = Arc::clone(&proceed);
                thread::spawn(move || {
                    guard
                        .acquire(|| {
                            entered.wait();
                            proceed.wait();
                        })
                        .unwrap();
                    thread::current().id()
                })
            };
            entered.wait();
            guard.destroy();

            let stop = Arc::new(AtomicBool::new(false));
            let spinner = {
                let guard = Arc::clone(&guard);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let mut rejected = 0usize;
                    while !stop.load(Ordering::SeqCst) {
                        if guard.acquire(|| ()).is_err() {
                            rejected += 1;
                        }
                    }
                    rejected
                })
            };

            proceed.wait();
            let holder_id = holder.join().unwrap();
            stop.store(true, Ordering::SeqCst);
            assert!(spinner.join().unwrap() > 0);

            // The last real holder ran the callback, to completion, before
            // its acquire returned.
            assert_eq!(*ran_on.lock(), Some(holder_id));
            assert_eq!(guard.state(), GuardState::Destroyed);
            assert_eq!(guard.holders(), 0);
        }
    }

    #[test]
    fn test_destroy_inline_while_acquirers_spin() {
        for _ in 0..100 {
            let (guard, fired) = counting_guard();
            guard.destroy();
            let spinner = {
                let guard = Arc::clone(&guard);
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        assert!(guard.acquire(|| ()).is_err());
                    }
                    guard.holders()
                })
            };
            assert_eq!(fired.load(Ordering::SeqCst), 1);
            assert_eq!(spinner.join().unwrap(), 0);
            assert_eq!(fired.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_panicking_operation_releases_hold() {
        let (guard, fired) = counting_guard();
        let g = Arc::clone(&guard);
        let result = thread::spawn(move || {
            let _ = g.acquire(|| panic!("boom"));
        })
        .join();
        assert!(result.is_err());
        assert_eq!(guard.holders(), 0);

        guard.destroy();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
