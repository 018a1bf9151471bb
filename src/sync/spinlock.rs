//! Spinlocks with interrupt discipline.
//!
//! A faithful rendition of the classic kernel spinlock protocol on top of
//! host atomics. Acquiring a lock disables interrupts on the current
//! simulated CPU (`push_off`), releasing restores them (`pop_off`), and the
//! owner is recorded as an execution-context id so `holding` answers "does
//! *this* context hold the lock", the probe the scheduler's enqueue path
//! relies on.
//!
//! Unlike an RAII mutex, a lock may be acquired by one kernel thread and
//! released by another: that is exactly what happens when a process lock is
//! held across `swtch` between a scheduler loop and the process it
//! dispatches. Both sides execute on the same simulated CPU, so ownership
//! is continuous even though the host thread changes.

use core::cell::UnsafeCell;
use core::hint;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::kpanic;
use crate::sched::smp;

/// Spins before the acquire loop starts yielding the host thread.
const SPINS_BEFORE_YIELD: u32 = 64;

/// Spins before a stuck lock is declared a deadlock.
const SPINS_BEFORE_PANIC: u64 = 1 << 30;

/// A kernel spinlock protecting `T`.
///
/// Data access is runtime-checked: [`SpinLock::data`] panics unless the
/// calling context holds the lock.
pub struct SpinLock<T> {
    name: &'static str,
    /// Owner execution-context id + 1; 0 means unlocked.
    owner: AtomicUsize,
    data: UnsafeCell<T>,
}

// The runtime holding checks serialize access to the cell.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            owner: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, spinning until it is free. Disables interrupts on
    /// the current CPU for the duration of the critical section.
    pub fn acquire(&self) {
        smp::push_off();
        if self.holding() {
            kpanic!("acquire {}: already held", self.name);
        }

        let me = smp::ctx_id() + 1;
        let mut spins: u64 = 0;
        while self
            .owner
            .compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins += 1;
            if spins % SPINS_BEFORE_YIELD as u64 == 0 {
                std::thread::yield_now();
            } else {
                hint::spin_loop();
            }
            if spins > SPINS_BEFORE_PANIC {
                kpanic!("acquire {}: stuck", self.name);
            }
        }
    }

    /// Release the lock and restore the interrupt state.
    pub fn release(&self) {
        if !self.holding() {
            kpanic!("release {}: not held", self.name);
        }
        self.owner.store(0, Ordering::Release);
        smp::pop_off();
    }

    /// Whether the calling execution context holds this lock.
    pub fn holding(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == smp::ctx_id() + 1
    }

    /// Access the protected data. The calling context must hold the lock.
    ///
    /// Returned borrows must not overlap; keep them short-lived.
    #[allow(clippy::mut_from_ref)]
    pub fn data(&self) -> &mut T {
        if !self.holding() {
            kpanic!("data {}: lock not held", self.name);
        }
        unsafe { &mut *self.data.get() }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn acquire_release_roundtrip() {
        let lock = SpinLock::new("test", 7u32);
        assert!(!lock.holding());
        lock.acquire();
        assert!(lock.holding());
        *lock.data() += 1;
        lock.release();
        assert!(!lock.holding());
        lock.acquire();
        assert_eq!(*lock.data(), 8);
        lock.release();
    }

    #[test]
    fn contended_counter_is_exact() {
        let lock = Arc::new(SpinLock::new("counter", 0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    lock.acquire();
                    *lock.data() += 1;
                    lock.release();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        lock.acquire();
        assert_eq!(*lock.data(), 40_000);
        lock.release();
    }

    #[test]
    fn release_without_acquire_is_fatal() {
        let lock = SpinLock::new("bad", ());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| lock.release()));
        assert!(result.is_err());
    }

    #[test]
    fn data_without_lock_is_fatal() {
        let lock = SpinLock::new("raw", 1u8);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| *lock.data()));
        assert!(result.is_err());
    }
}
