//! Simulated context switch.
//!
//! On real hardware `swtch` saves the callee-saved registers of one kernel
//! context and restores another's. Here every execution context (each
//! CPU's scheduler and each process incarnation) owns one run token, and
//! `swtch` grants the target's token then blocks consuming its own. The
//! effect is identical: exactly one side runs at a time, and control
//! resumes precisely where it was given up.
//!
//! The token is granted before the grantor parks, so the small window where
//! both threads are briefly runnable is harmless: a token granted early is
//! simply consumed when the parking side arrives.

use core::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

/// One execution context's run token.
pub(crate) struct Context {
    runnable: Mutex<bool>,
    cv: Condvar,
    /// Set when the owning process has been freed; the parked thread must
    /// terminate instead of resuming.
    reaped: AtomicBool,
}

impl Context {
    pub(crate) fn new() -> Self {
        Self {
            runnable: Mutex::new(false),
            cv: Condvar::new(),
            reaped: AtomicBool::new(false),
        }
    }

    /// Grant this context's token, waking its parked thread if any.
    pub(crate) fn switch_in(&self) {
        let mut runnable = self.runnable.lock();
        *runnable = true;
        self.cv.notify_one();
    }

    /// Park until this context's token is granted, then consume it.
    pub(crate) fn switch_out(&self) {
        let mut runnable = self.runnable.lock();
        while !*runnable {
            self.cv.wait(&mut runnable);
        }
        *runnable = false;
    }

    /// Retire the context: the next (or current) park returns with
    /// [`Context::reaped`] set and the thread must unwind.
    pub(crate) fn retire(&self) {
        self.reaped.store(true, Ordering::SeqCst);
        self.switch_in();
    }

    pub(crate) fn reaped(&self) -> bool {
        self.reaped.load(Ordering::SeqCst)
    }
}

/// Switch from `from` to `to`: hand the CPU over and wait to be handed it
/// back.
pub(crate) fn swtch(from: &Context, to: &Context) {
    to.switch_in();
    from.switch_out();
}
