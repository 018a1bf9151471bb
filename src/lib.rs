//! Vireo scheduler core.
//!
//! This crate is the process scheduler subsystem of the Vireo teaching
//! kernel: a pluggable priority-queue scheduler that can be switched at
//! runtime between Shortest-Job-First with exponential burst estimation
//! and a CFS-style dynamic-timeslice policy, together with the process
//! state machine (put/get/yield/sleep/wakeup/kill/exit/wait) it drives.
//!
//! The hardware the scheduler normally sits on (the `swtch` register
//! switch, the timer interrupt, per-CPU interrupt flags) is simulated
//! in-process so the whole SMP protocol runs under `cargo test`:
//!
//! - every simulated CPU runs its scheduler loop on an OS thread,
//! - every process runs its kernel-side body on an OS thread, handed the
//!   CPU through a strict one-in/one-out token exchange,
//! - spinlocks are real spinlocks carrying the push/pop-off interrupt
//!   discipline, so the lock-order rules are enforced rather than assumed.
//!
//! The machine is an explicit [`Kernel`] value, so tests can boot several
//! independent instances side by side.
//!
//! ```no_run
//! use vireo_sched::Kernel;
//!
//! let kernel = Kernel::boot(2);
//! kernel.spawn("worker", Box::new(|ctx| {
//!     ctx.compute(10);
//!     ctx.yield_now();
//!     ctx.compute(5);
//! })).unwrap();
//! ```

pub mod kernel;
pub mod logger;
pub mod process;
pub mod sched;
pub mod sync;

pub use kernel::{Kernel, ProcCtx};
pub use process::{Pid, ProcBody, ProcState, NPROC};
pub use sched::types::{SchedAlgorithm, SchedulerStats};
pub use sync::spinlock::SpinLock;

#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {{
        $crate::logger::log($level, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Fatal, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Error, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Warn, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Info, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Debug, $($arg)*);
    }};
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Trace, $($arg)*);
    }};
}

/// Fatal invariant violation: log through the kernel logger, then panic so
/// a test harness can intercept the abort with `catch_unwind`.
#[macro_export]
macro_rules! kpanic {
    ($($arg:tt)*) => {{
        $crate::kfatal!($($arg)*);
        panic!($($arg)*);
    }};
}
