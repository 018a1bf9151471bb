//! Process control blocks.
//!
//! The per-process record the scheduler reads and writes. Lifecycle state,
//! identity, and the wakeup channel live behind the per-process spinlock;
//! the scheduling statistics are lock-free atomics so the ready heap can
//! read ordering keys under the scheduler lock alone while writers stay
//! serialized by the locking protocol (only the owning CPU bumps
//! `cpu_burst`; the estimate is updated holding both the process lock and
//! the scheduler lock).

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::kernel::ProcCtx;
use crate::sched::context::Context;
use crate::sync::SpinLock;

/// Size of the process table.
pub const NPROC: usize = 64;

pub type Pid = u32;

/// Kernel-side body of a process, run on the process's own thread once the
/// scheduler first dispatches it. Returning is equivalent to exiting with
/// status 0.
pub type ProcBody = Box<dyn FnOnce(&ProcCtx) + Send + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

/// Fields guarded by the per-process lock.
pub(crate) struct ProcInner {
    pub state: ProcState,
    pub pid: Pid,
    /// Wakeup channel while sleeping; 0 when none.
    pub chan: usize,
    /// Exit status reported to wait().
    pub xstate: i32,
    pub name: String,
    /// The not-yet-run body, taken on first dispatch.
    pub body: Option<ProcBody>,
}

impl ProcInner {
    const fn new() -> Self {
        Self {
            state: ProcState::Unused,
            pid: 0,
            chan: 0,
            xstate: 0,
            name: String::new(),
            body: None,
        }
    }
}

/// One process table slot.
pub struct Proc {
    pub(crate) lock: SpinLock<ProcInner>,
    /// Kill requested; observed at the next user-return boundary.
    pub(crate) killed: AtomicBool,

    // Scheduling statistics. Ticks throughout.
    /// Ticks consumed in the current continuous running interval.
    pub(crate) cpu_burst: AtomicU64,
    /// Smoothed estimate of the next burst; the SJF ordering key.
    pub(crate) cpu_burst_aprox: AtomicU64,
    /// Accumulated execution time over the runnable/running lifecycle; the
    /// CFS ordering key. Reset when the process leaves that lifecycle.
    pub(crate) exe_time: AtomicU64,
    /// Global tick count at the last enqueue.
    pub(crate) put_timestamp: AtomicU64,
    /// Ticks until forced yield; 0 means no slice-based preemption.
    pub(crate) timeslice: AtomicU64,

    /// CPU that last dispatched this process.
    pub(crate) run_cpu: AtomicUsize,
    /// Times this process was handed a CPU.
    pub(crate) dispatches: AtomicU64,
    /// Times the timer took the CPU away.
    pub(crate) preemptions: AtomicU64,

    /// Execution context of the current incarnation. Replaced on every
    /// allocation so a retiring thread can never collide with a reused
    /// slot.
    context: spin::Mutex<Arc<Context>>,
}

impl Proc {
    pub(crate) fn new() -> Self {
        Self {
            lock: SpinLock::new("proc", ProcInner::new()),
            killed: AtomicBool::new(false),
            cpu_burst: AtomicU64::new(0),
            cpu_burst_aprox: AtomicU64::new(0),
            exe_time: AtomicU64::new(0),
            put_timestamp: AtomicU64::new(0),
            timeslice: AtomicU64::new(0),
            run_cpu: AtomicUsize::new(0),
            dispatches: AtomicU64::new(0),
            preemptions: AtomicU64::new(0),
            context: spin::Mutex::new(Arc::new(Context::new())),
        }
    }

    /// Execution context of the current incarnation.
    pub(crate) fn context(&self) -> Arc<Context> {
        self.context.lock().clone()
    }

    pub(crate) fn install_context(&self, ctx: Arc<Context>) {
        *self.context.lock() = ctx;
    }

    /// Zero every scheduling statistic. Used on allocation and free.
    pub(crate) fn reset_stats(&self) {
        self.cpu_burst.store(0, Ordering::Relaxed);
        self.cpu_burst_aprox.store(0, Ordering::Relaxed);
        self.exe_time.store(0, Ordering::Relaxed);
        self.put_timestamp.store(0, Ordering::Relaxed);
        self.timeslice.store(0, Ordering::Relaxed);
        self.dispatches.store(0, Ordering::Relaxed);
        self.preemptions.store(0, Ordering::Relaxed);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }
}
