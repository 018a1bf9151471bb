//! Scheduler type definitions.
//!
//! The policy record, the algorithm selector, and the counters the
//! scheduler keeps about itself.

use crate::process::NPROC;

/// Smoothing percentage the kernel boots with.
pub const DEFAULT_SMOOTHING: u64 = 50;

/// Scheduling algorithm selected at runtime.
///
/// The numeric encoding (0 = SJF, 1 = CFS) is the wire format of the
/// `chsched` reconfiguration call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedAlgorithm {
    /// Shortest-Job-First: dispatch the process with the smallest smoothed
    /// burst estimate.
    Sjf,
    /// Fair-share: dispatch the process with the least accumulated
    /// execution time, granting it a dynamically sized timeslice.
    Cfs,
}

impl SchedAlgorithm {
    pub const fn as_str(self) -> &'static str {
        match self {
            SchedAlgorithm::Sjf => "SJF",
            SchedAlgorithm::Cfs => "CFS",
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(SchedAlgorithm::Sjf),
            1 => Some(SchedAlgorithm::Cfs),
            _ => None,
        }
    }
}

/// The scheduler policy record: the ready heap plus the runtime knobs.
/// A single instance lives in the kernel behind its own spinlock.
pub(crate) struct SchedPolicy {
    /// Process-table slots arranged as a binary min-heap under the key
    /// selected by `algorithm`. Only `heap[..heap_size]` is meaningful.
    pub heap: [usize; NPROC],
    pub heap_size: usize,
    pub algorithm: SchedAlgorithm,
    /// Under SJF, preempt the running process on every timer tick so a
    /// shorter job can overtake. Meaningless under CFS.
    pub is_preemptive: bool,
    /// Exponential-averaging weight of the newest burst, in percent.
    pub a: u64,
}

impl SchedPolicy {
    pub(crate) const fn new() -> Self {
        Self {
            heap: [0; NPROC],
            heap_size: 0,
            algorithm: SchedAlgorithm::Sjf,
            is_preemptive: false,
            a: DEFAULT_SMOOTHING,
        }
    }
}

/// Scheduler-wide counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchedulerStats {
    /// Processes handed to a CPU.
    pub dispatches: u64,
    /// Voluntary yields.
    pub voluntary_switches: u64,
    /// Timer-forced yields.
    pub preemptions: u64,
    /// Processes created.
    pub spawns: u64,
}

impl SchedulerStats {
    pub const fn new() -> Self {
        Self {
            dispatches: 0,
            voluntary_switches: 0,
            preemptions: 0,
            spawns: 0,
        }
    }
}
