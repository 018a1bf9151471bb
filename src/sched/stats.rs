//! Scheduler observability.
//!
//! Counters, state queries, and the process listing, plus the snapshots
//! the test suite uses to check the ready heap at quiescent points.

use core::sync::atomic::Ordering;

use crate::kernel::Kernel;
use crate::kinfo;
use crate::process::{Pid, ProcState, NPROC};
use crate::sched::types::{SchedAlgorithm, SchedulerStats};

impl Kernel {
    /// Snapshot of the scheduler-wide counters.
    pub fn stats(&self) -> SchedulerStats {
        *self.stats.lock()
    }

    /// Active policy: algorithm, preemption flag, smoothing percentage.
    pub fn policy(&self) -> (SchedAlgorithm, bool, u64) {
        self.sched.acquire();
        let sp = self.sched.data();
        let snapshot = (sp.algorithm, sp.is_preemptive, sp.a);
        self.sched.release();
        snapshot
    }

    /// Current state of `pid`, if it occupies a table slot.
    pub fn process_state(&self, pid: Pid) -> Option<ProcState> {
        for slot in 0..NPROC {
            let p = &self.procs[slot];
            p.lock.acquire();
            let found = {
                let inner = p.lock.data();
                (inner.pid == pid && inner.state != ProcState::Unused).then_some(inner.state)
            };
            p.lock.release();
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// Times `pid` has been handed a CPU.
    pub fn dispatch_count(&self, pid: Pid) -> Option<u64> {
        let slot = self.slot_of_pid(pid)?;
        Some(self.procs[slot].dispatches.load(Ordering::Relaxed))
    }

    /// Accumulated execution time of `pid` in the current runnable
    /// lifecycle.
    pub fn exe_time(&self, pid: Pid) -> Option<u64> {
        let slot = self.slot_of_pid(pid)?;
        Some(self.procs[slot].exe_time.load(Ordering::Relaxed))
    }

    /// Smoothed burst estimate of `pid`.
    pub fn burst_estimate(&self, pid: Pid) -> Option<u64> {
        let slot = self.slot_of_pid(pid)?;
        Some(self.procs[slot].cpu_burst_aprox.load(Ordering::Relaxed))
    }

    /// Ready heap in array order as `(slot, key)` pairs under the active
    /// key function. Taken atomically under the scheduler lock.
    pub fn ready_snapshot(&self) -> Vec<(usize, u64)> {
        self.sched.acquire();
        let sp = self.sched.data();
        let mut snapshot = Vec::with_capacity(sp.heap_size);
        for i in 0..sp.heap_size {
            let slot = sp.heap[i];
            let key = match sp.algorithm {
                SchedAlgorithm::Sjf => self.procs[slot].cpu_burst_aprox.load(Ordering::Relaxed),
                SchedAlgorithm::Cfs => self.procs[slot].exe_time.load(Ordering::Relaxed),
            };
            snapshot.push((slot, key));
        }
        self.sched.release();
        snapshot
    }

    /// Pids currently queued in the ready heap. Two-phase (heap first,
    /// then per-process locks), so only meaningful at quiescent points.
    pub fn ready_pids(&self) -> Vec<Pid> {
        let slots: Vec<usize> = self.ready_snapshot().iter().map(|&(s, _)| s).collect();
        let mut pids = Vec::with_capacity(slots.len());
        for slot in slots {
            let p = &self.procs[slot];
            p.lock.acquire();
            pids.push(p.lock.data().pid);
            p.lock.release();
        }
        pids
    }

    /// Counts of (runnable, running, sleeping, zombie) processes.
    pub fn process_counts(&self) -> (usize, usize, usize, usize) {
        let mut counts = (0, 0, 0, 0);
        for slot in 0..NPROC {
            let p = &self.procs[slot];
            p.lock.acquire();
            match p.lock.data().state {
                ProcState::Runnable => counts.0 += 1,
                ProcState::Running => counts.1 += 1,
                ProcState::Sleeping => counts.2 += 1,
                ProcState::Zombie => counts.3 += 1,
                ProcState::Unused | ProcState::Used => {}
            }
            p.lock.release();
        }
        counts
    }

    /// Log a listing of every live process.
    pub fn procdump(&self) {
        kinfo!(
            "{:<6} {:<10} {:<12} {:>6} {:>8} {:>8} {:>9}",
            "PID",
            "STATE",
            "NAME",
            "EST",
            "EXETIME",
            "DISP",
            "PREEMPTED"
        );
        for slot in 0..NPROC {
            let p = &self.procs[slot];
            p.lock.acquire();
            let line = {
                let inner = p.lock.data();
                (inner.state != ProcState::Unused)
                    .then(|| (inner.pid, inner.state, inner.name.clone()))
            };
            p.lock.release();
            let Some((pid, state, name)) = line else {
                continue;
            };
            kinfo!(
                "{:<6} {:<10} {:<12} {:>6} {:>8} {:>8} {:>9}",
                pid,
                format!("{state:?}"),
                name,
                p.cpu_burst_aprox.load(Ordering::Relaxed),
                p.exe_time.load(Ordering::Relaxed),
                p.dispatches.load(Ordering::Relaxed),
                p.preemptions.load(Ordering::Relaxed)
            );
        }
    }
}
