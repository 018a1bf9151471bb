//! Ready heap and policy reconfiguration.
//!
//! The ready queue is an array-backed binary min-heap of process-table
//! slots, ordered by the key the active algorithm selects: the smoothed
//! burst estimate under SJF, accumulated execution time under CFS. The
//! heap never owns a process: it stores stable indices into the table the
//! kernel owns.
//!
//! All of these run with the scheduler lock held.

use std::sync::Arc;

use crate::kernel::Kernel;
use crate::kinfo;
use crate::process::Proc;
use crate::sched::types::{SchedAlgorithm, SchedPolicy};

/// Ordering key of a heap entry under the given algorithm.
#[inline]
fn key(procs: &[Arc<Proc>], slot: usize, algorithm: SchedAlgorithm) -> u64 {
    use core::sync::atomic::Ordering;
    match algorithm {
        SchedAlgorithm::Sjf => procs[slot].cpu_burst_aprox.load(Ordering::Relaxed),
        SchedAlgorithm::Cfs => procs[slot].exe_time.load(Ordering::Relaxed),
    }
}

/// Restore the heap property after an append: bubble the element at
/// `n - 1` toward the root while it is smaller than its parent.
pub(crate) fn heapify_up(sp: &mut SchedPolicy, procs: &[Arc<Proc>], n: usize) {
    if n <= 1 {
        return;
    }
    let mut curr = n - 1;
    let mut parent = (curr - 1) / 2;
    loop {
        if key(procs, sp.heap[curr], sp.algorithm) < key(procs, sp.heap[parent], sp.algorithm) {
            sp.heap.swap(curr, parent);
        } else {
            break;
        }
        if parent == 0 {
            break;
        }
        curr = parent;
        parent = (curr - 1) / 2;
    }
}

/// Restore the heap property downward from `i`: sink the element, swapping
/// with the smaller violating child.
pub(crate) fn heapify_down_from(sp: &mut SchedPolicy, procs: &[Arc<Proc>], i: usize, n: usize) {
    if n <= 1 {
        return;
    }
    let mut curr = i;
    loop {
        let left = 2 * curr + 1;
        let right = 2 * curr + 2;
        let mut smallest = curr;
        if left < n
            && key(procs, sp.heap[left], sp.algorithm) < key(procs, sp.heap[smallest], sp.algorithm)
        {
            smallest = left;
        }
        if right < n
            && key(procs, sp.heap[right], sp.algorithm)
                < key(procs, sp.heap[smallest], sp.algorithm)
        {
            smallest = right;
        }
        if smallest == curr {
            break;
        }
        sp.heap.swap(curr, smallest);
        curr = smallest;
    }
}

/// Re-heapify the whole array after the key function changed.
pub(crate) fn rearrange(sp: &mut SchedPolicy, procs: &[Arc<Proc>], n: usize) {
    if n <= 1 {
        return;
    }
    // Sink every non-leaf, last one first.
    for i in (0..n / 2).rev() {
        heapify_down_from(sp, procs, i, n);
    }
}

impl Kernel {
    /// Switch the scheduling policy at runtime.
    ///
    /// `algorithm` is 0 for SJF, 1 for CFS; `is_preemptive` takes effect
    /// only under SJF; `a` is the smoothing percentage and must be within
    /// 0..=100 when selecting SJF.
    ///
    /// Returns 0 on success, -2 for a bad algorithm or negative
    /// `is_preemptive`, -3 for a smoothing value out of range. On success
    /// the ready heap is rebuilt under the new key while the scheduler
    /// lock is held, so the switch is safe against concurrent dispatch.
    pub fn change_sched(&self, algorithm: i32, is_preemptive: i32, a: i32) -> i32 {
        let Some(algorithm) = SchedAlgorithm::from_code(algorithm) else {
            return -2;
        };
        if is_preemptive < 0 {
            return -2;
        }
        if algorithm == SchedAlgorithm::Sjf && !(0..=100).contains(&a) {
            return -3;
        }

        self.sched.acquire();
        let sp = self.sched.data();
        sp.algorithm = algorithm;
        sp.is_preemptive = is_preemptive != 0;
        sp.a = a.clamp(0, 100) as u64;
        let n = sp.heap_size;
        rearrange(sp, &self.procs, n);
        self.sched.release();

        kinfo!(
            "sched policy now {} (preemptive={}, a={})",
            algorithm.as_str(),
            is_preemptive != 0,
            a.clamp(0, 100)
        );
        0
    }

    /// The `chsched` syscall surface.
    pub fn chsched(&self, algorithm: i32, is_preemptive: i32, a: i32) -> i32 {
        self.change_sched(algorithm, is_preemptive, a)
    }
}
