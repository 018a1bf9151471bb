//! Process lifecycle and state transitions.
//!
//! The operations that move processes between states and in and out of the
//! ready heap: `put`/`get` (the only sanctioned entry points into the
//! heap), sleep/wakeup, kill, exit, and wait, plus allocation of pids and
//! table slots.
//!
//! Locking: `wait_lock` before any process lock; a process lock before the
//! scheduler lock. Interrupts are off on the calling CPU whenever a
//! process lock is held; the spinlocks enforce that themselves.

use core::sync::atomic::Ordering;
use std::sync::Arc;

use crate::kernel::Kernel;
use crate::process::{Pid, ProcBody, ProcState, NPROC};
use crate::sched::context::Context;
use crate::sched::core::proc_entry;
use crate::sched::priority::{heapify_down_from, heapify_up};
use crate::sched::types::SchedAlgorithm;
use crate::sync::SpinLock;
use crate::{kdebug, kinfo, kpanic, ktrace};

impl Kernel {
    /// Hand out a fresh pid.
    fn allocpid(&self) -> Pid {
        self.pid_lock.acquire();
        let pid = *self.pid_lock.data();
        *self.pid_lock.data() += 1;
        self.pid_lock.release();
        pid
    }

    /// Find an `Unused` table slot, initialize it for `body`, and start the
    /// process's kernel thread parked on a fresh execution context.
    /// Returns the slot with its lock held, or `None` when the table is
    /// full.
    fn allocproc(&self, name: &str, body: ProcBody) -> Option<usize> {
        for slot in 0..NPROC {
            let p = &self.procs[slot];
            p.lock.acquire();
            if p.lock.data().state == ProcState::Unused {
                let pid = self.allocpid();
                {
                    let inner = p.lock.data();
                    inner.pid = pid;
                    inner.state = ProcState::Used;
                    inner.chan = 0;
                    inner.xstate = 0;
                    inner.name.clear();
                    inner.name.push_str(name);
                    inner.body = Some(body);
                }
                p.killed.store(false, Ordering::Relaxed);
                p.reset_stats();

                let ctx = Arc::new(Context::new());
                p.install_context(ctx.clone());
                let kernel = self.arc();
                std::thread::Builder::new()
                    .name(format!("pid{pid}"))
                    .spawn(move || proc_entry(kernel, slot, ctx))
                    .expect("spawn process thread");
                return Some(slot);
            }
            p.lock.release();
        }
        None
    }

    /// Reset a slot to `Unused`. Caller holds `wait_lock` and the process
    /// lock. Returns the retiring incarnation's context so the caller can
    /// release its thread after dropping the locks.
    fn freeproc(&self, slot: usize) -> Arc<Context> {
        let p = &self.procs[slot];
        {
            let inner = p.lock.data();
            inner.pid = 0;
            inner.chan = 0;
            inner.xstate = 0;
            inner.name.clear();
            inner.body = None;
            inner.state = ProcState::Unused;
        }
        p.killed.store(false, Ordering::Relaxed);
        p.reset_stats();
        p.context()
    }

    /// Create the first process. It enters the scheduler through `put`
    /// like everything else.
    pub fn userinit(&self, body: ProcBody) -> Result<Pid, &'static str> {
        if self.initproc.load(Ordering::Relaxed) != 0 {
            return Err("init already exists");
        }
        let slot = self
            .allocproc("initcode", body)
            .ok_or("no free process slots")?;
        self.initproc.store(slot + 1, Ordering::Relaxed);
        let pid = self.procs[slot].lock.data().pid;
        self.put(slot);
        self.procs[slot].lock.release();
        kinfo!("init process pid {pid} created");
        Ok(pid)
    }

    /// Create a process. The caller's process, if any, becomes the parent
    /// (the fork hook); otherwise the child starts orphaned.
    pub fn spawn(&self, name: &str, body: ProcBody) -> Result<Pid, &'static str> {
        let parent = self.my_slot();
        let slot = self.allocproc(name, body).ok_or("no free process slots")?;
        let pid = self.procs[slot].lock.data().pid;
        self.procs[slot].lock.release();

        self.wait_lock.acquire();
        self.wait_lock.data().parent[slot] = parent;
        self.wait_lock.release();

        self.put(slot);
        self.stats.lock().spawns += 1;
        kdebug!("spawned '{name}' as pid {pid}");
        Ok(pid)
    }

    /// Enqueue a process as `Runnable`.
    ///
    /// Callers already holding the process lock (yield, wakeup, kill, the
    /// CPU loop) pass straight through the lock acquisition. A process
    /// that is already `Runnable` is already queued, so the call is a
    /// no-op, which keeps the heap duplicate-free when the CPU loop
    /// re-enqueues after a yield that already called `put`.
    pub(crate) fn put(&self, slot: usize) {
        let p = &self.procs[slot];
        let already_locked = p.lock.holding();
        if !already_locked {
            p.lock.acquire();
        }
        self.sched.acquire();

        let state = p.lock.data().state;
        if state != ProcState::Runnable {
            let sp = self.sched.data();
            let burst = p.cpu_burst.load(Ordering::Relaxed);

            if state != ProcState::Running {
                // Fold the measured burst into the estimate.
                let est = p.cpu_burst_aprox.load(Ordering::Relaxed);
                p.cpu_burst_aprox.store(
                    (sp.a * burst + (100 - sp.a) * est) / 100,
                    Ordering::Relaxed,
                );
            }

            if state == ProcState::Running {
                // Voluntary yield without blocking: keep accumulating.
                p.exe_time.fetch_add(burst, Ordering::Relaxed);
            } else {
                // First enqueue, or back from sleep: the runnable
                // lifecycle starts over.
                p.exe_time.store(0, Ordering::Relaxed);
            }
            p.put_timestamp
                .store(self.ticks.load(Ordering::Relaxed), Ordering::Relaxed);

            p.lock.data().state = ProcState::Runnable;
            sp.heap[sp.heap_size] = slot;
            sp.heap_size += 1;
            let n = sp.heap_size;
            heapify_up(sp, &self.procs, n);
            ktrace!("put slot {slot} (burst {burst})");
        }

        self.sched.release();
        if !already_locked {
            p.lock.release();
        }
    }

    /// Dequeue the minimum-key runnable process, or `None` when the heap
    /// is empty. The caller gets the slot without holding its lock and
    /// must re-check the state under the lock before dispatching.
    pub(crate) fn get(&self) -> Option<usize> {
        self.sched.acquire();
        let sp = self.sched.data();
        if sp.heap_size == 0 {
            self.sched.release();
            return None;
        }

        let ret = sp.heap[0];
        let p = &self.procs[ret];
        p.cpu_burst.store(0, Ordering::Relaxed);
        sp.heap[0] = sp.heap[sp.heap_size - 1];
        sp.heap_size -= 1;
        let n = sp.heap_size;
        heapify_down_from(sp, &self.procs, 0, n);

        match sp.algorithm {
            SchedAlgorithm::Cfs => {
                // Slice proportional to the time spent queued, shared with
                // whoever is still waiting. The +1 also avoids dividing by
                // zero on an empty remainder.
                let waited = self
                    .ticks
                    .load(Ordering::Relaxed)
                    .saturating_sub(p.put_timestamp.load(Ordering::Relaxed));
                let slice = (waited / (n as u64 + 1)).max(1);
                p.timeslice.store(slice, Ordering::Relaxed);
            }
            SchedAlgorithm::Sjf => {
                // Cooperative unless the policy preempts every tick.
                p.timeslice.store(0, Ordering::Relaxed);
            }
        }
        p.dispatches.fetch_add(1, Ordering::Relaxed);

        self.sched.release();
        Some(ret)
    }

    /// Atomically release `lk` and block on `chan`; reacquires `lk` before
    /// returning. Holding the process lock from before `lk` is released
    /// until the state is committed closes the race with `wakeup`.
    pub(crate) fn sleep<T>(&self, chan: usize, lk: &SpinLock<T>) {
        let Some(slot) = self.my_slot() else {
            kpanic!("sleep outside process context");
        };
        let p = &self.procs[slot];

        p.lock.acquire();
        lk.release();

        {
            let inner = p.lock.data();
            inner.chan = chan;
            inner.state = ProcState::Sleeping;
        }

        self.sched_switch(slot);

        p.lock.data().chan = 0;
        p.lock.release();
        lk.acquire();
    }

    /// Wake every process sleeping on `chan`, except the caller's own.
    pub fn wakeup(&self, chan: usize) {
        let me = self.my_slot();
        for slot in 0..NPROC {
            if Some(slot) == me {
                continue;
            }
            let p = &self.procs[slot];
            p.lock.acquire();
            let asleep_here = {
                let inner = p.lock.data();
                inner.state == ProcState::Sleeping && inner.chan == chan
            };
            if asleep_here {
                self.put(slot);
            }
            p.lock.release();
        }
    }

    /// Mark `pid` killed. A sleeping victim is forced runnable so it can
    /// reach the user-return boundary where the kill is observed.
    pub fn kill(&self, pid: Pid) -> Result<(), &'static str> {
        for slot in 0..NPROC {
            let p = &self.procs[slot];
            p.lock.acquire();
            let (found, sleeping) = {
                let inner = p.lock.data();
                (
                    inner.pid == pid && inner.state != ProcState::Unused,
                    inner.state == ProcState::Sleeping,
                )
            };
            if found {
                p.killed.store(true, Ordering::Relaxed);
                if sleeping {
                    self.put(slot);
                }
                p.lock.release();
                kdebug!("kill pid {pid}");
                return Ok(());
            }
            p.lock.release();
        }
        Err("no such process")
    }

    /// Give `slot`'s abandoned children to init. Caller holds `wait_lock`.
    fn reparent(&self, slot: usize) {
        let init_slot = match self.initproc.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n - 1),
        };
        for child in 0..NPROC {
            let is_child = self.wait_lock.data().parent[child] == Some(slot);
            if !is_child {
                continue;
            }
            self.wait_lock.data().parent[child] = init_slot;
            if let Some(init) = init_slot {
                self.wakeup(self.proc_chan(init));
            }
        }
    }

    /// Terminate the current process. Runs on the process's own thread and
    /// does not return to the caller: the final switch parks the thread
    /// until the parent reaps the zombie and retires it.
    pub(crate) fn exit_current(&self, slot: usize, status: i32) {
        if self.initproc.load(Ordering::Relaxed) == slot + 1 {
            kpanic!("init exiting");
        }

        self.wait_lock.acquire();
        self.reparent(slot);
        let parent = self.wait_lock.data().parent[slot];
        if let Some(pp) = parent {
            // Parent might be sleeping in wait().
            self.wakeup(self.proc_chan(pp));
        }

        let p = &self.procs[slot];
        p.lock.acquire();
        {
            let inner = p.lock.data();
            inner.xstate = status;
            inner.state = ProcState::Zombie;
            kdebug!("pid {} exiting with status {status}", inner.pid);
        }
        self.wait_lock.release();

        if self.sched_switch(slot) {
            // Reaped; the slot may already belong to a new process.
            return;
        }
        kpanic!("zombie exit");
    }

    /// Block until one of the caller's children exits; returns its pid and
    /// exit status, or `None` when there are no children or the caller has
    /// been killed.
    pub fn wait(&self) -> Option<(Pid, i32)> {
        let Some(slot) = self.my_slot() else {
            kpanic!("wait outside process context");
        };
        let my_chan = self.proc_chan(slot);

        self.wait_lock.acquire();
        loop {
            let mut havekids = false;
            for np in 0..NPROC {
                let is_child = self.wait_lock.data().parent[np] == Some(slot);
                if !is_child {
                    continue;
                }
                // The lock also makes sure the child is done with exit().
                let p = &self.procs[np];
                p.lock.acquire();
                havekids = true;
                let (zombie, pid, xstate) = {
                    let inner = p.lock.data();
                    (inner.state == ProcState::Zombie, inner.pid, inner.xstate)
                };
                if zombie {
                    self.wait_lock.data().parent[np] = None;
                    let ctx = self.freeproc(np);
                    p.lock.release();
                    self.wait_lock.release();
                    ctx.retire();
                    kdebug!("reaped pid {pid} (status {xstate})");
                    return Some((pid, xstate));
                }
                p.lock.release();
            }

            if !havekids || self.procs[slot].killed() {
                self.wait_lock.release();
                return None;
            }

            self.sleep(my_chan, &self.wait_lock);
        }
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::Ordering;

    use crate::kernel::Kernel;
    use crate::process::ProcState;

    fn noop_body() -> crate::process::ProcBody {
        Box::new(|_| {})
    }

    #[test]
    fn enqueue_from_sleep_applies_smoothing_and_resets_exe_time() {
        let kernel = Kernel::new(1);
        kernel.spawn("est", noop_body()).unwrap();
        let slot = kernel.get().unwrap();
        let p = &kernel.procs[slot];

        // Pretend the process ran for 12 ticks and then blocked.
        p.lock.acquire();
        {
            let inner = p.lock.data();
            inner.state = ProcState::Sleeping;
            inner.chan = 7;
        }
        p.lock.release();
        p.cpu_burst.store(12, Ordering::Relaxed);
        p.exe_time.store(33, Ordering::Relaxed);
        p.cpu_burst_aprox.store(4, Ordering::Relaxed);

        assert_eq!(kernel.change_sched(0, 0, 100), 0);
        kernel.wakeup(7);

        // a = 100: the estimate becomes exactly the last burst, and the
        // runnable lifecycle restarts.
        assert_eq!(p.cpu_burst_aprox.load(Ordering::Relaxed), 12);
        assert_eq!(p.exe_time.load(Ordering::Relaxed), 0);
        p.lock.acquire();
        assert_eq!(p.lock.data().state, ProcState::Runnable);
        p.lock.release();
    }

    #[test]
    fn smoothing_uses_integer_percentages() {
        let kernel = Kernel::new(1);
        kernel.spawn("half", noop_body()).unwrap();
        let slot = kernel.get().unwrap();
        let p = &kernel.procs[slot];

        p.lock.acquire();
        {
            let inner = p.lock.data();
            inner.state = ProcState::Sleeping;
            inner.chan = 9;
        }
        p.lock.release();
        p.cpu_burst.store(10, Ordering::Relaxed);
        p.cpu_burst_aprox.store(5, Ordering::Relaxed);

        // a = 50: (50*10 + 50*5) / 100 == 7 with integer math.
        kernel.wakeup(9);
        assert_eq!(p.cpu_burst_aprox.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn enqueue_of_running_process_accumulates_exe_time_only() {
        let kernel = Kernel::new(1);
        kernel.spawn("yielder", noop_body()).unwrap();
        let slot = kernel.get().unwrap();
        let p = &kernel.procs[slot];

        p.lock.acquire();
        p.lock.data().state = ProcState::Running;
        p.cpu_burst.store(5, Ordering::Relaxed);
        p.exe_time.store(10, Ordering::Relaxed);
        p.cpu_burst_aprox.store(42, Ordering::Relaxed);
        kernel.put(slot);
        p.lock.release();

        assert_eq!(p.cpu_burst_aprox.load(Ordering::Relaxed), 42);
        assert_eq!(p.exe_time.load(Ordering::Relaxed), 15);
    }

    #[test]
    fn put_is_idempotent_for_queued_processes() {
        let kernel = Kernel::new(1);
        kernel.spawn("one", noop_body()).unwrap();
        let slot = kernel.ready_snapshot()[0].0;
        kernel.put(slot);
        kernel.put(slot);
        assert_eq!(kernel.ready_snapshot().len(), 1);
    }

    #[test]
    fn cfs_dequeue_computes_bounded_timeslice() {
        let kernel = Kernel::new(1);
        assert_eq!(kernel.change_sched(1, 0, 50), 0);
        kernel.spawn("a", noop_body()).unwrap();
        kernel.spawn("b", noop_body()).unwrap();

        kernel.ticks.fetch_add(9, Ordering::Relaxed);
        let slot = kernel.get().unwrap();
        // Waited 9 ticks, one process still queued: 9 / (1 + 1) = 4.
        assert_eq!(kernel.procs[slot].timeslice.load(Ordering::Relaxed), 4);

        let slot = kernel.get().unwrap();
        // Empty remainder: 9 / (0 + 1), but never below one tick.
        assert_eq!(kernel.procs[slot].timeslice.load(Ordering::Relaxed), 9);
    }

    #[test]
    fn sjf_dequeue_clears_timeslice() {
        let kernel = Kernel::new(1);
        assert_eq!(kernel.change_sched(1, 0, 50), 0);
        kernel.spawn("p", noop_body()).unwrap();
        kernel.ticks.fetch_add(4, Ordering::Relaxed);
        let slot = kernel.get().unwrap();
        assert!(kernel.procs[slot].timeslice.load(Ordering::Relaxed) >= 1);

        // Dispatch, re-enqueue, switch back to SJF, and dispatch again:
        // the stale slice must not survive into the cooperative policy.
        let p = &kernel.procs[slot];
        p.lock.acquire();
        p.lock.data().state = ProcState::Running;
        kernel.put(slot);
        p.lock.release();
        assert_eq!(kernel.change_sched(0, 0, 50), 0);
        let slot = kernel.get().unwrap();
        assert_eq!(kernel.procs[slot].timeslice.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn spawn_fails_when_table_is_full() {
        let kernel = Kernel::new(1);
        for i in 0..crate::process::NPROC {
            kernel.spawn(&format!("p{i}"), noop_body()).unwrap();
        }
        assert!(kernel.spawn("overflow", noop_body()).is_err());
    }

    #[test]
    fn kill_unknown_pid_fails() {
        let kernel = Kernel::new(1);
        assert!(kernel.kill(4242).is_err());
    }
}
