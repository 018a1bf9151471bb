//! Per-CPU scheduling loop, the switch back into it, and the timer.
//!
//! Each CPU loops forever pulling the minimum-key runnable process off the
//! heap and switching into it; the process returns the CPU by calling
//! `sched_switch` with its own lock held, from yield, sleep, or exit. The
//! process lock travels across the switch: whichever side is running owns
//! it, and the side that stops running leaves it held for the other.

use core::sync::atomic::Ordering;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::kernel::{ExitRequest, Kernel, ProcCtx};
use crate::process::ProcState;
use crate::sched::context::{swtch, Context};
use crate::sched::smp::{self, Cpu};
use crate::sched::types::SchedAlgorithm;
use crate::{kdebug, kerror, kpanic};

/// Nap between empty dispatch attempts so an idle CPU does not burn the
/// host.
const IDLE_NAP: Duration = Duration::from_micros(50);

/// One CPU's scheduler. Runs on its own host thread until the kernel shuts
/// down and the ready heap is empty.
pub(crate) fn scheduler_loop(kernel: Arc<Kernel>, cpu: Arc<Cpu>) {
    smp::bind_cpu(Some(cpu.clone()));
    kdebug!("scheduler loop online");

    loop {
        // Devices must be able to interrupt while we look for work.
        smp::intr_on();

        let Some(slot) = kernel.get() else {
            if !kernel.is_running() {
                break;
            }
            std::thread::sleep(IDLE_NAP);
            continue;
        };

        let p = kernel.proc(slot).clone();
        p.lock.acquire();
        if p.lock.data().state == ProcState::Runnable {
            p.lock.data().state = ProcState::Running;
            p.run_cpu.store(cpu.id, Ordering::Relaxed);
            cpu.set_proc(Some(slot));
            kernel.stats.lock().dispatches += 1;

            // It is the process's job to move itself out of Running (or
            // re-enqueue, in the yield path) before switching back here.
            let ctx = p.context();
            swtch(&cpu.context, &ctx);

            if let Some(cur) = cpu.proc_slot() {
                if kernel.proc(cur).lock.data().state == ProcState::Runnable {
                    kernel.put(cur);
                }
            }
            cpu.set_proc(None);
        }
        p.lock.release();
    }

    kdebug!("scheduler loop offline");
    smp::bind_cpu(None);
}

/// Entry wrapper for a process's kernel thread. Parks until the first
/// dispatch, performs first-run housekeeping, runs the body, and turns its
/// outcome into an exit.
pub(crate) fn proc_entry(kernel: Arc<Kernel>, slot: usize, ctx: Arc<Context>) {
    ctx.switch_out();
    if ctx.reaped() {
        // Freed before ever running.
        return;
    }

    let p = kernel.proc(slot).clone();
    let cpu = kernel.cpus[p.run_cpu.load(Ordering::Relaxed)].clone();
    smp::bind_cpu(Some(cpu));

    // First scheduling: we inherit the process lock the dispatching CPU
    // took before switching here.
    let body = p.lock.data().body.take();
    let pid = p.lock.data().pid;
    p.lock.release();

    let status = if p.killed() {
        // Killed before reaching user mode.
        -1
    } else if let Some(body) = body {
        let pctx = ProcCtx {
            kernel: kernel.clone(),
            slot,
            pid,
        };
        match catch_unwind(AssertUnwindSafe(|| body(&pctx))) {
            Ok(()) => 0,
            Err(payload) => match payload.downcast::<ExitRequest>() {
                Ok(request) => request.0,
                Err(_) => {
                    // A body must not unwind; keep the machine alive and
                    // surface the failure through the exit status.
                    kernel.body_panics.fetch_add(1, Ordering::Relaxed);
                    kerror!("pid {pid} body panicked");
                    -1
                }
            },
        }
    } else {
        0
    };

    kernel.exit_current(slot, status);
    smp::bind_cpu(None);
}

impl Kernel {
    /// Switch from the current process back to the CPU's scheduler
    /// context. The caller must hold exactly its own process lock and must
    /// already have left the `Running` state.
    ///
    /// Returns true when the process was reaped while parked; the thread
    /// must then unwind without touching the slot again.
    pub(crate) fn sched_switch(&self, slot: usize) -> bool {
        let p = self.proc(slot);
        if !p.lock.holding() {
            kpanic!("sched: proc lock not held");
        }
        let Some(cpu) = smp::current_cpu() else {
            kpanic!("sched: not on a cpu");
        };
        if cpu.noff() != 1 {
            kpanic!("sched: locks held");
        }
        if p.lock.data().state == ProcState::Running {
            kpanic!("sched: still running");
        }
        if smp::intr_get() {
            kpanic!("sched: interruptible");
        }

        // intena belongs to this kernel thread, not to the CPU.
        let intena = cpu.intena();
        let ctx = p.context();
        swtch(&ctx, &cpu.context);
        if ctx.reaped() {
            return true;
        }

        // Resume on whichever CPU dispatched us this time.
        let cpu = self.cpus[p.run_cpu.load(Ordering::Relaxed)].clone();
        smp::bind_cpu(Some(cpu.clone()));
        cpu.set_intena(intena);
        false
    }

    /// Give up the CPU for one scheduling round, staying runnable.
    pub(crate) fn yield_cpu(&self, slot: usize) {
        let p = self.proc(slot);
        p.lock.acquire();
        self.put(slot);
        self.sched_switch(slot);
        p.lock.release();
    }

    /// Timer interrupt for the process running on the calling CPU:
    /// account the tick, then preempt when the policy demands it. CFS
    /// preempts on an exhausted slice; SJF preempts every tick when
    /// configured preemptive, so a newly woken shorter job can overtake.
    pub(crate) fn timer_tick(&self, slot: usize) {
        let p = self.proc(slot);
        let burst = p.cpu_burst.fetch_add(1, Ordering::Relaxed) + 1;

        self.sched.acquire();
        let preempt_every_tick = {
            let sp = self.sched.data();
            sp.algorithm == SchedAlgorithm::Sjf && sp.is_preemptive
        };
        self.sched.release();

        let slice = p.timeslice.load(Ordering::Relaxed);
        if (slice != 0 && burst == slice) || preempt_every_tick {
            p.preemptions.fetch_add(1, Ordering::Relaxed);
            self.stats.lock().preemptions += 1;
            self.yield_cpu(slot);
        }
    }
}
