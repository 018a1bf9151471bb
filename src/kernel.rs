//! The simulated machine.
//!
//! A [`Kernel`] owns the process table, the simulated CPUs, the scheduler
//! policy record, and the locks tying them together. It is an explicit
//! value rather than module statics so tests can boot several machines in
//! one host process.
//!
//! Lock order, outermost first: `wait_lock`, then any per-process lock,
//! then the scheduler lock. A context holding one process lock never takes
//! another while also taking the scheduler lock.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once, Weak};
use std::thread::JoinHandle;

use crate::process::{Pid, Proc, ProcBody, NPROC};
use crate::sched::core::scheduler_loop;
use crate::sched::smp::{self, Cpu, MAX_CPUS};
use crate::sched::types::{SchedPolicy, SchedulerStats};
use crate::sync::SpinLock;
use crate::{kinfo, kpanic};

/// Unwind payload of [`ProcCtx::exit`]; absorbed by the process wrapper.
pub(crate) struct ExitRequest(pub i32);

static EXIT_HOOK: Once = Once::new();

/// Keep the default panic hook quiet about the controlled unwind that
/// implements process exit.
fn install_exit_hook() {
    EXIT_HOOK.call_once(|| {
        let default = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if info.payload().is::<ExitRequest>() {
                return;
            }
            default(info);
        }));
    });
}

/// Parent links, guarded by `wait_lock`. Indexed by process-table slot.
pub(crate) struct ParentMap {
    pub parent: [Option<usize>; NPROC],
}

impl ParentMap {
    const fn new() -> Self {
        Self {
            parent: [None; NPROC],
        }
    }
}

/// One simulated machine: process table, CPUs, scheduler state.
pub struct Kernel {
    /// Self-reference handed to the threads the kernel starts.
    pub(crate) me: Weak<Kernel>,
    pub(crate) procs: Vec<Arc<Proc>>,
    pub(crate) cpus: Vec<Arc<Cpu>>,
    /// The scheduler policy singleton: ready heap plus runtime knobs.
    pub(crate) sched: SpinLock<SchedPolicy>,
    /// Guards parent/child links; taken before any process lock.
    pub(crate) wait_lock: SpinLock<ParentMap>,
    /// Guards the pid counter.
    pub(crate) pid_lock: SpinLock<Pid>,
    /// Monotonic timer tick counter.
    pub(crate) ticks: AtomicU64,
    pub(crate) stats: spin::Mutex<SchedulerStats>,
    /// Slot + 1 of the init process; 0 before userinit.
    pub(crate) initproc: AtomicUsize,
    /// Unexpected panics absorbed from process bodies.
    pub(crate) body_panics: AtomicU64,
    running: AtomicBool,
    cpu_threads: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Kernel {
    /// Create a machine with `ncpu` simulated CPUs (clamped to
    /// 1..=[`MAX_CPUS`]). The scheduler loops are not running yet; call
    /// [`Kernel::start`], or use [`Kernel::boot`].
    pub fn new(ncpu: usize) -> Arc<Self> {
        install_exit_hook();
        let ncpu = ncpu.clamp(1, MAX_CPUS);

        let mut procs = Vec::with_capacity(NPROC);
        for _ in 0..NPROC {
            procs.push(Arc::new(Proc::new()));
        }
        let mut cpus = Vec::with_capacity(ncpu);
        for id in 0..ncpu {
            cpus.push(Arc::new(Cpu::new(id)));
        }

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            procs,
            cpus,
            sched: SpinLock::new("sched", SchedPolicy::new()),
            wait_lock: SpinLock::new("wait_lock", ParentMap::new()),
            pid_lock: SpinLock::new("nextpid", 1),
            ticks: AtomicU64::new(0),
            stats: spin::Mutex::new(SchedulerStats::new()),
            initproc: AtomicUsize::new(0),
            body_panics: AtomicU64::new(0),
            running: AtomicBool::new(false),
            cpu_threads: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Arc of this kernel, for threads it starts.
    pub(crate) fn arc(&self) -> Arc<Self> {
        self.me.upgrade().expect("kernel dropped while in use")
    }

    /// Start every CPU's scheduler loop.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut threads = self.cpu_threads.lock();
        for cpu in &self.cpus {
            let kernel = self.arc();
            let cpu = cpu.clone();
            let handle = std::thread::Builder::new()
                .name(format!("cpu{}", cpu.id))
                .spawn(move || scheduler_loop(kernel, cpu))
                .expect("spawn scheduler loop");
            threads.push(handle);
        }
        kinfo!("vireo scheduler online ({} cpus)", self.cpus.len());
    }

    /// Create and start a machine in one step.
    pub fn boot(ncpu: usize) -> Arc<Self> {
        let kernel = Self::new(ncpu);
        kernel.start();
        kernel
    }

    /// Stop the scheduler loops once the ready heap drains, and join them.
    /// Processes parked in `Sleeping` or unreaped `Zombie` states keep
    /// their threads parked; they go away with the host process.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handles: Vec<_> = self.cpu_threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn proc(&self, slot: usize) -> &Arc<Proc> {
        &self.procs[slot]
    }

    /// Current global tick count.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Unexpected panics swallowed from process bodies. A healthy run
    /// reports zero.
    pub fn body_panics(&self) -> u64 {
        self.body_panics.load(Ordering::Relaxed)
    }

    /// Slot of the process running on the calling thread's CPU.
    pub(crate) fn my_slot(&self) -> Option<usize> {
        smp::current_cpu()?.proc_slot()
    }

    /// Sleep channel identifying a process, for parent/child waits.
    pub(crate) fn proc_chan(&self, slot: usize) -> usize {
        Arc::as_ptr(&self.procs[slot]) as usize
    }

    /// Table slot currently holding `pid`, if any.
    pub(crate) fn slot_of_pid(&self, pid: Pid) -> Option<usize> {
        for slot in 0..NPROC {
            let p = &self.procs[slot];
            p.lock.acquire();
            let inner = p.lock.data();
            let found = inner.pid == pid && inner.state != crate::process::ProcState::Unused;
            p.lock.release();
            if found {
                return Some(slot);
            }
        }
        None
    }
}

/// Handle a process body uses to talk to its kernel.
///
/// Every method must be called from the process's own thread (the thread
/// the body runs on); the kernel resolves "the current process" through
/// the CPU the thread is bound to.
pub struct ProcCtx {
    pub(crate) kernel: Arc<Kernel>,
    pub(crate) slot: usize,
    pub(crate) pid: Pid,
}

impl ProcCtx {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Burn `n` ticks of simulated user-mode execution. Each tick advances
    /// the global clock, delivers the timer interrupt (which may preempt),
    /// and observes a pending kill.
    pub fn compute(&self, n: u64) {
        for _ in 0..n {
            if !smp::intr_get() {
                kpanic!("compute with interrupts off");
            }
            if self.kernel.procs[self.slot].killed() {
                self.exit(-1);
            }
            self.kernel.ticks.fetch_add(1, Ordering::Relaxed);
            self.kernel.timer_tick(self.slot);
        }
    }

    /// Voluntarily give up the CPU for one scheduling round.
    pub fn yield_now(&self) {
        self.kernel.stats.lock().voluntary_switches += 1;
        self.kernel.yield_cpu(self.slot);
    }

    /// Atomically release `lk` and sleep on `chan`; `lk` is held again on
    /// return. Wakeups may be spurious; re-check the condition.
    pub fn sleep_on<T>(&self, chan: usize, lk: &SpinLock<T>) {
        self.kernel.sleep(chan, lk);
    }

    /// Wake every process sleeping on `chan`.
    pub fn wakeup(&self, chan: usize) {
        self.kernel.wakeup(chan);
    }

    /// Create a child process.
    pub fn spawn(&self, name: &str, body: ProcBody) -> Result<Pid, &'static str> {
        self.kernel.spawn(name, body)
    }

    /// Block until a child exits; `None` when there are no children or
    /// this process has been killed.
    pub fn wait(&self) -> Option<(Pid, i32)> {
        self.kernel.wait()
    }

    /// Request that `pid` die at its next user-return boundary.
    pub fn kill(&self, pid: Pid) -> Result<(), &'static str> {
        self.kernel.kill(pid)
    }

    /// Whether this process has a pending kill.
    pub fn killed(&self) -> bool {
        self.kernel.procs[self.slot].killed()
    }

    /// Switch the scheduling policy; see [`Kernel::change_sched`].
    pub fn change_sched(&self, algorithm: i32, is_preemptive: i32, a: i32) -> i32 {
        self.kernel.change_sched(algorithm, is_preemptive, a)
    }

    /// Terminate the current process with `status`. Never returns.
    pub fn exit(&self, status: i32) -> ! {
        std::panic::panic_any(ExitRequest(status));
    }
}
