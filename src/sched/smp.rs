//! Simulated CPUs and interrupt state.
//!
//! Each simulated CPU owns its scheduler context, the slot of the process
//! it is currently running, and the interrupt bookkeeping the spinlock
//! discipline needs: the `noff` nesting depth of `push_off` sections and
//! the `intena` flag recording whether interrupts were enabled when the
//! outermost section began.
//!
//! A scheduler loop thread binds itself to its CPU at startup; a process
//! thread re-binds on every resume to whichever CPU dispatched it, so at
//! any instant exactly one host thread speaks for a CPU. Threads outside
//! any CPU (the test harness, external wakers) carry the same interrupt
//! bookkeeping thread-locally and get a unique execution-context id so
//! lock ownership stays unambiguous.

use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::kpanic;
use crate::sched::context::Context;

/// Upper bound on simulated CPUs per kernel.
pub const MAX_CPUS: usize = 8;

/// One simulated CPU.
pub struct Cpu {
    pub id: usize,
    /// Slot + 1 of the process running on this CPU; 0 when idle.
    proc_slot: AtomicUsize,
    /// The CPU's scheduler execution context.
    pub(crate) context: Context,
    /// Depth of nested push_off sections.
    noff: AtomicU32,
    /// Interrupt-enable state before the outermost push_off.
    intena: AtomicBool,
    /// Simulated interrupt-enable flag.
    intr: AtomicBool,
}

impl Cpu {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            proc_slot: AtomicUsize::new(0),
            context: Context::new(),
            noff: AtomicU32::new(0),
            intena: AtomicBool::new(false),
            intr: AtomicBool::new(false),
        }
    }

    /// Slot of the process currently running on this CPU, if any.
    pub fn proc_slot(&self) -> Option<usize> {
        match self.proc_slot.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n - 1),
        }
    }

    pub(crate) fn set_proc(&self, slot: Option<usize>) {
        self.proc_slot
            .store(slot.map_or(0, |s| s + 1), Ordering::Relaxed);
    }

    pub(crate) fn noff(&self) -> u32 {
        self.noff.load(Ordering::Relaxed)
    }

    pub(crate) fn intena(&self) -> bool {
        self.intena.load(Ordering::Relaxed)
    }

    pub(crate) fn set_intena(&self, value: bool) {
        self.intena.store(value, Ordering::Relaxed);
    }

    fn push_off(&self) {
        let was_on = self.intr.swap(false, Ordering::Relaxed);
        if self.noff.load(Ordering::Relaxed) == 0 {
            self.intena.store(was_on, Ordering::Relaxed);
        }
        self.noff.fetch_add(1, Ordering::Relaxed);
    }

    fn pop_off(&self) {
        if self.intr.load(Ordering::Relaxed) {
            kpanic!("pop_off: interruptible");
        }
        let noff = self.noff.load(Ordering::Relaxed);
        if noff < 1 {
            kpanic!("pop_off: unbalanced");
        }
        self.noff.store(noff - 1, Ordering::Relaxed);
        if noff == 1 && self.intena.load(Ordering::Relaxed) {
            self.intr.store(true, Ordering::Relaxed);
        }
    }
}

/// Interrupt bookkeeping for threads running outside any simulated CPU.
#[derive(Clone, Copy)]
struct ExtState {
    /// Context id, assigned on first use; 0 means unassigned.
    id: usize,
    noff: u32,
    intena: bool,
    intr: bool,
}

thread_local! {
    static CURRENT_CPU: RefCell<Option<Arc<Cpu>>> = const { RefCell::new(None) };
    static EXT: Cell<ExtState> = const {
        Cell::new(ExtState { id: 0, noff: 0, intena: false, intr: false })
    };
}

/// Context ids for off-CPU threads start above every possible CPU id.
static NEXT_EXT_ID: AtomicUsize = AtomicUsize::new(MAX_CPUS);

/// Bind (or unbind) the calling thread to a simulated CPU.
pub(crate) fn bind_cpu(cpu: Option<Arc<Cpu>>) {
    CURRENT_CPU.with(|c| *c.borrow_mut() = cpu);
}

/// The CPU the calling thread currently speaks for.
pub(crate) fn current_cpu() -> Option<Arc<Cpu>> {
    CURRENT_CPU.with(|c| c.borrow().clone())
}

/// Stable execution-context id of the calling thread: the bound CPU's id,
/// or a unique per-thread id when off-CPU.
pub(crate) fn ctx_id() -> usize {
    if let Some(cpu) = current_cpu() {
        return cpu.id;
    }
    EXT.with(|e| {
        let mut state = e.get();
        if state.id == 0 {
            state.id = NEXT_EXT_ID.fetch_add(1, Ordering::Relaxed);
            e.set(state);
        }
        state.id
    })
}

/// Disable interrupts, tracking nesting depth.
pub(crate) fn push_off() {
    if let Some(cpu) = current_cpu() {
        cpu.push_off();
        return;
    }
    EXT.with(|e| {
        let mut state = e.get();
        let was_on = state.intr;
        state.intr = false;
        if state.noff == 0 {
            state.intena = was_on;
        }
        state.noff += 1;
        e.set(state);
    });
}

/// Undo one push_off, restoring the interrupt flag at depth zero.
pub(crate) fn pop_off() {
    if let Some(cpu) = current_cpu() {
        cpu.pop_off();
        return;
    }
    EXT.with(|e| {
        let mut state = e.get();
        if state.intr {
            kpanic!("pop_off: interruptible");
        }
        if state.noff < 1 {
            kpanic!("pop_off: unbalanced");
        }
        state.noff -= 1;
        if state.noff == 0 && state.intena {
            state.intr = true;
        }
        e.set(state);
    });
}

/// Enable interrupts on the current CPU.
pub(crate) fn intr_on() {
    if let Some(cpu) = current_cpu() {
        cpu.intr.store(true, Ordering::Relaxed);
        return;
    }
    EXT.with(|e| {
        let mut state = e.get();
        state.intr = true;
        e.set(state);
    });
}

/// Whether interrupts are enabled on the current CPU.
pub(crate) fn intr_get() -> bool {
    if let Some(cpu) = current_cpu() {
        return cpu.intr.load(Ordering::Relaxed);
    }
    EXT.with(|e| e.get().intr)
}
