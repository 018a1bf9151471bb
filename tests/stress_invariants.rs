//! Randomized concurrent workload with invariant checks at quiescent
//! points and live policy switches in between.

mod common;

use std::sync::Arc;

use common::{wait_for, XorShift};
use vireo_sched::{Kernel, Pid, ProcState, SpinLock};

const CHAN: usize = 0xBA22;
const WORKERS: usize = 12;
const ROUNDS: u64 = 3;

/// Parent-pointer check over a ready-heap snapshot, plus slot uniqueness.
fn assert_snapshot_is_min_heap(snapshot: &[(usize, u64)]) {
    for i in 1..snapshot.len() {
        assert!(
            snapshot[(i - 1) / 2].1 <= snapshot[i].1,
            "heap property violated at {i}: {snapshot:?}"
        );
    }
    let mut slots: Vec<usize> = snapshot.iter().map(|&(s, _)| s).collect();
    slots.sort_unstable();
    slots.dedup();
    assert_eq!(slots.len(), snapshot.len(), "duplicate heap entry");
}

#[test]
fn randomized_workload_preserves_scheduler_invariants() {
    let kernel = Kernel::boot(4);
    let mut rng = XorShift::new(0x5EED_CAFE);

    // Round barrier: workers sleep until the generation passes their round.
    let generation = Arc::new(SpinLock::new("generation", 0u64));

    let mut pids = Vec::<Pid>::new();
    for i in 0..WORKERS {
        let burst = 1 + rng.below(5);
        let yields = rng.below(3);
        let wants_child = i % 5 == 0;
        let generation = generation.clone();
        let pid = kernel
            .spawn(
                &format!("stress{i}"),
                Box::new(move |ctx| {
                    for round in 0..ROUNDS {
                        ctx.compute(burst);
                        for _ in 0..yields {
                            ctx.yield_now();
                        }
                        if wants_child && round == 0 {
                            ctx.spawn(
                                "ephemeral",
                                Box::new(move |c| {
                                    c.compute(2);
                                }),
                            )
                            .unwrap();
                            ctx.wait().unwrap();
                        }
                        generation.acquire();
                        while *generation.data() <= round {
                            ctx.sleep_on(CHAN, &generation);
                        }
                        generation.release();
                    }
                }),
            )
            .unwrap();
        pids.push(pid);
    }

    let policies = [(0, 0, 100), (1, 0, 50), (0, 1, 30), (1, 0, 70)];
    for round in 0..ROUNDS {
        // Quiesce: every worker parked at the barrier and no ephemeral
        // child still in flight.
        wait_for("workers at barrier", || {
            let parked = pids
                .iter()
                .all(|&pid| kernel.process_state(pid) == Some(ProcState::Sleeping));
            let (runnable, running, sleeping, _) = kernel.process_counts();
            parked && runnable == 0 && running == 0 && sleeping == WORKERS
        });

        // At quiescence the ready heap must be empty and nothing runs.
        assert!(kernel.ready_snapshot().is_empty());
        let (runnable, running, _, _) = kernel.process_counts();
        assert_eq!((runnable, running), (0, 0));

        // Switch policy while everything is parked, then mid-flight too.
        let (algo, preempt, a) = policies[round as usize % policies.len()];
        assert_eq!(kernel.change_sched(algo, preempt, a), 0);

        generation.acquire();
        *generation.data() += 1;
        generation.release();
        kernel.wakeup(CHAN);

        // Heap snapshots are lock-consistent at any instant: the property
        // must hold while the round runs, across another live switch.
        for _ in 0..20 {
            assert_snapshot_is_min_heap(&kernel.ready_snapshot());
            std::thread::sleep(std::time::Duration::from_micros(300));
        }
        let (algo, preempt, a) = policies[(round as usize + 1) % policies.len()];
        assert_eq!(kernel.change_sched(algo, preempt, a), 0);
        assert_snapshot_is_min_heap(&kernel.ready_snapshot());
    }

    wait_for("all workers exited", || {
        pids.iter()
            .all(|&pid| kernel.process_state(pid) == Some(ProcState::Zombie))
    });

    // Final quiescence: zombies only, empty heap, sane counters.
    assert!(kernel.ready_snapshot().is_empty());
    let (runnable, running, sleeping, zombie) = kernel.process_counts();
    assert_eq!((runnable, running, sleeping), (0, 0, 0));
    assert_eq!(zombie, WORKERS);
    assert_eq!(kernel.body_panics(), 0);

    let stats = kernel.stats();
    assert!(stats.dispatches as usize >= WORKERS);
    assert!(stats.spawns as usize >= WORKERS);
    kernel.shutdown();
}

#[test]
fn ready_queue_matches_runnable_set_without_cpus() {
    // With no CPUs running, every spawned process stays queued: the heap
    // must hold exactly the runnable set, each process once.
    let kernel = Kernel::new(2);
    let mut rng = XorShift::new(77);
    let mut pids = Vec::new();
    for i in 0..10 {
        pids.push(
            kernel
                .spawn(&format!("q{i}"), Box::new(|_| {}))
                .unwrap(),
        );
        if rng.below(2) == 0 {
            assert_eq!(kernel.change_sched(1, 0, 50), 0);
        } else {
            assert_eq!(kernel.change_sched(0, 0, 60), 0);
        }
    }

    let mut queued = kernel.ready_pids();
    queued.sort_unstable();
    let mut expected = pids.clone();
    expected.sort_unstable();
    assert_eq!(queued, expected);
    assert_snapshot_is_min_heap(&kernel.ready_snapshot());

    for &pid in &pids {
        assert_eq!(kernel.process_state(pid), Some(ProcState::Runnable));
    }
}
