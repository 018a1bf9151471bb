//! The sleep/wakeup protocol: no wakeup issued after a sleeper commits is
//! ever lost.

mod common;

use std::sync::Arc;

use common::wait_for;
use vireo_sched::{Kernel, ProcState, SpinLock};

#[test]
fn wakeup_after_sleep_commit_is_never_lost() {
    let kernel = Kernel::boot(1);

    const CHAN: usize = 0x51EE9;
    const ROUNDS: u64 = 50;
    // Tokens granted so far; the condition the sleeper waits on.
    let tokens = Arc::new(SpinLock::new("tokens", 0u64));

    let sleeper = {
        let tokens = tokens.clone();
        kernel
            .spawn(
                "sleeper",
                Box::new(move |ctx| {
                    for round in 0..ROUNDS {
                        tokens.acquire();
                        while *tokens.data() <= round {
                            ctx.sleep_on(CHAN, &tokens);
                        }
                        tokens.release();
                    }
                }),
            )
            .unwrap()
    };

    for _ in 0..ROUNDS {
        // Only grant once the sleeper is committed: the wakeup that
        // follows must reach it every single time.
        wait_for("sleeper committed", || {
            kernel.process_state(sleeper) == Some(ProcState::Sleeping)
        });
        tokens.acquire();
        *tokens.data() += 1;
        tokens.release();
        kernel.wakeup(CHAN);
    }

    wait_for("sleeper finished every round", || {
        kernel.process_state(sleeper) == Some(ProcState::Zombie)
    });
    assert_eq!(kernel.body_panics(), 0);
    kernel.shutdown();
}

#[test]
fn producer_consumer_over_a_spinlock_channel() {
    let kernel = Kernel::boot(2);

    const CHAN: usize = 0xF00D;
    const ITEMS: u64 = 500;

    struct Channel {
        pending: u64,
        consumed: u64,
    }
    let chan = Arc::new(SpinLock::new(
        "chan",
        Channel {
            pending: 0,
            consumed: 0,
        },
    ));

    let mut consumers = Vec::new();
    for name in ["cons-a", "cons-b"] {
        let chan = chan.clone();
        let pid = kernel
            .spawn(
                name,
                Box::new(move |ctx| loop {
                    chan.acquire();
                    while chan.data().pending == 0 && chan.data().consumed < ITEMS {
                        ctx.sleep_on(CHAN, &chan);
                    }
                    if chan.data().consumed >= ITEMS {
                        chan.release();
                        break;
                    }
                    chan.data().pending -= 1;
                    chan.data().consumed += 1;
                    let drained = chan.data().consumed >= ITEMS;
                    chan.release();
                    if drained {
                        // Release any sibling still waiting for the end.
                        ctx.wakeup(CHAN);
                    }
                }),
            )
            .unwrap();
        consumers.push(pid);
    }

    // Produce from outside the machine, racing the consumers freely.
    let producer = {
        let chan = chan.clone();
        let kernel = kernel.clone();
        std::thread::spawn(move || {
            for i in 0..ITEMS {
                chan.acquire();
                chan.data().pending += 1;
                chan.release();
                kernel.wakeup(CHAN);
                if i % 64 == 0 {
                    std::thread::yield_now();
                }
            }
        })
    };
    producer.join().unwrap();

    wait_for("consumers drained the channel", || {
        consumers
            .iter()
            .all(|&pid| kernel.process_state(pid) == Some(ProcState::Zombie))
    });

    chan.acquire();
    assert_eq!(chan.data().pending, 0);
    assert_eq!(chan.data().consumed, ITEMS);
    chan.release();
    assert_eq!(kernel.body_panics(), 0);
    kernel.shutdown();
}
