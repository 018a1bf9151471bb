//! Synchronization primitives.
//!
//! The kernel's spinlock, carrying the push/pop-off interrupt discipline
//! that the scheduling protocol is built on.

pub mod spinlock;

pub use spinlock::SpinLock;
