//! Synchronization primitives abstraction for loom testing.
//!
//! When compiled with `--cfg loom`, this module uses loom's atomics so the
//! spin lock, barrier and diagnostic channel can be model checked.
//! Otherwise, it uses std types.

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicBool, AtomicI8, AtomicU32, AtomicUsize, Ordering};

#[cfg(not(loom))]
pub(crate) use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU32, AtomicUsize, Ordering};

// Spins before a waiter starts yielding its time slice between polls.
const SPIN_LIMIT: u32 = 64;

/// Busy-wait helper used by every polling loop in the runtime.
///
/// Never parks the thread: after a short burst of `spin_loop` hints it
/// yields between polls, which keeps the wait a spin on oversubscribed
/// machines.
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self { step: 0 }
    }

    #[cfg(not(loom))]
    pub(crate) fn snooze(&mut self) {
        if self.step < SPIN_LIMIT {
            self.step += 1;
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }

    // loom explores interleavings only at yield points
    #[cfg(loom)]
    pub(crate) fn snooze(&mut self) {
        self.step = self.step.saturating_add(1).min(SPIN_LIMIT);
        loom::thread::yield_now();
    }
}
