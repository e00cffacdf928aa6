use crate::handshake::Halted;
use crate::sync::{AtomicBool, AtomicUsize, Backoff, Ordering};

/// Sense-reversing spin barrier for a fixed number of cores.
///
/// The generation counter flips once per crossing, so the barrier can be
/// reused back to back without a separate reset phase. Waiters poll the
/// abort flag and give up with [`Halted`] once it is raised.
pub struct SpinBarrier {
    parties: usize,
    arrived: AtomicUsize,
    generation: AtomicUsize,
}

impl SpinBarrier {
    pub fn new(parties: usize) -> Self {
        Self {
            parties,
            arrived: AtomicUsize::new(0),
            generation: AtomicUsize::new(0),
        }
    }

    /// Number of completed crossings.
    pub fn generation(&self) -> usize {
        self.generation.load(Ordering::Acquire)
    }

    pub fn wait(&self, abort: &AtomicBool) -> Result<(), Halted> {
        // Read the generation before announcing arrival, otherwise the last
        // arriver could flip it underneath us.
        let generation = self.generation.load(Ordering::Acquire);

        if self.arrived.fetch_add(1, Ordering::AcqRel) + 1 == self.parties {
            self.arrived.store(0, Ordering::Relaxed);
            self.generation.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        }

        let mut backoff = Backoff::new();
        while self.generation.load(Ordering::Acquire) == generation {
            if abort.load(Ordering::Acquire) {
                return Err(Halted);
            }
            backoff.snooze();
        }
        Ok(())
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_party_never_blocks() {
        let barrier = SpinBarrier::new(1);
        let abort = AtomicBool::new(false);
        for _ in 0..3 {
            barrier.wait(&abort).unwrap();
        }
        assert_eq!(barrier.generation(), 3);
    }

    #[test]
    fn no_core_leaves_before_all_arrive() {
        const P: usize = 4;
        const ROUNDS: u32 = 200;
        let barrier = Arc::new(SpinBarrier::new(P));
        let abort = Arc::new(AtomicBool::new(false));
        let counter = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..P)
            .map(|_| {
                let (barrier, abort, counter) = (barrier.clone(), abort.clone(), counter.clone());
                thread::spawn(move || {
                    for round in 0..ROUNDS {
                        counter.fetch_add(1, Ordering::SeqCst);
                        barrier.wait(&abort).unwrap();
                        // Everyone incremented before anyone got here.
                        assert!(counter.load(Ordering::SeqCst) >= (round + 1) * P as u32);
                        barrier.wait(&abort).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(barrier.generation(), 2 * ROUNDS as usize);
    }

    #[test]
    fn waiters_halt_when_abort_is_raised() {
        let barrier = Arc::new(SpinBarrier::new(3));
        let abort = Arc::new(AtomicBool::new(false));

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let (barrier, abort) = (barrier.clone(), abort.clone());
                thread::spawn(move || barrier.wait(&abort))
            })
            .collect();

        abort.store(true, Ordering::Release);
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Err(Halted));
        }
    }
}
