//! Sequence lock guarding the virtual clock state.
//!
//! The protected fields are individual atomics owned by the caller; the lock only publishes a
//! generation counter around each write so readers can detect (and retry) a torn read.

#[cfg(all(feature = "loom", test))]
use loom::sync::atomic::AtomicU32;
#[cfg(not(all(feature = "loom", test)))]
use std::sync::atomic::AtomicU32;

use std::sync::atomic::Ordering;

/// Internal bit used to mark the sequence as "being updated".
///
/// Published sequence values never have this bit set and increment by 1 per completed write.
pub const SEQLOCK_BUSY_BIT: u32 = 1 << 31;

#[derive(Debug)]
pub struct SeqLock {
    sequence: AtomicU32,
}

impl SeqLock {
    pub fn new() -> Self {
        Self {
            sequence: AtomicU32::new(0),
        }
    }

    /// Run `f` as a writer.
    ///
    /// Protocol:
    /// 1) Mark the sequence as "in progress" by setting [`SEQLOCK_BUSY_BIT`].
    /// 2) Run the update.
    /// 3) Increment the sequence (busy bit cleared) as the final publish step.
    ///
    /// Writers are normally serialized by the global lock already; the busy-bit CAS makes a
    /// second concurrent writer spin instead of corrupting the sequence.
    pub fn write<R>(&self, f: impl FnOnce() -> R) -> R {
        let mut start = self.sequence.load(Ordering::SeqCst);
        loop {
            if start & SEQLOCK_BUSY_BIT != 0 {
                std::hint::spin_loop();
                start = self.sequence.load(Ordering::SeqCst);
                continue;
            }

            match self.sequence.compare_exchange_weak(
                start,
                start | SEQLOCK_BUSY_BIT,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => start = actual,
            }
        }

        let out = f();

        let next = start.wrapping_add(1) & !SEQLOCK_BUSY_BIT;
        self.sequence.store(next, Ordering::SeqCst);
        out
    }

    /// Run `f` as a reader, retrying until it observed a consistent generation.
    ///
    /// `f` may run several times and must not have side effects.
    pub fn read<R>(&self, mut f: impl FnMut() -> R) -> R {
        loop {
            let seq0 = self.sequence.load(Ordering::SeqCst);
            if seq0 & SEQLOCK_BUSY_BIT != 0 {
                // Writer in progress.
                std::hint::spin_loop();
                #[cfg(all(feature = "loom", test))]
                loom::thread::yield_now();
                continue;
            }

            let out = f();

            let seq1 = self.sequence.load(Ordering::SeqCst);
            if seq0 == seq1 {
                return out;
            }
        }
    }

    /// Current published generation.
    pub fn generation(&self) -> u32 {
        self.sequence.load(Ordering::SeqCst) & !SEQLOCK_BUSY_BIT
    }
}

impl Default for SeqLock {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::*;

    use loom::sync::atomic::AtomicI64;
    use loom::sync::Arc;
    use loom::thread;

    #[test]
    fn reader_never_observes_torn_pair() {
        loom::model(|| {
            let lock = Arc::new(SeqLock::new());
            let a = Arc::new(AtomicI64::new(0));
            let b = Arc::new(AtomicI64::new(0));

            let (wl, wa, wb) = (lock.clone(), a.clone(), b.clone());
            let writer = thread::spawn(move || {
                wl.write(|| {
                    wa.store(5, Ordering::SeqCst);
                    wb.store(5, Ordering::SeqCst);
                });
            });

            let (x, y) = lock.read(|| (a.load(Ordering::SeqCst), b.load(Ordering::SeqCst)));
            assert_eq!(x, y);

            writer.join().unwrap();
        });
    }
}
