//! Loom tests for the version-word protocols.
//!
//! Loom explores all interleavings of a small model of the two protocols the
//! version word guards: the seqlock snapshot read and the locked child-slot
//! publication. The real types use `std` atomics, so the models here mirror
//! the access patterns with loom atomics.
//!
//! Run with: `RUSTFLAGS="--cfg loom" cargo test --lib version::loom_tests`
//!
//! NOTE: Loom tests are expensive - keep the number of operations small to
//! avoid state explosion.

use loom::sync::Arc;
use loom::sync::atomic::{AtomicU64, Ordering};
use loom::thread;

const LOCK: u64 = 1;
const INCR: u64 = 8;

/// Seqlock cell: version word + two data words that must change together.
struct Cell {
    version: AtomicU64,
    lo: AtomicU64,
    hi: AtomicU64,
}

impl Cell {
    fn new() -> Self {
        Self {
            version: AtomicU64::new(0),
            lo: AtomicU64::new(0),
            hi: AtomicU64::new(0),
        }
    }

    /// Writer: lock, store both halves, publish new version, unlock.
    fn write(&self, value: u64) {
        loop {
            let cur = self.version.load(Ordering::Relaxed);
            if cur & LOCK != 0 {
                thread::yield_now();
                continue;
            }
            if self
                .version
                .compare_exchange(cur, cur | LOCK, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.lo.store(value, Ordering::Relaxed);
                self.hi.store(value, Ordering::Relaxed);

                let next = (cur | LOCK) + INCR;
                self.version.store(next, Ordering::Release);
                self.version.store(next & !LOCK, Ordering::Release);
                return;
            }
        }
    }

    /// Reader: snapshot, read both halves, validate.
    fn read(&self) -> (u64, u64) {
        loop {
            let v1 = self.version.load(Ordering::Acquire);
            if v1 & LOCK != 0 {
                thread::yield_now();
                continue;
            }

            let lo = self.lo.load(Ordering::Acquire);
            let hi = self.hi.load(Ordering::Acquire);

            let v2 = self.version.load(Ordering::Acquire);
            if v1 == v2 {
                return (lo, hi);
            }

            thread::yield_now();
        }
    }
}

#[test]
fn seqlock_reader_never_sees_torn_pair() {
    loom::model(|| {
        let cell = Arc::new(Cell::new());

        let writer = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || {
                cell.write(7);
            })
        };

        let (lo, hi) = cell.read();
        assert_eq!(lo, hi, "torn read: lo={lo} hi={hi}");
        assert!(lo == 0 || lo == 7);

        writer.join().unwrap();
    });
}

#[test]
fn concurrent_writers_serialize_on_lock() {
    loom::model(|| {
        let cell = Arc::new(Cell::new());

        let handles: Vec<_> = [1u64, 2]
            .iter()
            .map(|&value| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || cell.write(value))
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let (lo, hi) = cell.read();
        assert_eq!(lo, hi);
        // Both writes went through: version advanced exactly twice.
        assert_eq!(cell.version.load(Ordering::Acquire), 2 * INCR);
    });
}

#[test]
fn slot_publication_bumps_witness_version() {
    loom::model(|| {
        // Model of ensure_leaf: a child slot (0 = empty) plus the parent's
        // version word used as a phantom witness.
        let slot = Arc::new(AtomicU64::new(0));
        let witness = Arc::new(AtomicU64::new(0));

        // A transactional reader records the witness before the insert.
        let recorded = witness.load(Ordering::Acquire);

        let inserter = {
            let slot = Arc::clone(&slot);
            let witness = Arc::clone(&witness);
            thread::spawn(move || {
                // Publication protocol: lock witness, bump, publish slot.
                loop {
                    let cur = witness.load(Ordering::Relaxed);
                    if cur & LOCK != 0 {
                        thread::yield_now();
                        continue;
                    }
                    if witness
                        .compare_exchange(cur, cur | LOCK, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                    {
                        witness.store((cur | LOCK) + INCR, Ordering::Release);
                        slot.store(0xdead, Ordering::Release);
                        witness.store(cur + INCR, Ordering::Release);
                        return;
                    }
                }
            })
        };

        inserter.join().unwrap();

        // After the insert is visible, the recorded witness must fail its
        // version check.
        assert_ne!(slot.load(Ordering::Acquire), 0);
        let now = witness.load(Ordering::Acquire);
        assert_ne!(now & !LOCK, recorded & !LOCK, "witness did not move");
    });
}
