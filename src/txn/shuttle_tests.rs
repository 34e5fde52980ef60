//! Shuttle tests for the commit protocol.
//!
//! Shuttle explores randomized thread schedules over a small model of the
//! four-phase commit: versioned registers, sorted lock acquisition, check
//! after lock, install after check. The model mirrors the manager's control
//! flow with shuttle-visible yields in every spin so the scheduler can
//! always make progress.
//!
//! Run with: `cargo test --lib txn::shuttle_tests`
//!
//! NOTE: iteration counts are kept small; these tests run in the normal
//! test suite.

use shuttle::sync::Arc;
use shuttle::thread;
use std::sync::atomic::{AtomicU64, Ordering};

const LOCK: u64 = 1;
const INCR: u64 = 8;

/// A versioned register: the commit model's stand-in for a leaf.
struct Register {
    version: AtomicU64,
    value: AtomicU64,
}

impl Register {
    fn new() -> Self {
        Self {
            version: AtomicU64::new(0),
            value: AtomicU64::new(0),
        }
    }

    /// Optimistic snapshot: `(version, value)` with the seqlock retry loop.
    fn snapshot(&self) -> (u64, u64) {
        loop {
            let v1 = self.version.load(Ordering::Acquire);
            if v1 & LOCK != 0 {
                thread::yield_now();
                continue;
            }

            let value = self.value.load(Ordering::Acquire);

            let v2 = self.version.load(Ordering::Acquire);
            if v1 == v2 {
                return (v1, value);
            }

            thread::yield_now();
        }
    }

    fn lock(&self) {
        loop {
            let cur = self.version.load(Ordering::Relaxed);
            if cur & LOCK == 0
                && self
                    .version
                    .compare_exchange(cur, cur | LOCK, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }

            thread::yield_now();
        }
    }

    fn unlock(&self) {
        let cur = self.version.load(Ordering::Relaxed);
        self.version.store(cur & !LOCK, Ordering::Release);
    }

    fn check(&self, recorded: u64) -> bool {
        // Equality ignoring the lock bit; a foreign lock means a concurrent
        // installer, handled by the caller tracking its own locks.
        (self.version.load(Ordering::Acquire) ^ recorded) & !LOCK == 0
    }

    fn install(&self, value: u64) {
        self.value.store(value, Ordering::Release);
        let cur = self.version.load(Ordering::Relaxed);
        self.version.store(cur + INCR, Ordering::Release);
    }
}

/// One read-modify-write transaction over the given registers: read all,
/// stage `+1` writes, run the four phases. Returns true on commit.
fn increment_all(regs: &[Arc<Register>]) -> bool {
    // Execution phase: record read versions and staged values.
    let staged: Vec<(u64, u64)> = regs.iter().map(|r| r.snapshot()).collect();

    // Phase 1: lock in address order (the slice is pre-sorted by the test).
    for r in regs {
        r.lock();
    }

    // Phase 2: check all reads. Own locks are held; the predicate ignores
    // the lock bit.
    let ok = regs
        .iter()
        .zip(&staged)
        .all(|(r, &(recorded, _))| r.check(recorded));

    // Phase 3: install.
    if ok {
        for (r, &(_, value)) in regs.iter().zip(&staged) {
            r.install(value + 1);
        }
    }

    // Phase 4: unlock in reverse.
    for r in regs.iter().rev() {
        r.unlock();
    }

    ok
}

#[test]
fn concurrent_increments_serialize() {
    shuttle::check_random(
        || {
            let a = Arc::new(Register::new());
            let b = Arc::new(Register::new());

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let regs = vec![Arc::clone(&a), Arc::clone(&b)];
                    thread::spawn(move || u64::from(increment_all(&regs)))
                })
                .collect();

            let commits: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

            // Every committed transaction bumped both registers by exactly
            // one from the value it read; conflicting interleavings abort.
            assert!(commits >= 1, "at least one transaction must commit");
            assert_eq!(a.value.load(Ordering::Acquire), commits);
            assert_eq!(b.value.load(Ordering::Acquire), commits);
        },
        200,
    );
}

#[test]
fn sorted_lock_order_never_deadlocks() {
    shuttle::check_random(
        || {
            let regs: Vec<Arc<Register>> = (0..3).map(|_| Arc::new(Register::new())).collect();

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let regs = regs.clone();
                    thread::spawn(move || {
                        // Both threads lock in the same order; shuttle would
                        // report a deadlock if any schedule wedged.
                        increment_all(&regs)
                    })
                })
                .collect();

            for h in handles {
                let _ = h.join().unwrap();
            }

            for r in &regs {
                assert_eq!(r.version.load(Ordering::Acquire) & LOCK, 0);
            }
        },
        200,
    );
}
