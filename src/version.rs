//! The version word shared by interior nodes and leaves.
//!
//! A single `u64` packs four concerns: a spin-lock bit, a presence flag,
//! an insert-in-progress flag, and a monotonic counter used as the
//! optimistic-read timestamp. [`TxVersion`] is the atomic cell; [`Version`]
//! is a copied snapshot with predicate accessors so call sites never do raw
//! bit arithmetic.
//!
//! # Bit Layout
//! Bit 0: `locked` | Bit 1: `valid` | Bit 2: `inserting` | Bits 3-63: counter
//!
//! Every successful update adds [`INCREMENT`] to the word, so the counter
//! portion is monotonically non-decreasing. Flag edits ride along with the
//! same store; observers see pre or post state, never a torn mix.
//!
//! # Concurrency Model
//! 1. Readers: load a [`Version`], validate it again after reading the data
//!    it guards. Locked words are never stable.
//! 2. Scoped writers: `lock_guard()` returns a [`VersionGuard`] that unlocks
//!    on drop (panic-safe).
//! 3. Commit writers: the transaction manager calls `lock()` and `unlock()`
//!    in separate callbacks, with `set_version()` in between.

use std::sync::atomic::AtomicU64;

use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, WRITE_ORD};

// ============================================================================
//  Bit Constants
// ============================================================================

/// Lock bit: the word's owner has exclusive mutation rights.
pub const LOCK_BIT: u64 = 1 << 0;

/// Valid bit: the guarded payload is logically present.
pub const VALID_BIT: u64 = 1 << 1;

/// Insert bit: the cell exists structurally but no put has committed yet.
pub const INSERT_BIT: u64 = 1 << 2;

/// Counter increment. Everything at and above this bit is the timestamp.
pub const INCREMENT: u64 = 1 << 3;

/// Returns true if `a` and `b` are the same version, ignoring the lock bit.
#[inline]
#[must_use]
pub const fn same_version(a: u64, b: u64) -> bool {
    (a ^ b) & !LOCK_BIT == 0
}

// ============================================================================
//  Version (snapshot)
// ============================================================================

/// A copied version-word snapshot.
///
/// Cheap to copy and compare; all predicates operate on the captured word,
/// not the live cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Version(u64);

impl Version {
    /// Wrap a raw word.
    #[inline]
    #[must_use]
    pub const fn new(word: u64) -> Self {
        Self(word)
    }

    /// The raw word.
    #[inline]
    #[must_use]
    pub const fn word(self) -> u64 {
        self.0
    }

    /// Check if the lock bit is set.
    #[inline]
    #[must_use]
    pub const fn is_locked(self) -> bool {
        self.0 & LOCK_BIT != 0
    }

    /// Check if the payload is logically present.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 & VALID_BIT != 0
    }

    /// Check if the cell is structurally allocated but not yet visible.
    #[inline]
    #[must_use]
    pub const fn is_inserting(self) -> bool {
        self.0 & INSERT_BIT != 0
    }

    /// The counter portion of the word.
    #[inline]
    #[must_use]
    pub const fn counter(self) -> u64 {
        self.0 >> 3
    }

    /// Compare against another snapshot, ignoring the lock bit.
    #[inline]
    #[must_use]
    pub const fn same_version_as(self, other: Self) -> bool {
        same_version(self.0, other.0)
    }
}

// ============================================================================
//  TxVersion (atomic cell)
// ============================================================================

/// The atomic version cell embedded in every interior node and leaf.
#[derive(Debug)]
pub struct TxVersion {
    value: AtomicU64,
}

impl TxVersion {
    /// Create a cell with all flags clear and counter zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Create a cell from a raw word.
    #[must_use]
    pub const fn from_word(word: u64) -> Self {
        Self {
            value: AtomicU64::new(word),
        }
    }

    /// Load a snapshot with acquire semantics.
    #[inline]
    #[must_use]
    pub fn load(&self) -> Version {
        Version(self.value.load(READ_ORD))
    }

    /// Load a snapshot inside a region already synchronized by the lock.
    #[inline]
    #[must_use]
    pub fn load_locked(&self) -> Version {
        let v = Version(self.value.load(RELAXED));
        debug_assert!(v.is_locked(), "load_locked() without the lock held");
        v
    }

    // ========================================================================
    //  Raw lock operations (split across commit callbacks)
    // ========================================================================

    /// Spin until the lock bit is acquired. Returns the locked word.
    ///
    /// Critical sections guarded by this lock are a handful of stores, so a
    /// bare spin with `spin_loop` hints is sufficient.
    pub fn lock(&self) -> Version {
        loop {
            let cur = self.value.load(RELAXED);
            if cur & LOCK_BIT == 0 {
                match self.value.compare_exchange_weak(
                    cur,
                    cur | LOCK_BIT,
                    CAS_SUCCESS,
                    CAS_FAILURE,
                ) {
                    Ok(_) => return Version(cur | LOCK_BIT),
                    Err(_) => continue,
                }
            }

            std::hint::spin_loop();
        }
    }

    /// Try to acquire the lock without spinning.
    #[must_use]
    pub fn try_lock(&self) -> Option<Version> {
        let cur = self.value.load(RELAXED);
        if cur & LOCK_BIT != 0 {
            return None;
        }

        self.value
            .compare_exchange(cur, cur | LOCK_BIT, CAS_SUCCESS, CAS_FAILURE)
            .ok()
            .map(|_| Version(cur | LOCK_BIT))
    }

    /// Store a new word while the lock is held. The lock bit stays set.
    #[inline]
    pub fn set_version(&self, word: u64) {
        debug_assert!(
            self.value.load(RELAXED) & LOCK_BIT != 0,
            "set_version() without the lock held"
        );

        self.value.store(word | LOCK_BIT, WRITE_ORD);
    }

    /// Clear the lock bit with release semantics.
    #[inline]
    pub fn unlock(&self) {
        let cur = self.value.load(RELAXED);
        debug_assert!(cur & LOCK_BIT != 0, "unlock() without the lock held");

        self.value.store(cur & !LOCK_BIT, WRITE_ORD);
    }

    // ========================================================================
    //  Scoped lock (RAII)
    // ========================================================================

    /// Acquire the lock and return a guard that releases it on drop.
    #[must_use = "releasing a lock without using the guard is a logic error"]
    pub fn lock_guard(&self) -> VersionGuard<'_> {
        let locked = self.lock();

        VersionGuard {
            version: self,
            word: locked.word(),
        }
    }
}

impl Default for TxVersion {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for TxVersion {
    fn clone(&self) -> Self {
        Self {
            value: AtomicU64::new(self.value.load(RELAXED)),
        }
    }
}

// ============================================================================
//  VersionGuard
// ============================================================================

/// Proof that a version lock is held.
///
/// Mutations go through [`VersionGuard::set`]; the final word minus the lock
/// bit is published when the guard drops, even during unwinding.
#[derive(Debug)]
#[must_use = "releasing a lock without using the guard is a logic error"]
pub struct VersionGuard<'a> {
    version: &'a TxVersion,
    word: u64,
}

impl VersionGuard<'_> {
    /// The word as of the last `set` (lock bit included).
    #[inline]
    #[must_use]
    pub const fn word(&self) -> u64 {
        self.word
    }

    /// Snapshot of the held word.
    #[inline]
    #[must_use]
    pub const fn snapshot(&self) -> Version {
        Version::new(self.word)
    }

    /// Store a new word while holding the lock.
    ///
    /// The store is immediately visible (with the lock bit set); readers
    /// using the snapshot protocol skip locked words, so intermediate states
    /// are never validated.
    #[inline]
    pub fn set(&mut self, word: u64) {
        self.version.set_version(word);
        self.word = word | LOCK_BIT;
    }

    /// Add [`INCREMENT`] to the held word.
    #[inline]
    pub fn bump(&mut self) {
        let next = self.word + INCREMENT;
        self.set(next);
    }
}

impl Drop for VersionGuard<'_> {
    fn drop(&mut self) {
        self.version.value.store(self.word & !LOCK_BIT, WRITE_ORD);
    }
}

#[cfg(all(test, loom))]
mod loom_tests;
