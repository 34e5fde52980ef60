//! The versioned value cell at the bottom of the tree.
//!
//! A [`VersionedValue`] is a single payload slot guarded by a version word.
//! The word's flags encode the leaf lifecycle:
//!
//! | insert | valid | meaning |
//! |---|---|---|
//! | 1 | 0 | allocated by an inserter, not yet visible |
//! | 0 | 1 | present |
//! | 0 | 0 | logically absent (never committed or removed) |
//!
//! The `(1,1)` combination never occurs. Once created, a leaf's address is
//! stable for the life of the tree; `remove` clears the valid bit but keeps
//! the allocation.
//!
//! # Snapshot reads
//!
//! Readers never lock. [`VersionedValue::read_snapshot`] samples the version,
//! reads the payload between two acquire fences, samples again, and retries
//! until the two samples match and the word is unlocked. Writers store the
//! payload before publishing the new version word, so an unlocked stable
//! pair is never torn.
//!
//! The payload is read with `ptr::read_volatile` and only materialized when
//! the valid bit is set, which is the seqlock idiom and the reason for the
//! `V: Copy` bound.

use std::cell::UnsafeCell;
use std::fmt as StdFmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{Ordering, fence};

use crate::version::{INCREMENT, INSERT_BIT, TxVersion, VALID_BIT, Version};

/// A single-slot payload cell with a version word.
#[repr(C, align(64))]
pub struct VersionedValue<V> {
    /// Version word: lock, valid, insert, and the optimistic-read timestamp.
    version: TxVersion,

    /// The payload. Initialized iff a put has published the valid bit.
    cell: UnsafeCell<MaybeUninit<V>>,
}

impl<V: Copy> VersionedValue<V> {
    /// Create a leaf in the allocated-not-visible state `(insert=1, valid=0)`.
    #[must_use]
    pub fn new_inserting() -> Self {
        Self {
            version: TxVersion::from_word(INSERT_BIT),
            cell: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Boxed variant of [`VersionedValue::new_inserting`].
    #[must_use]
    pub fn boxed_inserting() -> Box<Self> {
        Box::new(Self::new_inserting())
    }

    /// The leaf's version word.
    #[inline]
    #[must_use]
    pub const fn version(&self) -> &TxVersion {
        &self.version
    }

    /// Snapshot a consistent `(version, payload)` pair without locking.
    ///
    /// Returns the payload only when the snapshot's valid bit is set; the
    /// returned [`Version`] is the one to use as a read-set timestamp either
    /// way.
    pub fn read_snapshot(&self) -> (Version, Option<V>) {
        loop {
            let v1 = self.version.load();
            if v1.is_locked() {
                std::hint::spin_loop();
                continue;
            }

            fence(Ordering::Acquire);
            // SAFETY: the cell may be concurrently written; the volatile read
            // of a MaybeUninit produces no reference into the cell and the
            // result is discarded unless the version pair below validates,
            // which proves no writer overlapped the read.
            let raw = unsafe { std::ptr::read_volatile(self.cell.get()) };
            fence(Ordering::Acquire);

            let v2 = self.version.load();
            if v1 == v2 {
                let value = if v1.is_valid() {
                    // SAFETY: the valid bit is only published after a
                    // complete payload store, and the stable version pair
                    // proves the bytes read belong to that store.
                    Some(unsafe { raw.assume_init() })
                } else {
                    None
                };
                return (v1, value);
            }

            std::hint::spin_loop();
        }
    }

    /// Store the payload while the leaf lock is held.
    ///
    /// The new version word must be published afterwards via
    /// [`TxVersion::set_version`] or a guard; until then readers retry on the
    /// lock bit.
    ///
    /// # Safety
    /// The caller must hold this leaf's version lock.
    pub unsafe fn write_payload(&self, value: V) {
        debug_assert!(
            self.version.load().is_locked(),
            "write_payload() without the lock held"
        );

        // SAFETY: the lock excludes all other writers; concurrent snapshot
        // readers discard torn bytes via the version pair check.
        unsafe { std::ptr::write_volatile(self.cell.get(), MaybeUninit::new(value)) };
    }

    /// Non-transactional put: lock, store, publish `(insert=0, valid=1)`.
    pub fn put(&self, value: V) {
        let mut guard = self.version.lock_guard();

        // SAFETY: guard holds the leaf lock.
        unsafe { self.write_payload(value) };

        let next = ((guard.word() + INCREMENT) | VALID_BIT) & !INSERT_BIT;
        guard.set(next);
    }

    /// Non-transactional remove: lock, publish `(insert=0, valid=0)`.
    ///
    /// The payload allocation is retained; only the flags change.
    pub fn remove(&self) {
        let mut guard = self.version.lock_guard();

        let next = (guard.word() + INCREMENT) & !(VALID_BIT | INSERT_BIT);
        guard.set(next);
    }
}

impl<V: Copy> Default for VersionedValue<V> {
    fn default() -> Self {
        Self::new_inserting()
    }
}

impl<V> StdFmt::Debug for VersionedValue<V> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("VersionedValue")
            .field("version", &self.version.load())
            .finish_non_exhaustive()
    }
}

// SAFETY: the payload cell is only written under the version lock and only
// read through the snapshot protocol (or under the lock); V: Copy means no
// drop glue can observe a torn value.
unsafe impl<V: Copy + Send> Send for VersionedValue<V> {}
unsafe impl<V: Copy + Send> Sync for VersionedValue<V> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_leaf_is_inserting() {
        let leaf: VersionedValue<u64> = VersionedValue::new_inserting();
        let (ver, value) = leaf.read_snapshot();

        assert!(ver.is_inserting());
        assert!(!ver.is_valid());
        assert!(value.is_none());
    }

    #[test]
    fn test_put_makes_present() {
        let leaf: VersionedValue<u64> = VersionedValue::new_inserting();
        leaf.put(42);

        let (ver, value) = leaf.read_snapshot();
        assert!(ver.is_valid());
        assert!(!ver.is_inserting(), "put must clear the insert bit");
        assert_eq!(value, Some(42));
    }

    #[test]
    fn test_remove_makes_absent() {
        let leaf: VersionedValue<u64> = VersionedValue::new_inserting();
        leaf.put(7);
        leaf.remove();

        let (ver, value) = leaf.read_snapshot();
        assert!(!ver.is_valid());
        assert!(!ver.is_inserting());
        assert!(value.is_none());
    }

    #[test]
    fn test_remove_then_put_reuses_cell() {
        let leaf: VersionedValue<u64> = VersionedValue::new_inserting();
        leaf.put(1);
        leaf.remove();
        leaf.put(2);

        let (ver, value) = leaf.read_snapshot();
        assert!(ver.is_valid());
        assert_eq!(value, Some(2));
    }

    #[test]
    fn test_insert_and_valid_never_both() {
        let leaf: VersionedValue<u64> = VersionedValue::new_inserting();

        for _ in 0..3 {
            leaf.put(9);
            let v = leaf.version().load();
            assert!(!(v.is_inserting() && v.is_valid()));

            leaf.remove();
            let v = leaf.version().load();
            assert!(!(v.is_inserting() && v.is_valid()));
        }
    }

    #[test]
    fn test_version_monotonic() {
        let leaf: VersionedValue<u64> = VersionedValue::new_inserting();
        let mut last = leaf.version().load().counter();

        for i in 0..10u64 {
            if i % 3 == 2 {
                leaf.remove();
            } else {
                leaf.put(i);
            }

            let now = leaf.version().load().counter();
            assert!(now > last);
            last = now;
        }
    }

    #[test]
    fn test_concurrent_snapshot_not_torn() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::thread;

        let leaf: Arc<VersionedValue<[u8; 12]>> = Arc::new(VersionedValue::new_inserting());
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let leaf = Arc::clone(&leaf);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let payloads = [[0xaau8; 12], [0x55u8; 12]];
                let mut i = 0usize;
                while !stop.load(Ordering::Relaxed) {
                    leaf.put(payloads[i % 2]);
                    i += 1;
                }
            })
        };

        for _ in 0..50_000 {
            let (_, value) = leaf.read_snapshot();
            if let Some(bytes) = value {
                assert!(
                    bytes == [0xaau8; 12] || bytes == [0x55u8; 12],
                    "torn read: {bytes:?}"
                );
            }
        }

        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }
}
