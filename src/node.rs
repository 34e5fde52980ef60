//! Interior node of the radix tree.
//!
//! A [`TreeNode`] holds [`FANOUT`] type-erased child slots and a version
//! word. The version word serves two roles:
//!
//! - **Publication mutex**: the low bit locks the node while a missing child
//!   is installed.
//! - **Phantom witness**: transactional readers that find an empty slot
//!   record the node's version; the inserter bumps it under the lock before
//!   publishing, so a validator that sees an unchanged version is guaranteed
//!   no relevant insert happened.
//!
//! Child pointers are `*mut u8` for uniformity: an interior node at depth
//! `d < LEVELS - 1` points at other [`TreeNode`]s, and at depth `LEVELS - 1`
//! at leaves. The tree casts at use sites based on depth.
//!
//! # Invariants
//! - A non-empty slot never reverts to empty and the child is never
//!   reparented.
//! - The slot store happens after the version bump, both under the lock.

use std::fmt as StdFmt;
use std::ptr as StdPtr;
use std::sync::atomic::AtomicPtr;

use crate::key::FANOUT;
use crate::ordering::{READ_ORD, WRITE_ORD};
use crate::version::{TxVersion, VersionGuard};

/// An interior routing node with fixed fan-out.
#[repr(C, align(64))]
pub struct TreeNode {
    /// Version word: publication mutex + phantom witness.
    version: TxVersion,

    /// Child slots. Null means empty; the pointee type depends on depth.
    children: [AtomicPtr<u8>; FANOUT],
}

impl TreeNode {
    /// Create an empty node.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: TxVersion::new(),
            children: std::array::from_fn(|_| AtomicPtr::new(StdPtr::null_mut())),
        }
    }

    /// Create an empty boxed node for insertion into the tree.
    #[must_use]
    pub fn boxed() -> Box<Self> {
        Box::new(Self::new())
    }

    /// The node's version word.
    #[inline]
    #[must_use]
    pub const fn version(&self) -> &TxVersion {
        &self.version
    }

    /// Load the child slot at `index`.
    ///
    /// # Panics
    /// Panics in debug mode if `index >= FANOUT`.
    #[inline]
    #[must_use]
    pub fn child(&self, index: usize) -> *mut u8 {
        debug_assert!(index < FANOUT, "child index {index} out of range");

        self.children[index].load(READ_ORD)
    }

    /// Publish a child into an empty slot while holding the node lock.
    ///
    /// Bumps the version first so that any transactional reader which
    /// recorded this node as an absence witness fails its commit check,
    /// then stores the pointer. The guard must be the one returned by this
    /// node's `version().lock_guard()`.
    ///
    /// # Panics
    /// Panics in debug mode if the slot is occupied.
    pub fn publish_child(&self, guard: &mut VersionGuard<'_>, index: usize, child: *mut u8) {
        debug_assert!(index < FANOUT, "child index {index} out of range");
        debug_assert!(
            self.children[index].load(READ_ORD).is_null(),
            "publish_child into occupied slot {index}"
        );

        guard.bump();
        self.children[index].store(child, WRITE_ORD);
    }

    /// Count non-empty child slots (diagnostics only).
    #[must_use]
    pub fn occupancy(&self) -> usize {
        self.children
            .iter()
            .filter(|slot| !slot.load(READ_ORD).is_null())
            .count()
    }
}

impl Default for TreeNode {
    fn default() -> Self {
        Self::new()
    }
}

impl StdFmt::Debug for TreeNode {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("TreeNode")
            .field("version", &self.version.load())
            .field("occupancy", &self.occupancy())
            .finish_non_exhaustive()
    }
}

// SAFETY: child pointers are published with Release and read with Acquire;
// the pointees are owned by the tree and never freed during its lifetime.
unsafe impl Send for TreeNode {}
unsafe impl Sync for TreeNode {}
