//! The transactional concurrent radix tree.
//!
//! [`RadixTree`] is an ordered key/value index over fixed-width keys. A
//! [`KeyTransformer`] expands each key into `LEVELS` nibbles; each nibble
//! indexes one interior level, and the final level points at
//! [`VersionedValue`] leaves.
//!
//! Two interfaces share the structure:
//!
//! - **Raw**: [`get`](RadixTree::get) / [`put`](RadixTree::put) /
//!   [`remove`](RadixTree::remove) mutate leaves directly under leaf locks.
//!   Used for bootstrapping and benchmarks.
//! - **Transactional**: [`trans_get`](RadixTree::trans_get) /
//!   [`trans_put`](RadixTree::trans_put) /
//!   [`trans_remove`](RadixTree::trans_remove) stage intent in a
//!   [`Transaction`]; the manager later drives the [`TxShared`] commit
//!   callbacks.
//!
//! # Phantom prevention
//!
//! A transactional read that misses records the version of the interior
//! node whose child slot was empty. Any inserter filling a slot bumps that
//! node's version under its lock before publishing the pointer, so a
//! validator that sees an unchanged version is guaranteed no relevant
//! insert happened. This trades false conflicts between unrelated inserts
//! under the same node for the cost of key-range locking.
//!
//! # Memory
//!
//! Nodes and leaves are allocated on first traversal past an empty slot and
//! never freed during the tree's lifetime; a removed key leaves its leaf in
//! place with the valid bit cleared, and aborted transactions leave
//! allocated infrastructure for future inserts to reuse. `Drop` frees the
//! whole structure.

use std::fmt as StdFmt;
use std::marker::PhantomData;

use crate::key::{FANOUT, KeyTransformer, U64KeyTransformer};
use crate::leaf::VersionedValue;
use crate::node::TreeNode;
use crate::trace::{debug_log, trace_log};
use crate::txn::{TransItem, Transaction, TxResult, TxShared, TxnError, USER0_BIT};
use crate::version::{INCREMENT, INSERT_BIT, VALID_BIT, Version, same_version};

/// Item flag: the staged write is a put.
const ITEM_PUT_BIT: u64 = USER0_BIT;

/// Item flag: the staged write is a remove.
const ITEM_REMOVE_BIT: u64 = USER0_BIT << 1;

/// Item flag: the item's key is an interior-node absence witness, not a leaf.
const ITEM_EMPTY_BIT: u64 = USER0_BIT << 2;

// ============================================================================
//  Descent
// ============================================================================

/// Where a key's nibble path ends.
enum Descent<V> {
    /// The full path exists; the pointer is the key's leaf.
    Leaf(*mut VersionedValue<V>),

    /// The path stops at an empty child slot. The node is the phantom
    /// witness and the version is its snapshot taken while the slot was
    /// observably empty.
    Missing {
        node: *const TreeNode,
        witness: Version,
    },
}

// ============================================================================
//  RadixTree
// ============================================================================

/// A transactional concurrent radix tree with fan-out [`FANOUT`].
///
/// # Type Parameters
/// * `V` - Payload type. `Copy` because leaves hand values out through
///   lock-free snapshot reads.
/// * `T` - Key transformer (default: [`U64KeyTransformer`]).
/// * `LEVELS` - Nibble count, i.e. tree depth (default: 16 for 64-bit keys).
///
/// # Example
///
/// ```rust
/// use radixtx::tree::RadixTree;
///
/// let tree: RadixTree<u64> = RadixTree::new();
/// tree.put(&1, 42);
/// assert_eq!(tree.get(&1), Some(42));
///
/// tree.remove(&1);
/// assert_eq!(tree.get(&1), None);
/// ```
pub struct RadixTree<V, T = U64KeyTransformer, const LEVELS: usize = 16>
where
    T: KeyTransformer<LEVELS>,
{
    transformer: T,

    /// The root is embedded and never deallocated.
    root: TreeNode,

    _marker: PhantomData<V>,
}

impl<V, T, const LEVELS: usize> RadixTree<V, T, LEVELS>
where
    T: KeyTransformer<LEVELS>,
{
    const LEVELS_CHECK: () = {
        assert!(LEVELS > 0, "LEVELS must be at least 1");
    };

    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        // Trigger compile-time LEVELS check
        let _: () = Self::LEVELS_CHECK;

        Self {
            transformer: T::default(),
            root: TreeNode::new(),
            _marker: PhantomData,
        }
    }

    /// Recursively free a node's subtree. Only called from `drop`, which has
    /// exclusive access.
    fn drop_children(node: &TreeNode, depth: usize) {
        for i in 0..FANOUT {
            let child = node.child(i);
            if child.is_null() {
                continue;
            }

            if depth == LEVELS - 1 {
                // SAFETY: published leaves are uniquely owned by the tree and
                // drop has exclusive access. MaybeUninit payloads carry no
                // drop glue, so a never-written cell is fine to free.
                drop(unsafe { Box::from_raw(child.cast::<VersionedValue<V>>()) });
            } else {
                // SAFETY: interior children at this depth are TreeNodes,
                // uniquely owned by the tree.
                let boxed = unsafe { Box::from_raw(child.cast::<TreeNode>()) };
                Self::drop_children(&boxed, depth + 1);
            }
        }
    }
}

impl<V, T, const LEVELS: usize> Drop for RadixTree<V, T, LEVELS>
where
    T: KeyTransformer<LEVELS>,
{
    fn drop(&mut self) {
        Self::drop_children(&self.root, 0);
    }
}

impl<V, T, const LEVELS: usize> Default for RadixTree<V, T, LEVELS>
where
    T: KeyTransformer<LEVELS>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V, T, const LEVELS: usize> StdFmt::Debug for RadixTree<V, T, LEVELS>
where
    T: KeyTransformer<LEVELS>,
{
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("RadixTree")
            .field("levels", &LEVELS)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

// ============================================================================
//  Descent & insert-path growth
// ============================================================================

impl<V, T, const LEVELS: usize> RadixTree<V, T, LEVELS>
where
    V: Copy + Send + Sync + 'static,
    T: KeyTransformer<LEVELS> + 'static,
{
    /// Walk the nibble path from the root.
    fn descend(&self, nibbles: &[u8; LEVELS]) -> Descent<V> {
        let mut cur: *const TreeNode = &self.root;

        for (depth, &nibble) in nibbles.iter().enumerate() {
            let idx = nibble as usize;
            debug_assert!(idx < FANOUT, "transformer emitted nibble {idx}");

            // SAFETY: cur is the embedded root or a published interior node;
            // published nodes are never freed while the tree is alive.
            let node = unsafe { &*cur };

            let mut child = node.child(idx);
            if child.is_null() {
                match Self::witness_empty_slot(node, idx) {
                    Some(witness) => return Descent::Missing { node: cur, witness },
                    // The slot filled while we looked; follow it.
                    None => child = node.child(idx),
                }
            }

            if depth == LEVELS - 1 {
                return Descent::Leaf(child.cast::<VersionedValue<V>>());
            }

            cur = child.cast::<TreeNode>().cast_const();
        }

        unreachable!("descent must terminate at depth LEVELS - 1")
    }

    /// Snapshot a node's version while one of its slots is observably empty.
    ///
    /// The version is sampled unlocked and the slot re-checked afterwards,
    /// so the snapshot is guaranteed to predate any publication into the
    /// slot. Returns `None` if the slot filled in the meantime.
    fn witness_empty_slot(node: &TreeNode, idx: usize) -> Option<Version> {
        loop {
            let witness = node.version().load();
            if witness.is_locked() {
                // An inserter is mid-publication; wait for the outcome.
                std::hint::spin_loop();
                continue;
            }

            if node.child(idx).is_null() {
                return Some(witness);
            }

            return None;
        }
    }

    /// Descend, constructing any missing part of the key's path.
    ///
    /// Children are built off-tree and installed under the parent's
    /// version-lock: re-check the slot, bump the parent version, publish the
    /// pointer. Exactly one of several racing inserters wins; losers free
    /// their stillborn node before releasing the lock. The version bump
    /// happens even though the new leaf is still invisible (`insert` bit
    /// only), because transactional readers that observed the slot as empty
    /// must fail their version check.
    fn ensure_leaf(&self, nibbles: &[u8; LEVELS]) -> *mut VersionedValue<V> {
        let mut cur: *const TreeNode = &self.root;

        for (depth, &nibble) in nibbles.iter().enumerate() {
            let idx = nibble as usize;
            debug_assert!(idx < FANOUT, "transformer emitted nibble {idx}");

            // SAFETY: see `descend`.
            let node = unsafe { &*cur };
            let leaf_level = depth == LEVELS - 1;

            let mut child = node.child(idx);
            if child.is_null() {
                // Build the missing child off-tree.
                let fresh: *mut u8 = if leaf_level {
                    Box::into_raw(VersionedValue::<V>::boxed_inserting()).cast()
                } else {
                    Box::into_raw(TreeNode::boxed()).cast()
                };

                let mut guard = node.version().lock_guard();
                child = node.child(idx);
                if child.is_null() {
                    node.publish_child(&mut guard, idx, fresh);
                    child = fresh;
                    trace_log!("published child at depth {depth} slot {idx}");
                } else {
                    // Someone else installed the child first.
                    debug_log!("lost insert race at depth {depth} slot {idx}");
                    if leaf_level {
                        // SAFETY: fresh was never published; we own it.
                        drop(unsafe { Box::from_raw(fresh.cast::<VersionedValue<V>>()) });
                    } else {
                        // SAFETY: fresh was never published; we own it.
                        drop(unsafe { Box::from_raw(fresh.cast::<TreeNode>()) });
                    }
                }
                drop(guard);
            }

            if leaf_level {
                return child.cast::<VersionedValue<V>>();
            }

            cur = child.cast::<TreeNode>().cast_const();
        }

        unreachable!("descent must terminate at depth LEVELS - 1")
    }
}

// ============================================================================
//  Non-transactional operations
// ============================================================================

impl<V, T, const LEVELS: usize> RadixTree<V, T, LEVELS>
where
    V: Copy + Send + Sync + 'static,
    T: KeyTransformer<LEVELS> + 'static,
{
    /// Look up a key. Returns the payload iff the leaf exists and its valid
    /// bit is set, read through a consistent version snapshot.
    #[must_use]
    pub fn get(&self, key: &T::Key) -> Option<V> {
        let nibbles = self.transformer.transform(key);

        match self.descend(&nibbles) {
            Descent::Missing { .. } => None,
            Descent::Leaf(leaf) => {
                // SAFETY: published leaves live as long as the tree.
                let leaf = unsafe { &*leaf };
                let (_, value) = leaf.read_snapshot();
                value
            }
        }
    }

    /// Insert or overwrite a key with release-store visibility.
    pub fn put(&self, key: &T::Key, value: V) {
        let nibbles = self.transformer.transform(key);
        let leaf = self.ensure_leaf(&nibbles);

        // SAFETY: published leaves live as long as the tree.
        unsafe { &*leaf }.put(value);
    }

    /// Remove a key. A missing key is a no-op; an existing leaf stays
    /// allocated with the valid bit cleared.
    pub fn remove(&self, key: &T::Key) {
        let nibbles = self.transformer.transform(key);

        if let Descent::Leaf(leaf) = self.descend(&nibbles) {
            // SAFETY: published leaves live as long as the tree.
            unsafe { &*leaf }.remove();
        }
    }
}

// ============================================================================
//  Transactional operations
// ============================================================================

impl<V, T, const LEVELS: usize> RadixTree<V, T, LEVELS>
where
    V: Copy + Send + Sync + 'static,
    T: KeyTransformer<LEVELS> + 'static,
{
    /// Transactionally look up a key.
    ///
    /// Own staged writes are observed directly. Otherwise the leaf's version
    /// joins the transaction's read set; a miss records the interior-node
    /// witness instead.
    ///
    /// # Errors
    /// [`TxnError::Conflict`] if the leaf's version moved past a read this
    /// transaction already recorded (the transaction is aborted);
    /// [`TxnError::Inactive`] if the transaction is no longer active.
    pub fn trans_get<'t>(
        &'t self,
        txn: &mut Transaction<'t>,
        key: &T::Key,
    ) -> TxResult<Option<V>> {
        txn.ensure_active()?;
        let nibbles = self.transformer.transform(key);

        match self.descend(&nibbles) {
            Descent::Missing { node, witness } => {
                self.observe_absent(txn, node, witness)?;
                Ok(None)
            }

            Descent::Leaf(leaf_ptr) => {
                // Observed-own-writes: a staged put returns its value, a
                // staged remove reads as absent.
                {
                    let item = txn.item(self, leaf_ptr as usize);
                    if item.has_write() {
                        if item.flags() & ITEM_PUT_BIT != 0 {
                            let staged = item
                                .write_value::<V>()
                                .copied()
                                .expect("put item must stage a value write");
                            return Ok(Some(staged));
                        }
                        return Ok(None);
                    }
                }

                // SAFETY: published leaves live as long as the tree.
                let leaf = unsafe { &*leaf_ptr };
                let (ver, value) = leaf.read_snapshot();

                let item = txn.item(self, leaf_ptr as usize);
                let stale = match item.read_value::<u64>() {
                    Some(&recorded) => !same_version(recorded, ver.word()),
                    None => false,
                };
                if stale {
                    // The version moved since this transaction's earlier
                    // read; it can no longer commit.
                    txn.abort();
                    return Err(TxnError::Conflict);
                }

                let item = txn.item(self, leaf_ptr as usize);
                item.add_read(ver.word());
                Ok(value)
            }
        }
    }

    /// Transactionally insert or overwrite a key.
    ///
    /// The leaf (and any missing path to it) is created eagerly in the
    /// `insert`-bit state; the value becomes visible only at commit.
    ///
    /// # Errors
    /// [`TxnError::Inactive`] if the transaction is no longer active.
    pub fn trans_put<'t>(
        &'t self,
        txn: &mut Transaction<'t>,
        key: &T::Key,
        value: V,
    ) -> TxResult<()> {
        txn.ensure_active()?;
        let nibbles = self.transformer.transform(key);
        let leaf = self.ensure_leaf(&nibbles);

        let item = txn.item(self, leaf as usize);
        item.clear_flags(ITEM_REMOVE_BIT);
        item.add_write(value);
        item.add_flags(ITEM_PUT_BIT);
        Ok(())
    }

    /// Transactionally remove a key.
    ///
    /// Removing an absent key is staged as a *read* of the interior-node
    /// witness, not a blind write: the transaction conflicts with any
    /// committed insert of the key, and commits vacuously otherwise.
    ///
    /// # Errors
    /// [`TxnError::Conflict`] if the witness moved past an earlier recorded
    /// read; [`TxnError::Inactive`] if the transaction is no longer active.
    pub fn trans_remove<'t>(&'t self, txn: &mut Transaction<'t>, key: &T::Key) -> TxResult<()> {
        txn.ensure_active()?;
        let nibbles = self.transformer.transform(key);

        match self.descend(&nibbles) {
            Descent::Missing { node, witness } => self.observe_absent(txn, node, witness),

            Descent::Leaf(leaf_ptr) => {
                let item = txn.item(self, leaf_ptr as usize);
                item.clear_flags(ITEM_PUT_BIT);
                item.add_write(true);
                item.add_flags(ITEM_REMOVE_BIT);
                Ok(())
            }
        }
    }

    /// Record a negative observation against an interior-node witness.
    ///
    /// The first observation stores the witness version; repeat observations
    /// through the same node validate against it, mirroring the leaf
    /// re-read rule.
    fn observe_absent<'t>(
        &'t self,
        txn: &mut Transaction<'t>,
        node: *const TreeNode,
        witness: Version,
    ) -> TxResult<()> {
        let stale = {
            let item = txn.item(self, node as usize);
            match item.read_value::<u64>() {
                Some(&recorded) => !same_version(recorded, witness.word()),
                None => {
                    item.add_read(witness.word());
                    item.add_flags(ITEM_EMPTY_BIT);
                    false
                }
            }
        };

        if stale {
            txn.abort();
            return Err(TxnError::Conflict);
        }
        Ok(())
    }
}

// ============================================================================
//  Commit callbacks
// ============================================================================

impl<V, T, const LEVELS: usize> TxShared for RadixTree<V, T, LEVELS>
where
    V: Copy + Send + Sync + 'static,
    T: KeyTransformer<LEVELS> + 'static,
{
    fn lock(&self, item: &mut TransItem<'_>) {
        debug_assert_eq!(
            item.flags() & ITEM_EMPTY_BIT,
            0,
            "empty-witness items are pure reads and are never locked"
        );

        // SAFETY: write items are keyed by leaf pointers staged in
        // trans_put/trans_remove; leaves live as long as the tree.
        let leaf = unsafe { &*item.key::<VersionedValue<V>>() };
        let _ = leaf.version().lock();
    }

    fn check(&self, item: &TransItem<'_>) -> bool {
        let Some(&recorded) = item.read_value::<u64>() else {
            return true;
        };

        if item.flags() & ITEM_EMPTY_BIT != 0 {
            // SAFETY: empty-witness items are keyed by interior nodes, which
            // live as long as the tree.
            let node = unsafe { &*item.key::<TreeNode>() };
            let cur = node.version().load();
            // A locked witness is a publication in flight under this node.
            !cur.is_locked() && same_version(cur.word(), recorded)
        } else {
            // SAFETY: leaf items are keyed by leaf pointers.
            let leaf = unsafe { &*item.key::<VersionedValue<V>>() };
            let cur = leaf.version().load();
            // A write item holds this leaf's lock (taken in the lock phase);
            // a foreign lock means a concurrent installer.
            (!cur.is_locked() || item.has_write()) && same_version(cur.word(), recorded)
        }
    }

    fn install(&self, item: &mut TransItem<'_>) {
        // SAFETY: install is only invoked on write items, which are keyed by
        // leaf pointers.
        let leaf = unsafe { &*item.key::<VersionedValue<V>>() };
        let cur = leaf.version().load_locked();
        let mut next = cur.word() + INCREMENT;

        if item.flags() & ITEM_PUT_BIT != 0 {
            let value = item
                .write_value::<V>()
                .copied()
                .expect("put item must stage a value write");

            // SAFETY: the commit protocol holds this leaf's lock.
            unsafe { leaf.write_payload(value) };
            next = (next | VALID_BIT) & !INSERT_BIT;
        } else if item.flags() & ITEM_REMOVE_BIT != 0 {
            next &= !(VALID_BIT | INSERT_BIT);
        }

        leaf.version().set_version(next);
    }

    fn unlock(&self, item: &mut TransItem<'_>) {
        // SAFETY: see `lock`.
        let leaf = unsafe { &*item.key::<VersionedValue<V>>() };
        leaf.version().unlock();
    }
}
