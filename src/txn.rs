//! The transaction manager consumed by the tree.
//!
//! A [`Transaction`] is a per-thread handle that accumulates [`TransItem`]s,
//! one per `(owner, key)` pair. Data structures stage reads and writes into
//! their items during the execution phase; [`Transaction::commit`] then runs
//! the four-phase protocol against each item's owner:
//!
//! 1. **lock** every item carrying a write, in deterministic
//!    `(owner, key)` order to avoid deadlock;
//! 2. **check** every item carrying a read (version validation);
//! 3. **install** every write;
//! 4. **unlock** everything locked.
//!
//! A failed check unlocks whatever was acquired and aborts the transaction.
//! Owners implement the callbacks through the [`TxShared`] trait; a
//! transaction borrows its owners for its lifetime `'t`, so every
//! participating structure outlives the transactions staged against it.
//!
//! Item read/write slots are type-erased (`Box<dyn Any + Send>`) with typed
//! accessors, so one manager serves any participating structure; flag bits
//! on items are entirely owner-defined, starting at [`USER0_BIT`].

use std::any::Any;
use std::fmt as StdFmt;

use crate::trace::{debug_log, trace_log};

/// First flag bit available to owners. All higher bits are owner-defined too.
pub const USER0_BIT: u64 = 1 << 0;

/// Errors surfaced by transactional operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnError {
    /// Version validation failed; the transaction was aborted.
    Conflict,

    /// The transaction has already been aborted or committed.
    Inactive,
}

impl StdFmt::Display for TxnError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::Conflict => write!(f, "transaction conflict"),
            Self::Inactive => write!(f, "transaction is no longer active"),
        }
    }
}

impl std::error::Error for TxnError {}

/// Result type for transactional operations.
pub type TxResult<T> = Result<T, TxnError>;

/// The state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Operations may be staged.
    Active,
    /// Commit succeeded; all writes are installed.
    Committed,
    /// Aborted by a conflict or by [`Transaction::abort`].
    Aborted,
}

impl TxnState {
    /// Returns true if operations may still be staged.
    #[inline]
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

impl StdFmt::Display for TxnState {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Committed => write!(f, "Committed"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

// ============================================================================
//  TxShared
// ============================================================================

/// A data structure participating in the two-phase commit.
///
/// The manager dispatches each phase to the item's owner. `lock` and
/// `unlock` are only invoked on items carrying writes; `check` only on
/// items carrying reads.
pub trait TxShared: Send + Sync {
    /// Acquire the lock guarding the item's object.
    fn lock(&self, item: &mut TransItem<'_>);

    /// Validate the item's recorded read against the object's current
    /// version. Returning false aborts the transaction.
    fn check(&self, item: &TransItem<'_>) -> bool;

    /// Apply the item's staged write. Called with the lock held, after
    /// every check has passed.
    fn install(&self, item: &mut TransItem<'_>);

    /// Release the lock taken by `lock`.
    fn unlock(&self, item: &mut TransItem<'_>);
}

/// Address identity of an owner, used for item dedup and lock ordering.
fn owner_id_of(owner: &dyn TxShared) -> usize {
    (owner as *const dyn TxShared).cast::<()>() as usize
}

// ============================================================================
//  TransItem
// ============================================================================

/// Per-transaction record for one `(owner, key)` pair.
///
/// `key` is an address-sized identity chosen by the owner (a leaf or node
/// pointer for the tree); the manager never dereferences it.
pub struct TransItem<'t> {
    owner: &'t dyn TxShared,
    owner_id: usize,
    key: usize,
    flags: u64,
    read: Option<Box<dyn Any + Send>>,
    write: Option<Box<dyn Any + Send>>,
}

impl<'t> TransItem<'t> {
    fn new(owner: &'t dyn TxShared, key: usize) -> Self {
        Self {
            owner,
            owner_id: owner_id_of(owner),
            key,
            flags: 0,
            read: None,
            write: None,
        }
    }

    /// The item's key, reinterpreted as a pointer.
    ///
    /// Only the owner knows the real pointee type; it is responsible for
    /// casting back to whatever it staged.
    #[inline]
    #[must_use]
    pub fn key<T>(&self) -> *mut T {
        self.key as *mut T
    }

    /// Check if a read has been recorded.
    #[inline]
    #[must_use]
    pub const fn has_read(&self) -> bool {
        self.read.is_some()
    }

    /// Check if a write has been staged.
    #[inline]
    #[must_use]
    pub const fn has_write(&self) -> bool {
        self.write.is_some()
    }

    /// Record a read observation, replacing any previous one.
    #[inline]
    pub fn add_read<T: Any + Send>(&mut self, value: T) {
        self.read = Some(Box::new(value));
    }

    /// Stage a write, replacing any previous one.
    #[inline]
    pub fn add_write<T: Any + Send>(&mut self, value: T) {
        self.write = Some(Box::new(value));
    }

    /// The recorded read, if it is a `T`.
    #[inline]
    #[must_use]
    pub fn read_value<T: Any>(&self) -> Option<&T> {
        self.read.as_ref().and_then(|v| v.downcast_ref::<T>())
    }

    /// The staged write, if it is a `T`.
    #[inline]
    #[must_use]
    pub fn write_value<T: Any>(&self) -> Option<&T> {
        self.write.as_ref().and_then(|v| v.downcast_ref::<T>())
    }

    /// The item's flag bits.
    #[inline]
    #[must_use]
    pub const fn flags(&self) -> u64 {
        self.flags
    }

    /// Set the given flag bits.
    #[inline]
    pub fn add_flags(&mut self, mask: u64) {
        self.flags |= mask;
    }

    /// Clear the given flag bits.
    #[inline]
    pub fn clear_flags(&mut self, mask: u64) {
        self.flags &= !mask;
    }
}

impl StdFmt::Debug for TransItem<'_> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("TransItem")
            .field("key", &(self.key as *const u8))
            .field("flags", &self.flags)
            .field("has_read", &self.has_read())
            .field("has_write", &self.has_write())
            .finish()
    }
}

// ============================================================================
//  Transaction
// ============================================================================

/// A per-thread transaction handle.
///
/// `'t` is the borrow of the participating data structures; a transaction
/// never outlives its owners.
///
/// Item lookup is a linear scan; transactions touch a handful of keys and
/// the scan beats hashing at that size.
pub struct Transaction<'t> {
    items: Vec<TransItem<'t>>,
    state: TxnState,
}

impl<'t> Transaction<'t> {
    /// Start a new transaction.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            state: TxnState::Active,
        }
    }

    /// The transaction's current state.
    #[inline]
    #[must_use]
    pub const fn state(&self) -> TxnState {
        self.state
    }

    /// Number of items accumulated so far.
    #[inline]
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Error unless the transaction is still active.
    pub fn ensure_active(&self) -> TxResult<()> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(TxnError::Inactive)
        }
    }

    /// Find or create the item for `(owner, key)`.
    ///
    /// A second call with the same pair in the same transaction returns the
    /// same item.
    pub fn item(&mut self, owner: &'t dyn TxShared, key: usize) -> &mut TransItem<'t> {
        let owner_id = owner_id_of(owner);

        let pos = self
            .items
            .iter()
            .position(|it| it.owner_id == owner_id && it.key == key);

        let index = match pos {
            Some(i) => i,
            None => {
                self.items.push(TransItem::new(owner, key));
                self.items.len() - 1
            }
        };

        &mut self.items[index]
    }

    /// Abort immediately. Staged writes are dropped; structural work already
    /// done by owners (e.g. allocated tree paths) is not rolled back.
    pub fn abort(&mut self) {
        if self.state.is_active() {
            trace_log!("transaction aborted with {} items", self.items.len());
            self.state = TxnState::Aborted;
        }
    }

    /// Run the four-phase commit.
    ///
    /// # Errors
    /// [`TxnError::Conflict`] if any check fails; [`TxnError::Inactive`] if
    /// the transaction was already aborted or committed.
    pub fn commit(mut self) -> TxResult<()> {
        self.ensure_active()?;

        // Deterministic lock order: (owner identity, key address) ascending.
        let mut order: Vec<usize> = (0..self.items.len()).collect();
        order.sort_by_key(|&i| (self.items[i].owner_id, self.items[i].key));

        // Phase 1: lock every write item.
        let mut locked: Vec<usize> = Vec::new();
        for &i in &order {
            if self.items[i].has_write() {
                let owner = self.items[i].owner;
                owner.lock(&mut self.items[i]);
                locked.push(i);
            }
        }

        // Phase 2: check every read item.
        let mut conflict = false;
        for &i in &order {
            if self.items[i].has_read() {
                let owner = self.items[i].owner;
                if !owner.check(&self.items[i]) {
                    debug_log!("commit check failed for item {:?}", self.items[i]);
                    conflict = true;
                    break;
                }
            }
        }

        // Phase 3: install every write, but only if all checks passed.
        if !conflict {
            for &i in &order {
                if self.items[i].has_write() {
                    let owner = self.items[i].owner;
                    owner.install(&mut self.items[i]);
                }
            }
        }

        // Phase 4: unlock in reverse acquisition order.
        for &i in locked.iter().rev() {
            let owner = self.items[i].owner;
            owner.unlock(&mut self.items[i]);
        }

        if conflict {
            self.state = TxnState::Aborted;
            Err(TxnError::Conflict)
        } else {
            trace_log!("committed {} items", self.items.len());
            self.state = TxnState::Committed;
            Ok(())
        }
    }
}

impl Default for Transaction<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl StdFmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state)
            .field("items", &self.items.len())
            .finish()
    }
}

#[cfg(test)]
mod shuttle_tests;
