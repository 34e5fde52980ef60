//! # radixtx
//!
//! A transactional concurrent radix tree: an ordered key/value index that
//! participates in a software-transactional-memory protocol providing
//! serializable multi-key transactions under optimistic concurrency control.
//!
//! Three pieces cooperate:
//!
//! - The **radix tree** ([`tree::RadixTree`]): fan-out-16 interior nodes
//!   with lock-coupled insertion; each node's version word doubles as a
//!   phantom-prevention witness for negative reads.
//! - The **versioned value** ([`leaf::VersionedValue`]): a single-slot leaf
//!   whose version word packs a lock bit, a presence flag, an
//!   insert-in-progress flag, and the optimistic-read timestamp. Readers
//!   never lock; they snapshot with the seqlock retry protocol.
//! - The **transaction manager** ([`txn::Transaction`]): per-`(owner, key)`
//!   items carrying read versions, staged writes, and flag bits, committed
//!   through the four-phase lock / check / install / unlock protocol.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use radixtx::{RadixTree, Transaction};
//!
//! let tree: Arc<RadixTree<u64>> = Arc::new(RadixTree::new());
//!
//! let mut txn = Transaction::new();
//! tree.trans_put(&mut txn, &1, 42)?;
//! assert_eq!(tree.trans_get(&mut txn, &1)?, Some(42));
//! txn.commit()?;
//!
//! assert_eq!(tree.get(&1), Some(42));
//! # Ok::<(), radixtx::TxnError>(())
//! ```
//!
//! ## Concurrency
//!
//! - Lookups are lock-free: version-validated snapshots with retry.
//! - Structural inserts lock one interior node at a time, never across a
//!   descent step.
//! - Commits lock the written leaves in deterministic order, validate every
//!   recorded read, install, and unlock.
//!
//! Nodes and leaves are never freed during the tree's lifetime; dropping
//! the tree frees everything.

pub mod key;
pub mod leaf;
pub mod node;
pub mod ordering;
pub mod tree;
pub mod txn;
pub mod version;

mod trace;

pub use key::{FANOUT, KeyTransformer, SPAN, U64KeyTransformer};
pub use leaf::VersionedValue;
pub use tree::RadixTree;
pub use txn::{TransItem, Transaction, TxResult, TxShared, TxnError, TxnState};
pub use version::{TxVersion, Version};
