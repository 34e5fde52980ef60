//! Standard memory orderings for concurrent tree access.
//!
//! These constants ensure consistent ordering usage across the codebase
//! and make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for reading child slots and version words during traversal.
/// Pairs with writer's Release stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for publishing child slots and version words under lock.
/// Pairs with reader's Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for the lock-acquire CAS success.
pub const CAS_SUCCESS: Ordering = Ordering::Acquire;

/// Ordering for the lock-acquire CAS failure.
/// Only need to see the current value.
pub const CAS_FAILURE: Ordering = Ordering::Relaxed;

/// Ordering for loads inside a locked region.
/// Safe because the lock provides synchronization.
pub const RELAXED: Ordering = Ordering::Relaxed;
