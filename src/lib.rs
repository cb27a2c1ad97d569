//! conset — concurrent ordered integer sets.
//!
//! Four independent implementations of a duplicate-free ordered set of
//! integer keys, built for multi-threaded throughput:
//!
//! - [`AvlTree`]: relaxed-balance AVL tree; optimistic version-validated
//!   reads, per-node locks for writers.
//! - [`CbTree`]: the same skeleton rebalanced by access counters instead
//!   of heights, so hot keys migrate toward the root.
//! - [`NonBlockingBst`]: lock-free external BST driven by CAS-installed
//!   operation descriptors and helping.
//! - [`MultiwaySearchTree`]: lock-free stack of B-tree-style levels with
//!   immutable node contents swapped by CAS.
//!
//! All four share the hazard-pointer reclamation core in
//! [`core::reclaim`]. Workers claim a dense thread id once via
//! [`ThreadRegistry`] and pass the resulting [`ThreadContext`] into every
//! operation; see the [`ConcurrentSet`] trait for the contract.
//!
//! ```
//! use conset::{AvlTree, ConcurrentSet, ThreadRegistry};
//!
//! let registry = ThreadRegistry::new(2);
//! let set: AvlTree<i32> = AvlTree::new(2);
//!
//! std::thread::scope(|scope| {
//!     for _ in 0..2 {
//!         scope.spawn(|| {
//!             let Ok(ctx) = registry.register() else { return };
//!             for key in 0..1000 {
//!                 set.add(&ctx, key);
//!                 assert!(set.contains(&ctx, key));
//!             }
//!         });
//!     }
//! });
//! ```

pub mod core;

pub use crate::core::reclaim::HazardManager;
pub use crate::core::sets::{
    AvlTree, CbTree, ConcurrentSet, KeyHash, MultiwaySearchTree, NonBlockingBst,
};
pub use crate::core::thread::{RegistryError, ThreadContext, ThreadRegistry};
