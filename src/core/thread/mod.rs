//! Dense thread identities for the concurrent sets.
//!
//! Every set in this crate partitions its internal state (hazard slots,
//! free lists, size deltas) by a small dense thread id. Workers claim an
//! id exactly once on entry by registering with a [`ThreadRegistry`] and
//! then pass the resulting [`ThreadContext`] into every operation. There
//! is no hidden thread-local state.

use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("thread capacity {0} exhausted")]
    Exhausted(usize),
}

/// Hands out dense thread ids in `[0, capacity)`.
#[derive(Debug)]
pub struct ThreadRegistry {
    capacity: usize,
    next: AtomicUsize,
}

impl ThreadRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next: AtomicUsize::new(0),
        }
    }

    /// Claims the next free id. Call once per worker thread.
    pub fn register(&self) -> Result<ThreadContext, RegistryError> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        if id >= self.capacity {
            return Err(RegistryError::Exhausted(self.capacity));
        }
        Ok(ThreadContext { id })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A claimed thread identity. Not `Clone`: one handle per worker.
#[derive(Debug)]
pub struct ThreadContext {
    id: usize,
}

impl ThreadContext {
    pub fn id(&self) -> usize {
        self.id
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn ids_are_dense_and_bounded() {
        let registry = ThreadRegistry::new(2);
        let a = registry.register().unwrap();
        let b = registry.register().unwrap();
        assert_eq!(a.id(), 0);
        assert_eq!(b.id(), 1);
        assert_eq!(
            registry.register().unwrap_err(),
            RegistryError::Exhausted(2)
        );
    }
}
