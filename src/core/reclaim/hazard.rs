//! Hazard-pointer reclamation with per-thread free lists.
//!
//! Each participating thread owns a fixed band of hazard slots plus two
//! private queues: retired nodes waiting for reclamation and free nodes
//! ready for reuse. A retired node is moved to the free queue only after a
//! scan proves no hazard slot of any thread references it. Memory handed
//! out by [`HazardManager::acquire`] is recycled, never returned to the
//! allocator before the manager itself drops.
//!
//! # Safety
//! This module uses raw pointers throughout. All unsafe operations carry
//! SAFETY comments describing the queue-ownership and scan invariants
//! they rely on.

#![allow(unsafe_code)]
#![deny(unsafe_op_in_unsafe_fn)]

use crate::core::thread::ThreadContext;
use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use tracing::trace;

/// Per-thread queues. Only ever touched by the owning thread; the
/// `UnsafeCell` is what makes that single-owner access expressible.
struct Lane<N> {
    free: UnsafeCell<Vec<*mut N>>,
    retired: UnsafeCell<Vec<*mut N>>,
}

/// Hazard-pointer manager for nodes of type `N`.
///
/// Parameterized at construction by the number of threads, the number of
/// hazard slots each thread may publish simultaneously, and the number of
/// nodes to pre-allocate per thread so hot paths rarely hit the global
/// allocator.
pub struct HazardManager<N> {
    threads: usize,
    slots_per_thread: usize,
    slots: Box<[CachePadded<AtomicPtr<N>>]>,
    lanes: Box<[CachePadded<Lane<N>>]>,
}

// SAFETY: hazard slots are atomics; the lanes are single-owner by the
// thread-id contract (each index is only touched through a `ThreadContext`
// carrying that id), so handing the whole manager to multiple threads is
// sound.
unsafe impl<N: Send> Send for HazardManager<N> {}
unsafe impl<N: Send> Sync for HazardManager<N> {}

impl<N: Default> HazardManager<N> {
    pub fn new(threads: usize, slots_per_thread: usize, prefill: usize) -> Self {
        let slots = (0..threads * slots_per_thread)
            .map(|_| CachePadded::new(AtomicPtr::new(ptr::null_mut())))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let lanes = (0..threads)
            .map(|_| {
                let free = (0..prefill)
                    .map(|_| Box::into_raw(Box::new(N::default())))
                    .collect::<Vec<_>>();
                CachePadded::new(Lane {
                    free: UnsafeCell::new(free),
                    retired: UnsafeCell::new(Vec::new()),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            threads,
            slots_per_thread,
            slots,
            lanes,
        }
    }

    /// Returns a node the calling thread may mutate exclusively. The node
    /// comes from the free queue when possible; otherwise the retirement
    /// queue is scanned once against every hazard slot, and only if the
    /// queue is still too short is a fresh node allocated.
    pub fn acquire(&self, ctx: &ThreadContext) -> *mut N {
        let lane = &self.lanes[ctx.id()];

        // SAFETY: the lane belongs to the calling thread (thread-id
        // contract); no other thread reads or writes these queues.
        let free = unsafe { &mut *lane.free.get() };
        if let Some(node) = free.pop() {
            return node;
        }

        let retired = unsafe { &mut *lane.retired.get() };
        if retired.len() > (self.slots_per_thread + 1) * self.threads {
            self.scan(free, retired);

            // The pigeonhole argument: more nodes were retired than there
            // are hazard slots in the whole system, so the scan freed at
            // least one.
            if let Some(node) = free.pop() {
                return node;
            }
        }

        Box::into_raw(Box::new(N::default()))
    }

    /// One pass over the caller's retirement queue, splicing every node
    /// that no hazard slot references into the free queue.
    fn scan(&self, free: &mut Vec<*mut N>, retired: &mut Vec<*mut N>) {
        let before = retired.len();
        retired.retain(|&node| {
            if self.is_referenced(node) {
                true
            } else {
                free.push(node);
                false
            }
        });
        trace!(
            scanned = before,
            reclaimed = before - retired.len(),
            "hazard scan"
        );
    }

    fn is_referenced(&self, node: *mut N) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.load(Ordering::SeqCst) == node)
    }

    /// Appends `node` to the caller's retirement queue. Null pointers are
    /// ignored so callers can retire optional links unconditionally.
    pub fn retire(&self, ctx: &ThreadContext, node: *mut N) {
        if node.is_null() {
            return;
        }
        // SAFETY: single-owner lane access, as in `acquire`.
        let retired = unsafe { &mut *self.lanes[ctx.id()].retired.get() };
        retired.push(node);
    }

    /// Installs `node` into the caller's hazard slot `slot`, overwriting
    /// the previous occupant. The store is sequentially consistent so the
    /// publication is visible before any subsequent validation load.
    pub fn publish(&self, ctx: &ThreadContext, slot: usize, node: *mut N) {
        debug_assert!(slot < self.slots_per_thread);
        self.slots[ctx.id() * self.slots_per_thread + slot].store(node, Ordering::SeqCst);
    }

    /// Clears the caller's hazard slot `slot`.
    pub fn release(&self, ctx: &ThreadContext, slot: usize) {
        debug_assert!(slot < self.slots_per_thread);
        self.slots[ctx.id() * self.slots_per_thread + slot].store(ptr::null_mut(), Ordering::Release);
    }

    /// Clears every hazard slot of the calling thread.
    pub fn release_all(&self, ctx: &ThreadContext) {
        let base = ctx.id() * self.slots_per_thread;
        for slot in &self.slots[base..base + self.slots_per_thread] {
            slot.store(ptr::null_mut(), Ordering::Release);
        }
    }

    /// Drains every queue of every thread, transferring ownership of the
    /// pointers to the caller. Used by set destructors that need to free
    /// queued nodes together with the ones still linked into the tree
    /// without double-freeing either.
    pub fn take_all_queued(&mut self) -> Vec<*mut N> {
        let mut out = Vec::new();
        for lane in self.lanes.iter_mut() {
            out.append(lane.free.get_mut());
            out.append(lane.retired.get_mut());
        }
        out
    }

    #[cfg(test)]
    fn queue_lens(&self, ctx: &ThreadContext) -> (usize, usize) {
        // SAFETY: single-owner lane access, as in `acquire`.
        unsafe {
            (
                (*self.lanes[ctx.id()].free.get()).len(),
                (*self.lanes[ctx.id()].retired.get()).len(),
            )
        }
    }
}

impl<N> Drop for HazardManager<N> {
    fn drop(&mut self) {
        for lane in self.lanes.iter_mut() {
            for &node in lane.free.get_mut().iter() {
                // SAFETY: every queued pointer came from `Box::into_raw`
                // (prefill or `acquire`) and ownership returned to the
                // manager via `retire`; nothing else frees them.
                drop(unsafe { Box::from_raw(node) });
            }
            for &node in lane.retired.get_mut().iter() {
                // SAFETY: as above.
                drop(unsafe { Box::from_raw(node) });
            }
            lane.free.get_mut().clear();
            lane.retired.get_mut().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::thread::ThreadRegistry;

    #[derive(Default)]
    struct Plain(#[allow(dead_code)] u64);

    #[test]
    fn prefill_seeds_the_free_queue() {
        let registry = ThreadRegistry::new(1);
        let ctx = registry.register().expect("capacity");
        let manager: HazardManager<Plain> = HazardManager::new(1, 2, 8);
        assert_eq!(manager.queue_lens(&ctx), (8, 0));

        let node = manager.acquire(&ctx);
        assert_eq!(manager.queue_lens(&ctx), (7, 0));
        manager.retire(&ctx, node);
        assert_eq!(manager.queue_lens(&ctx), (7, 1));
    }

    #[test]
    fn hazard_blocks_reclamation_until_released() {
        let registry = ThreadRegistry::new(1);
        let ctx = registry.register().expect("capacity");
        let manager: HazardManager<Plain> = HazardManager::new(1, 1, 0);

        let pinned = manager.acquire(&ctx);
        manager.publish(&ctx, 0, pinned);
        manager.retire(&ctx, pinned);

        // Exceed the (slots + 1) * threads threshold so acquire scans.
        let mut extra = Vec::new();
        for _ in 0..8 {
            extra.push(manager.acquire(&ctx));
        }
        for node in extra {
            manager.retire(&ctx, node);
        }

        for _ in 0..8 {
            let node = manager.acquire(&ctx);
            assert_ne!(node, pinned);
            manager.retire(&ctx, node);
        }

        manager.release(&ctx, 0);
        let mut recycled = false;
        for _ in 0..16 {
            let node = manager.acquire(&ctx);
            if node == pinned {
                recycled = true;
                break;
            }
            manager.retire(&ctx, node);
        }
        assert!(recycled, "released node never came back from the scan");
    }
}
