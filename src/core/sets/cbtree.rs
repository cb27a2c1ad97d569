//! Self-adjusting tree rebalanced by access frequency.
//!
//! Structurally the same optimistic-read, lock-per-node tree as the AVL
//! variant, but nothing tracks heights. Every node counts hits on itself
//! and descents through each of its children; a search that finds its key
//! either semi-splays the node toward the root (when the search ran
//! deeper than `4 * log2(size)`) or performs a single counter-weighted
//! rotation against its parent. Hot keys migrate upward, cold subtrees
//! sink.
//!
//! The version word here keeps grow and shrink state separate: readers
//! only retry when a shrink (or unlink) intersected their traversal, so
//! grow-only rotations never invalidate an in-flight read.
//!
//! # Safety
//! Same reclamation model as the AVL tree: node memory is recycled by the
//! hazard manager and never freed before the tree drops, all shared node
//! fields are atomics, and stale readers are rejected by version
//! validation.

#![allow(unsafe_code)]
#![deny(unsafe_op_in_unsafe_fn)]

use crate::core::reclaim::HazardManager;
use crate::core::sets::{ConcurrentSet, KeyHash};
use crate::core::thread::ThreadContext;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::cmp::Ordering as KeyOrdering;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{
    AtomicBool, AtomicI32, AtomicI64, AtomicPtr, AtomicU64, AtomicUsize, Ordering,
};

const SPIN_COUNT: usize = 100;

/// Above this log-size the global size counter is too contended and
/// per-thread deltas take over; the constant is log2(2 * threads^2) for
/// the thread counts the harness drives.
const BATCHED_SIZE_LOG_THRESHOLD: i32 = 15;

/// Version word layout: bit 0 = unlinked, bit 1 = grow lock, bit 2 =
/// shrink lock, 8 bits of grow count from bit 3, shrink count above.
const UNLINKED_OVL: u64 = 1;
const OVL_GROW_LOCK_MASK: u64 = 2;
const OVL_SHRINK_LOCK_MASK: u64 = 4;
const OVL_BITS_BEFORE_OVERFLOW: u32 = 8;
const OVL_GROW_COUNT_SHIFT: u32 = 3;
const OVL_GROW_COUNT_MASK: u64 = ((1 << OVL_BITS_BEFORE_OVERFLOW) - 1) << OVL_GROW_COUNT_SHIFT;
const OVL_SHRINK_COUNT_SHIFT: u32 = OVL_GROW_COUNT_SHIFT + OVL_BITS_BEFORE_OVERFLOW;

fn is_changing(ovl: u64) -> bool {
    ovl & (OVL_SHRINK_LOCK_MASK | OVL_GROW_LOCK_MASK) != 0
}

fn is_unlinked(ovl: u64) -> bool {
    ovl == UNLINKED_OVL
}

fn is_shrinking_or_unlinked(ovl: u64) -> bool {
    ovl & (OVL_SHRINK_LOCK_MASK | UNLINKED_OVL) != 0
}

/// Grow-only changes are invisible to readers: mask them out before
/// comparing the snapshot against the current word.
fn has_shrunk_or_unlinked(orig: u64, current: u64) -> bool {
    (orig ^ current) & !(OVL_GROW_LOCK_MASK | OVL_GROW_COUNT_MASK) != 0
}

fn begin_grow(ovl: u64) -> u64 {
    debug_assert!(!is_changing(ovl) && !is_unlinked(ovl));
    ovl | OVL_GROW_LOCK_MASK
}

fn end_grow(ovl: u64) -> u64 {
    // Overflow spills into the shrink count, which is fine.
    ovl + (1 << OVL_GROW_COUNT_SHIFT)
}

fn begin_shrink(ovl: u64) -> u64 {
    debug_assert!(!is_changing(ovl) && !is_unlinked(ovl));
    ovl | OVL_SHRINK_LOCK_MASK
}

fn end_shrink(ovl: u64) -> u64 {
    ovl + (1 << OVL_SHRINK_COUNT_SHIFT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Found,
    NotFound,
    Retry,
}

pub struct Node {
    key: AtomicI32,
    present: AtomicBool,
    parent: AtomicPtr<Node>,
    change_ovl: AtomicU64,
    left: AtomicPtr<Node>,
    right: AtomicPtr<Node>,
    n_count: AtomicU64,
    l_count: AtomicU64,
    r_count: AtomicU64,
    lock: Mutex<()>,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            key: AtomicI32::new(0),
            present: AtomicBool::new(false),
            parent: AtomicPtr::new(ptr::null_mut()),
            change_ovl: AtomicU64::new(0),
            left: AtomicPtr::new(ptr::null_mut()),
            right: AtomicPtr::new(ptr::null_mut()),
            n_count: AtomicU64::new(0),
            l_count: AtomicU64::new(0),
            r_count: AtomicU64::new(0),
            lock: Mutex::new(()),
        }
    }
}

impl Node {
    fn child(&self, dir: Dir) -> *mut Node {
        match dir {
            Dir::Left => self.left.load(Ordering::Acquire),
            Dir::Right => self.right.load(Ordering::Acquire),
        }
    }

    // Only valid with the node's lock held.
    fn set_child(&self, dir: Dir, child: *mut Node) {
        match dir {
            Dir::Left => self.left.store(child, Ordering::Release),
            Dir::Right => self.right.store(child, Ordering::Release),
        }
    }

    fn bump_descent(&self, dir: Dir) {
        match dir {
            Dir::Left => self.l_count.fetch_add(1, Ordering::Relaxed),
            Dir::Right => self.r_count.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn wait_until_change_completed(&self, ovl: u64) {
        if !is_changing(ovl) {
            return;
        }
        for _ in 0..SPIN_COUNT {
            if self.change_ovl.load(Ordering::Acquire) != ovl {
                return;
            }
            std::hint::spin_loop();
        }
        drop(self.lock.lock());
    }
}

/// Concurrent ordered set backed by the counter-based tree.
pub struct CbTree<T> {
    root_holder: *mut Node,
    hazard: HazardManager<Node>,
    size: AtomicI64,
    log_size: AtomicI32,
    local_size: Box<[CachePadded<AtomicI64>]>,
    cursor: Box<[CachePadded<AtomicUsize>]>,
    threads: usize,
    _marker: PhantomData<fn(T) -> T>,
}

// SAFETY: shared node state is atomic or lock-protected; per-thread state
// (size deltas, hazard cursors) is indexed by the thread-id contract.
unsafe impl<T> Send for CbTree<T> {}
unsafe impl<T> Sync for CbTree<T> {}

const HAZARDS_PER_THREAD: usize = 6;
const PREFILL: usize = 50;

impl<T: KeyHash> CbTree<T> {
    pub fn new(threads: usize) -> Self {
        let hazard = HazardManager::new(threads, HAZARDS_PER_THREAD, PREFILL);
        let root_holder = Box::into_raw(Box::new(Node {
            key: AtomicI32::new(i32::MIN),
            n_count: AtomicU64::new(u64::MAX),
            ..Node::default()
        }));
        Self {
            root_holder,
            hazard,
            size: AtomicI64::new(0),
            log_size: AtomicI32::new(-1),
            local_size: (0..threads)
                .map(|_| CachePadded::new(AtomicI64::new(0)))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            cursor: (0..threads)
                .map(|_| CachePadded::new(AtomicUsize::new(0)))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            threads,
            _marker: PhantomData,
        }
    }

    fn root_holder(&self) -> &Node {
        // SAFETY: the holder lives as long as the tree.
        unsafe { &*self.root_holder }
    }

    /// Publishes into the caller's next hazard slot. The cursor is plain
    /// per-thread state kept in an atomic only to stay `Sync`.
    fn publish(&self, ctx: &ThreadContext, node: *mut Node) {
        let cursor = &self.cursor[ctx.id()];
        let slot = cursor.load(Ordering::Relaxed);
        self.hazard.publish(ctx, slot, node);
        cursor.store(slot + 1, Ordering::Relaxed);
    }

    fn release_all(&self, ctx: &ThreadContext) {
        self.hazard.release_all(ctx);
        self.cursor[ctx.id()].store(0, Ordering::Relaxed);
    }

    fn init_node(
        &self,
        ctx: &ThreadContext,
        key: i32,
        present: bool,
        parent: *mut Node,
    ) -> *mut Node {
        let node = self.hazard.acquire(ctx);
        // SAFETY: `acquire` hands out nodes no thread holds a hazard on.
        let n = unsafe { &*node };
        n.key.store(key, Ordering::Relaxed);
        n.present.store(present, Ordering::Relaxed);
        n.parent.store(parent, Ordering::Relaxed);
        // Recycled versions keep counting forward with the lock and
        // unlink bits cleared, so stale snapshots can never revalidate.
        let recycled = n.change_ovl.load(Ordering::Relaxed);
        n.change_ovl
            .store(end_shrink(recycled & !(UNLINKED_OVL | OVL_GROW_LOCK_MASK | OVL_SHRINK_LOCK_MASK)), Ordering::Release);
        n.left.store(ptr::null_mut(), Ordering::Relaxed);
        n.right.store(ptr::null_mut(), Ordering::Relaxed);
        n.n_count.store(1, Ordering::Relaxed);
        n.l_count.store(0, Ordering::Relaxed);
        n.r_count.store(0, Ordering::Relaxed);
        node
    }

    /// `4 * log2(size)`, the depth past which a hit triggers semi-splay.
    fn depth_threshold(&self) -> i64 {
        let log = i64::from(self.log_size.load(Ordering::Relaxed).max(0));
        log << 2
    }

    fn note_added(&self, ctx: &ThreadContext) {
        let log = self.log_size.load(Ordering::Relaxed);
        if log < BATCHED_SIZE_LOG_THRESHOLD {
            let new_size = self.size.fetch_add(1, Ordering::Relaxed) + 1;
            self.maybe_grow_log(log, new_size);
        } else {
            let local = &self.local_size[ctx.id()];
            let delta = local.load(Ordering::Relaxed) + 1;
            local.store(delta, Ordering::Relaxed);
            if delta >= self.threads as i64 {
                let new_size = self.size.fetch_add(delta, Ordering::Relaxed) + delta;
                local.store(0, Ordering::Relaxed);
                self.maybe_grow_log(log, new_size);
            }
        }
    }

    fn note_removed(&self, ctx: &ThreadContext) {
        let log = self.log_size.load(Ordering::Relaxed);
        if log < BATCHED_SIZE_LOG_THRESHOLD {
            let new_size = self.size.fetch_sub(1, Ordering::Relaxed) - 1;
            self.maybe_shrink_log(log, new_size);
        } else {
            let local = &self.local_size[ctx.id()];
            let delta = local.load(Ordering::Relaxed) - 1;
            local.store(delta, Ordering::Relaxed);
            if delta <= -(self.threads as i64) {
                let new_size = self.size.fetch_add(delta, Ordering::Relaxed) + delta;
                local.store(0, Ordering::Relaxed);
                self.maybe_shrink_log(log, new_size);
            }
        }
    }

    fn maybe_grow_log(&self, log: i32, new_size: i64) {
        let next = log + 1;
        if new_size >= 1i64 << next.max(0) {
            let _ = self
                .log_size
                .compare_exchange_weak(log, next, Ordering::Relaxed, Ordering::Relaxed);
        }
    }

    fn maybe_shrink_log(&self, log: i32, new_size: i64) {
        if log >= 0 && new_size < 1i64 << log {
            let _ = self
                .log_size
                .compare_exchange_weak(log, log - 1, Ordering::Relaxed, Ordering::Relaxed);
        }
    }

    fn do_contains(&self, ctx: &ThreadContext, key: i32) -> bool {
        loop {
            let right = self.root_holder().right.load(Ordering::Acquire);
            if right.is_null() {
                return false;
            }

            // SAFETY: see the module-level reclamation note.
            let right_ref = unsafe { &*right };
            let dir = match key.cmp(&right_ref.key.load(Ordering::Relaxed)) {
                KeyOrdering::Equal => return right_ref.present.load(Ordering::Acquire),
                KeyOrdering::Less => Dir::Left,
                KeyOrdering::Greater => Dir::Right,
            };

            let ovl = right_ref.change_ovl.load(Ordering::Acquire);
            if is_shrinking_or_unlinked(ovl) {
                right_ref.wait_until_change_completed(ovl);
            } else if right == self.root_holder().right.load(Ordering::Acquire) {
                match self.attempt_get(ctx, key, right_ref, dir, ovl, 1) {
                    Outcome::Retry => {}
                    Outcome::Found => return true,
                    Outcome::NotFound => return false,
                }
            }
        }
    }

    fn attempt_get(
        &self,
        ctx: &ThreadContext,
        key: i32,
        node: &Node,
        dir: Dir,
        node_ovl: u64,
        depth: i64,
    ) -> Outcome {
        loop {
            let child = node.child(dir);

            if child.is_null() {
                if has_shrunk_or_unlinked(node_ovl, node.change_ovl.load(Ordering::Acquire)) {
                    return Outcome::Retry;
                }
                return Outcome::NotFound;
            }

            // SAFETY: see the module-level reclamation note.
            let child_ref = unsafe { &*child };
            let child_dir = match key.cmp(&child_ref.key.load(Ordering::Relaxed)) {
                KeyOrdering::Equal => {
                    if depth >= self.depth_threshold() {
                        self.semi_splay(ctx, child);
                    } else {
                        self.rebalance_at_target(ctx, node as *const Node as *mut Node, child);
                    }
                    child_ref.n_count.fetch_add(1, Ordering::Relaxed);
                    return if child_ref.present.load(Ordering::Acquire) {
                        Outcome::Found
                    } else {
                        Outcome::NotFound
                    };
                }
                KeyOrdering::Less => Dir::Left,
                KeyOrdering::Greater => Dir::Right,
            };

            let child_ovl = child_ref.change_ovl.load(Ordering::Acquire);
            if is_shrinking_or_unlinked(child_ovl) {
                child_ref.wait_until_change_completed(child_ovl);
                if has_shrunk_or_unlinked(node_ovl, node.change_ovl.load(Ordering::Acquire)) {
                    return Outcome::Retry;
                }
            } else if child != node.child(dir) {
                if has_shrunk_or_unlinked(node_ovl, node.change_ovl.load(Ordering::Acquire)) {
                    return Outcome::Retry;
                }
            } else {
                if has_shrunk_or_unlinked(node_ovl, node.change_ovl.load(Ordering::Acquire)) {
                    return Outcome::Retry;
                }
                let result = self.attempt_get(ctx, key, child_ref, child_dir, child_ovl, depth + 1);
                if result != Outcome::Retry {
                    if result != Outcome::NotFound {
                        node.bump_descent(dir);
                    }
                    return result;
                }
            }
        }
    }

    fn update(&self, ctx: &ThreadContext, key: i32) -> Outcome {
        loop {
            let right = self.root_holder().right.load(Ordering::Acquire);

            if right.is_null() {
                if self.attempt_insert_into_empty(ctx, key) {
                    return Outcome::NotFound;
                }
            } else {
                // SAFETY: see the module-level reclamation note.
                let right_ref = unsafe { &*right };
                let ovl = right_ref.change_ovl.load(Ordering::Acquire);
                if is_shrinking_or_unlinked(ovl) {
                    right_ref.wait_until_change_completed(ovl);
                } else if right == self.root_holder().right.load(Ordering::Acquire) {
                    let result = self.attempt_update(ctx, key, self.root_holder, right, ovl, 1);
                    if result != Outcome::Retry {
                        return result;
                    }
                }
            }
        }
    }

    fn attempt_insert_into_empty(&self, ctx: &ThreadContext, key: i32) -> bool {
        let holder = self.root_holder();
        self.publish(ctx, self.root_holder);
        let _guard = holder.lock.lock();

        let inserted = if holder.right.load(Ordering::Acquire).is_null() {
            let node = self.init_node(ctx, key, true, self.root_holder);
            holder.right.store(node, Ordering::Release);
            true
        } else {
            false
        };

        self.release_all(ctx);
        inserted
    }

    fn attempt_update(
        &self,
        ctx: &ThreadContext,
        key: i32,
        parent: *mut Node,
        node: *mut Node,
        node_ovl: u64,
        depth: i64,
    ) -> Outcome {
        debug_assert!(node_ovl != UNLINKED_OVL);

        // SAFETY: see the module-level reclamation note.
        let node_ref = unsafe { &*node };
        let dir = match key.cmp(&node_ref.key.load(Ordering::Relaxed)) {
            KeyOrdering::Equal => {
                if depth >= self.depth_threshold() {
                    self.semi_splay(ctx, node);
                } else {
                    self.rebalance_at_target(ctx, parent, node);
                }
                node_ref.n_count.fetch_add(1, Ordering::Relaxed);
                return self.attempt_node_update(ctx, true, parent, node);
            }
            KeyOrdering::Less => Dir::Left,
            KeyOrdering::Greater => Dir::Right,
        };

        loop {
            let child = node_ref.child(dir);

            if has_shrunk_or_unlinked(node_ovl, node_ref.change_ovl.load(Ordering::Acquire)) {
                return Outcome::Retry;
            }

            if child.is_null() {
                let mut do_semi_splay = false;
                {
                    self.publish(ctx, node);
                    let _guard = node_ref.lock.lock();

                    if has_shrunk_or_unlinked(
                        node_ovl,
                        node_ref.change_ovl.load(Ordering::Acquire),
                    ) {
                        self.release_all(ctx);
                        return Outcome::Retry;
                    }

                    if node_ref.child(dir).is_null() {
                        let leaf = self.init_node(ctx, key, true, node);
                        node_ref.set_child(dir, leaf);
                        node_ref.bump_descent(dir);

                        if depth >= self.depth_threshold() {
                            do_semi_splay = true;
                        } else {
                            self.release_all(ctx);
                            return Outcome::NotFound;
                        }
                    }
                    // else: someone slipped a child in, re-read and retry.

                    self.release_all(ctx);
                }

                if do_semi_splay {
                    self.semi_splay(ctx, node_ref.child(dir));
                    return Outcome::NotFound;
                }
            } else {
                // SAFETY: see the module-level reclamation note.
                let child_ref = unsafe { &*child };
                let child_ovl = child_ref.change_ovl.load(Ordering::Acquire);

                if is_shrinking_or_unlinked(child_ovl) {
                    child_ref.wait_until_change_completed(child_ovl);
                } else if child != node_ref.child(dir) {
                    // Retry edge: link changed between reads.
                } else {
                    if has_shrunk_or_unlinked(
                        node_ovl,
                        node_ref.change_ovl.load(Ordering::Acquire),
                    ) {
                        return Outcome::Retry;
                    }

                    let result = self.attempt_update(ctx, key, node, child, child_ovl, depth + 1);
                    if result != Outcome::Retry {
                        if result == Outcome::NotFound {
                            self.rebalance_new(ctx, node_ref, dir);
                        } else {
                            node_ref.bump_descent(dir);
                        }
                        return result;
                    }
                }
            }
        }
    }

    fn attempt_remove(
        &self,
        ctx: &ThreadContext,
        key: i32,
        parent: *mut Node,
        node: *mut Node,
        node_ovl: u64,
    ) -> Outcome {
        debug_assert!(node_ovl != UNLINKED_OVL);

        // SAFETY: see the module-level reclamation note.
        let node_ref = unsafe { &*node };
        let dir = match key.cmp(&node_ref.key.load(Ordering::Relaxed)) {
            KeyOrdering::Equal => return self.attempt_node_update(ctx, false, parent, node),
            KeyOrdering::Less => Dir::Left,
            KeyOrdering::Greater => Dir::Right,
        };

        loop {
            let child = node_ref.child(dir);

            if has_shrunk_or_unlinked(node_ovl, node_ref.change_ovl.load(Ordering::Acquire)) {
                return Outcome::Retry;
            }

            if child.is_null() {
                return Outcome::NotFound;
            }

            // SAFETY: see the module-level reclamation note.
            let child_ref = unsafe { &*child };
            let child_ovl = child_ref.change_ovl.load(Ordering::Acquire);

            if is_shrinking_or_unlinked(child_ovl) {
                child_ref.wait_until_change_completed(child_ovl);
            } else if child != node_ref.child(dir) {
                // Retry edge.
            } else {
                if has_shrunk_or_unlinked(node_ovl, node_ref.change_ovl.load(Ordering::Acquire)) {
                    return Outcome::Retry;
                }
                let result = self.attempt_remove(ctx, key, node, child, child_ovl);
                if result != Outcome::Retry {
                    return result;
                }
            }
        }
    }

    fn attempt_node_update(
        &self,
        ctx: &ThreadContext,
        new_value: bool,
        parent: *mut Node,
        node: *mut Node,
    ) -> Outcome {
        // SAFETY: see the module-level reclamation note.
        let node_ref = unsafe { &*node };
        let parent_ref = unsafe { &*parent };

        if !new_value && !node_ref.present.load(Ordering::Acquire) {
            return Outcome::NotFound;
        }

        let unlinking = !new_value
            && (node_ref.left.load(Ordering::Acquire).is_null()
                || node_ref.right.load(Ordering::Acquire).is_null());

        if unlinking {
            self.publish(ctx, parent);
            let _parent_guard = parent_ref.lock.lock();

            if is_unlinked(parent_ref.change_ovl.load(Ordering::Acquire))
                || node_ref.parent.load(Ordering::Acquire) != parent
            {
                self.release_all(ctx);
                return Outcome::Retry;
            }

            self.publish(ctx, node);
            let _node_guard = node_ref.lock.lock();

            if !node_ref.present.load(Ordering::Acquire) {
                self.release_all(ctx);
                return Outcome::NotFound;
            }

            if !self.attempt_unlink_locked(ctx, parent_ref, node) {
                self.release_all(ctx);
                return Outcome::Retry;
            }

            self.release_all(ctx);
            Outcome::Found
        } else {
            self.publish(ctx, node);
            let _guard = node_ref.lock.lock();

            if is_unlinked(node_ref.change_ovl.load(Ordering::Acquire)) {
                self.release_all(ctx);
                return Outcome::Retry;
            }

            // The node lost a child while we queued for the lock; the
            // removal must go through the unlink path instead.
            if !new_value
                && (node_ref.left.load(Ordering::Acquire).is_null()
                    || node_ref.right.load(Ordering::Acquire).is_null())
            {
                self.release_all(ctx);
                return Outcome::Retry;
            }

            let prev = node_ref.present.load(Ordering::Acquire);
            node_ref.present.store(new_value, Ordering::Release);

            self.release_all(ctx);
            if prev {
                Outcome::Found
            } else {
                Outcome::NotFound
            }
        }
    }

    // Caller holds locks on both the parent and the node.
    fn attempt_unlink_locked(&self, ctx: &ThreadContext, parent: &Node, node: *mut Node) -> bool {
        debug_assert!(!is_unlinked(parent.change_ovl.load(Ordering::Acquire)));

        let parent_left = parent.left.load(Ordering::Acquire);
        let parent_right = parent.right.load(Ordering::Acquire);
        if parent_left != node && parent_right != node {
            return false;
        }

        // SAFETY: see the module-level reclamation note.
        let node_ref = unsafe { &*node };
        debug_assert!(!is_unlinked(node_ref.change_ovl.load(Ordering::Acquire)));

        let left = node_ref.left.load(Ordering::Acquire);
        let right = node_ref.right.load(Ordering::Acquire);
        if !left.is_null() && !right.is_null() {
            return false;
        }

        let splice = if left.is_null() { right } else { left };
        if parent_left == node {
            parent.left.store(splice, Ordering::Release);
        } else {
            parent.right.store(splice, Ordering::Release);
        }
        if !splice.is_null() {
            // SAFETY: splice is a live child of the node being unlinked.
            unsafe { &*splice }
                .parent
                .store(parent as *const Node as *mut Node, Ordering::Release);
        }

        node_ref.change_ovl.store(UNLINKED_OVL, Ordering::Release);
        node_ref.present.store(false, Ordering::Release);
        self.hazard.retire(ctx, node);

        true
    }

    /// Rotates `child` one or two levels toward the root, one locked
    /// rotation per iteration, until it reaches depth one.
    fn semi_splay(&self, ctx: &ThreadContext, mut child: *mut Node) {
        loop {
            if child.is_null() {
                return;
            }
            // SAFETY: see the module-level reclamation note.
            let child_ref = unsafe { &*child };
            let node = child_ref.parent.load(Ordering::Acquire);
            if node.is_null() {
                return;
            }
            let node_ref = unsafe { &*node };
            let parent = node_ref.parent.load(Ordering::Acquire);
            if parent.is_null() {
                return;
            }
            let parent_ref = unsafe { &*parent };
            let grand = parent_ref.parent.load(Ordering::Acquire);

            if grand.is_null() {
                // The parent is the root holder: a final zig against the
                // tree root.
                self.publish(ctx, parent);
                let _parent_guard = parent_ref.lock.lock();

                if parent_ref.right.load(Ordering::Acquire) == node {
                    self.publish(ctx, node);
                    let _node_guard = node_ref.lock.lock();

                    if !is_unlinked(node_ref.change_ovl.load(Ordering::Acquire)) {
                        if node_ref.left.load(Ordering::Acquire) == child {
                            self.publish(ctx, child);
                            let _child_guard = child_ref.lock.lock();
                            let child_right = child_ref.right.load(Ordering::Acquire);
                            self.rotate_right(parent_ref, node, child, child_right);
                        } else if node_ref.right.load(Ordering::Acquire) == child {
                            self.publish(ctx, child);
                            let _child_guard = child_ref.lock.lock();
                            let child_left = child_ref.left.load(Ordering::Acquire);
                            self.rotate_left(parent_ref, node, child, child_left);
                        }
                    }
                }
                self.release_all(ctx);
                // One level from the top now; the loop exits on the next
                // parent check.
            } else {
                let grand_ref = unsafe { &*grand };
                self.publish(ctx, grand);
                let _grand_guard = grand_ref.lock.lock();

                if grand_ref.left.load(Ordering::Acquire) == parent
                    || grand_ref.right.load(Ordering::Acquire) == parent
                {
                    self.publish(ctx, parent);
                    let _parent_guard = parent_ref.lock.lock();

                    if parent_ref.left.load(Ordering::Acquire) == node {
                        self.publish(ctx, node);
                        let _node_guard = node_ref.lock.lock();

                        if !is_unlinked(node_ref.change_ovl.load(Ordering::Acquire)) {
                            if node_ref.left.load(Ordering::Acquire) == child {
                                self.publish(ctx, child);
                                let _child_guard = child_ref.lock.lock();
                                let node_right = node_ref.right.load(Ordering::Acquire);
                                self.rotate_right(grand_ref, parent, node, node_right);
                                child = node;
                            } else if node_ref.right.load(Ordering::Acquire) == child {
                                self.publish(ctx, child);
                                let _child_guard = child_ref.lock.lock();
                                self.rotate_right_over_left(grand_ref, parent, node, child);
                            }
                        }
                    } else if parent_ref.right.load(Ordering::Acquire) == node {
                        self.publish(ctx, node);
                        let _node_guard = node_ref.lock.lock();

                        if !is_unlinked(node_ref.change_ovl.load(Ordering::Acquire)) {
                            if node_ref.right.load(Ordering::Acquire) == child {
                                self.publish(ctx, child);
                                let _child_guard = child_ref.lock.lock();
                                let node_left = node_ref.left.load(Ordering::Acquire);
                                self.rotate_left(grand_ref, parent, node, node_left);
                                child = node;
                            } else if node_ref.left.load(Ordering::Acquire) == child {
                                self.publish(ctx, child);
                                let _child_guard = child_ref.lock.lock();
                                self.rotate_left_over_right(grand_ref, parent, node, child);
                            }
                        }
                    }
                }
                self.release_all(ctx);
            }
        }
    }

    /// Weighted rotation of `node` toward `parent` on a hit: a double
    /// rotation when the inner subtree outweighs the parent's other side,
    /// a single rotation when the node's own weight does.
    fn rebalance_at_target(&self, ctx: &ThreadContext, parent: *mut Node, node: *mut Node) {
        // SAFETY: see the module-level reclamation note.
        let parent_ref = unsafe { &*parent };
        let node_ref = unsafe { &*node };

        let on_left = parent_ref.left.load(Ordering::Acquire) == node;
        let (n_weight, p_weight, n_inner_weight) = if on_left {
            (
                node_ref
                    .n_count
                    .load(Ordering::Relaxed)
                    .saturating_add(node_ref.l_count.load(Ordering::Relaxed)),
                parent_ref
                    .n_count
                    .load(Ordering::Relaxed)
                    .saturating_add(parent_ref.r_count.load(Ordering::Relaxed)),
                node_ref.r_count.load(Ordering::Relaxed),
            )
        } else {
            (
                node_ref
                    .n_count
                    .load(Ordering::Relaxed)
                    .saturating_add(node_ref.r_count.load(Ordering::Relaxed)),
                parent_ref
                    .n_count
                    .load(Ordering::Relaxed)
                    .saturating_add(parent_ref.l_count.load(Ordering::Relaxed)),
                node_ref.l_count.load(Ordering::Relaxed),
            )
        };

        if n_inner_weight >= p_weight {
            self.rotate_target_double(ctx, parent, node, n_weight, p_weight);
        } else if n_weight > p_weight {
            self.rotate_target_single(ctx, parent, node, p_weight);
        }

        self.release_all(ctx);
    }

    /// Same weighting as `rebalance_at_target`, applied to the parent of
    /// a freshly inserted key on the unwind path; when no rotation is
    /// warranted the descent counter gets its bump instead.
    fn rebalance_new(&self, ctx: &ThreadContext, parent: &Node, dir: Dir) {
        let node = parent.child(dir);
        if node.is_null() {
            parent.bump_descent(dir);
            return;
        }

        // SAFETY: see the module-level reclamation note.
        let node_ref = unsafe { &*node };
        let (n_weight, p_weight, n_inner_weight) = match dir {
            Dir::Left => (
                node_ref
                    .n_count
                    .load(Ordering::Relaxed)
                    .saturating_add(node_ref.l_count.load(Ordering::Relaxed)),
                parent
                    .n_count
                    .load(Ordering::Relaxed)
                    .saturating_add(parent.r_count.load(Ordering::Relaxed)),
                node_ref.r_count.load(Ordering::Relaxed),
            ),
            Dir::Right => (
                node_ref
                    .n_count
                    .load(Ordering::Relaxed)
                    .saturating_add(node_ref.r_count.load(Ordering::Relaxed)),
                parent
                    .n_count
                    .load(Ordering::Relaxed)
                    .saturating_add(parent.l_count.load(Ordering::Relaxed)),
                node_ref.l_count.load(Ordering::Relaxed),
            ),
        };

        let parent_ptr = parent as *const Node as *mut Node;
        if n_inner_weight >= p_weight {
            self.rotate_target_double(ctx, parent_ptr, node, n_weight, p_weight);
        } else if n_weight > p_weight {
            self.rotate_target_single(ctx, parent_ptr, node, p_weight);
        } else {
            parent.bump_descent(dir);
        }

        self.release_all(ctx);
    }

    fn rotate_target_single(
        &self,
        ctx: &ThreadContext,
        parent: *mut Node,
        node: *mut Node,
        p_weight: u64,
    ) {
        // SAFETY: see the module-level reclamation note.
        let parent_ref = unsafe { &*parent };
        let node_ref = unsafe { &*node };

        let grand = parent_ref.parent.load(Ordering::Acquire);
        if grand.is_null() {
            return;
        }
        let grand_ref = unsafe { &*grand };
        self.publish(ctx, grand);
        let _grand_guard = grand_ref.lock.lock();

        if grand_ref.left.load(Ordering::Acquire) != parent
            && grand_ref.right.load(Ordering::Acquire) != parent
        {
            return;
        }

        self.publish(ctx, parent);
        let _parent_guard = parent_ref.lock.lock();

        if parent_ref.left.load(Ordering::Acquire) == node {
            self.publish(ctx, node);
            let _node_guard = node_ref.lock.lock();
            let node_right = node_ref.right.load(Ordering::Acquire);
            self.rotate_right(grand_ref, parent, node, node_right);
            parent_ref
                .l_count
                .store(node_ref.r_count.load(Ordering::Relaxed), Ordering::Relaxed);
            node_ref.r_count.fetch_add(p_weight, Ordering::Relaxed);
        } else if parent_ref.right.load(Ordering::Acquire) == node {
            self.publish(ctx, node);
            let _node_guard = node_ref.lock.lock();
            let node_left = node_ref.left.load(Ordering::Acquire);
            self.rotate_left(grand_ref, parent, node, node_left);
            parent_ref
                .r_count
                .store(node_ref.l_count.load(Ordering::Relaxed), Ordering::Relaxed);
            node_ref.l_count.fetch_add(p_weight, Ordering::Relaxed);
        }
    }

    fn rotate_target_double(
        &self,
        ctx: &ThreadContext,
        parent: *mut Node,
        node: *mut Node,
        n_weight: u64,
        p_weight: u64,
    ) {
        // SAFETY: see the module-level reclamation note.
        let parent_ref = unsafe { &*parent };
        let node_ref = unsafe { &*node };

        let grand = parent_ref.parent.load(Ordering::Acquire);
        if grand.is_null() {
            return;
        }
        let grand_ref = unsafe { &*grand };
        self.publish(ctx, grand);
        let _grand_guard = grand_ref.lock.lock();

        if grand_ref.left.load(Ordering::Acquire) != parent
            && grand_ref.right.load(Ordering::Acquire) != parent
        {
            return;
        }

        self.publish(ctx, parent);
        let _parent_guard = parent_ref.lock.lock();

        if parent_ref.left.load(Ordering::Acquire) == node {
            self.publish(ctx, node);
            let _node_guard = node_ref.lock.lock();

            let inner = node_ref.right.load(Ordering::Acquire);
            if inner.is_null() {
                return;
            }
            // SAFETY: inner is the locked node's child.
            let inner_ref = unsafe { &*inner };
            self.publish(ctx, inner);
            let _inner_guard = inner_ref.lock.lock();

            self.rotate_right_over_left(grand_ref, parent, node, inner);
            parent_ref
                .l_count
                .store(inner_ref.r_count.load(Ordering::Relaxed), Ordering::Relaxed);
            node_ref
                .r_count
                .store(inner_ref.l_count.load(Ordering::Relaxed), Ordering::Relaxed);
            inner_ref.r_count.fetch_add(p_weight, Ordering::Relaxed);
            inner_ref.l_count.fetch_add(n_weight, Ordering::Relaxed);
        } else if parent_ref.right.load(Ordering::Acquire) == node {
            self.publish(ctx, node);
            let _node_guard = node_ref.lock.lock();

            let inner = node_ref.left.load(Ordering::Acquire);
            if inner.is_null() {
                return;
            }
            // SAFETY: inner is the locked node's child.
            let inner_ref = unsafe { &*inner };
            self.publish(ctx, inner);
            let _inner_guard = inner_ref.lock.lock();

            self.rotate_left_over_right(grand_ref, parent, node, inner);
            parent_ref
                .r_count
                .store(inner_ref.l_count.load(Ordering::Relaxed), Ordering::Relaxed);
            node_ref
                .l_count
                .store(inner_ref.r_count.load(Ordering::Relaxed), Ordering::Relaxed);
            inner_ref.l_count.fetch_add(p_weight, Ordering::Relaxed);
            inner_ref.r_count.fetch_add(n_weight, Ordering::Relaxed);
        }
    }

    // The four rotations. Callers hold locks on every named participant;
    // the shrink stamp goes on each node whose subtree loses depth, the
    // grow stamp on the one gaining it.

    fn rotate_right(&self, parent: &Node, node: *mut Node, n_left: *mut Node, n_lr: *mut Node) {
        // SAFETY: lock-protected rotation participants.
        let node_ref = unsafe { &*node };
        let left_ref = unsafe { &*n_left };

        let node_ovl = node_ref.change_ovl.load(Ordering::Acquire);
        let left_ovl = left_ref.change_ovl.load(Ordering::Acquire);
        let parent_left = parent.left.load(Ordering::Acquire);

        node_ref
            .change_ovl
            .store(begin_shrink(node_ovl), Ordering::Release);
        left_ref
            .change_ovl
            .store(begin_grow(left_ovl), Ordering::Release);

        node_ref.left.store(n_lr, Ordering::Release);
        left_ref.right.store(node, Ordering::Release);
        if parent_left == node {
            parent.left.store(n_left, Ordering::Release);
        } else {
            parent.right.store(n_left, Ordering::Release);
        }

        left_ref
            .parent
            .store(parent as *const Node as *mut Node, Ordering::Release);
        node_ref.parent.store(n_left, Ordering::Release);
        if !n_lr.is_null() {
            // SAFETY: live subtree root being re-parented under locks.
            unsafe { &*n_lr }.parent.store(node, Ordering::Release);
        }

        left_ref
            .change_ovl
            .store(end_grow(left_ovl), Ordering::Release);
        node_ref
            .change_ovl
            .store(end_shrink(node_ovl), Ordering::Release);
    }

    fn rotate_left(&self, parent: &Node, node: *mut Node, n_right: *mut Node, n_rl: *mut Node) {
        // SAFETY: lock-protected rotation participants.
        let node_ref = unsafe { &*node };
        let right_ref = unsafe { &*n_right };

        let node_ovl = node_ref.change_ovl.load(Ordering::Acquire);
        let right_ovl = right_ref.change_ovl.load(Ordering::Acquire);
        let parent_left = parent.left.load(Ordering::Acquire);

        node_ref
            .change_ovl
            .store(begin_shrink(node_ovl), Ordering::Release);
        right_ref
            .change_ovl
            .store(begin_grow(right_ovl), Ordering::Release);

        node_ref.right.store(n_rl, Ordering::Release);
        right_ref.left.store(node, Ordering::Release);
        if parent_left == node {
            parent.left.store(n_right, Ordering::Release);
        } else {
            parent.right.store(n_right, Ordering::Release);
        }

        right_ref
            .parent
            .store(parent as *const Node as *mut Node, Ordering::Release);
        node_ref.parent.store(n_right, Ordering::Release);
        if !n_rl.is_null() {
            // SAFETY: live subtree root being re-parented under locks.
            unsafe { &*n_rl }.parent.store(node, Ordering::Release);
        }

        right_ref
            .change_ovl
            .store(end_grow(right_ovl), Ordering::Release);
        node_ref
            .change_ovl
            .store(end_shrink(node_ovl), Ordering::Release);
    }

    fn rotate_right_over_left(
        &self,
        parent: &Node,
        node: *mut Node,
        n_left: *mut Node,
        n_lr: *mut Node,
    ) {
        // SAFETY: lock-protected rotation participants.
        let node_ref = unsafe { &*node };
        let left_ref = unsafe { &*n_left };
        let lr_ref = unsafe { &*n_lr };

        let node_ovl = node_ref.change_ovl.load(Ordering::Acquire);
        let left_ovl = left_ref.change_ovl.load(Ordering::Acquire);
        let lr_ovl = lr_ref.change_ovl.load(Ordering::Acquire);

        let parent_left = parent.left.load(Ordering::Acquire);
        let n_lrl = lr_ref.left.load(Ordering::Acquire);
        let n_lrr = lr_ref.right.load(Ordering::Acquire);

        node_ref
            .change_ovl
            .store(begin_shrink(node_ovl), Ordering::Release);
        left_ref
            .change_ovl
            .store(begin_shrink(left_ovl), Ordering::Release);
        lr_ref.change_ovl.store(begin_grow(lr_ovl), Ordering::Release);

        node_ref.left.store(n_lrr, Ordering::Release);
        left_ref.right.store(n_lrl, Ordering::Release);
        lr_ref.left.store(n_left, Ordering::Release);
        lr_ref.right.store(node, Ordering::Release);

        if parent_left == node {
            parent.left.store(n_lr, Ordering::Release);
        } else {
            parent.right.store(n_lr, Ordering::Release);
        }

        lr_ref
            .parent
            .store(parent as *const Node as *mut Node, Ordering::Release);
        left_ref.parent.store(n_lr, Ordering::Release);
        node_ref.parent.store(n_lr, Ordering::Release);

        if !n_lrr.is_null() {
            // SAFETY: live subtree root being re-parented under locks.
            unsafe { &*n_lrr }.parent.store(node, Ordering::Release);
        }
        if !n_lrl.is_null() {
            // SAFETY: as above.
            unsafe { &*n_lrl }.parent.store(n_left, Ordering::Release);
        }

        lr_ref.change_ovl.store(end_grow(lr_ovl), Ordering::Release);
        left_ref
            .change_ovl
            .store(end_shrink(left_ovl), Ordering::Release);
        node_ref
            .change_ovl
            .store(end_shrink(node_ovl), Ordering::Release);
    }

    fn rotate_left_over_right(
        &self,
        parent: &Node,
        node: *mut Node,
        n_right: *mut Node,
        n_rl: *mut Node,
    ) {
        // SAFETY: lock-protected rotation participants.
        let node_ref = unsafe { &*node };
        let right_ref = unsafe { &*n_right };
        let rl_ref = unsafe { &*n_rl };

        let node_ovl = node_ref.change_ovl.load(Ordering::Acquire);
        let right_ovl = right_ref.change_ovl.load(Ordering::Acquire);
        let rl_ovl = rl_ref.change_ovl.load(Ordering::Acquire);

        let parent_left = parent.left.load(Ordering::Acquire);
        let n_rll = rl_ref.left.load(Ordering::Acquire);
        let n_rlr = rl_ref.right.load(Ordering::Acquire);

        node_ref
            .change_ovl
            .store(begin_shrink(node_ovl), Ordering::Release);
        right_ref
            .change_ovl
            .store(begin_shrink(right_ovl), Ordering::Release);
        rl_ref.change_ovl.store(begin_grow(rl_ovl), Ordering::Release);

        node_ref.right.store(n_rll, Ordering::Release);
        right_ref.left.store(n_rlr, Ordering::Release);
        rl_ref.right.store(n_right, Ordering::Release);
        rl_ref.left.store(node, Ordering::Release);

        if parent_left == node {
            parent.left.store(n_rl, Ordering::Release);
        } else {
            parent.right.store(n_rl, Ordering::Release);
        }

        rl_ref
            .parent
            .store(parent as *const Node as *mut Node, Ordering::Release);
        right_ref.parent.store(n_rl, Ordering::Release);
        node_ref.parent.store(n_rl, Ordering::Release);

        if !n_rll.is_null() {
            // SAFETY: live subtree root being re-parented under locks.
            unsafe { &*n_rll }.parent.store(node, Ordering::Release);
        }
        if !n_rlr.is_null() {
            // SAFETY: as above.
            unsafe { &*n_rlr }.parent.store(n_right, Ordering::Release);
        }

        rl_ref.change_ovl.store(end_grow(rl_ovl), Ordering::Release);
        right_ref
            .change_ovl
            .store(end_shrink(right_ovl), Ordering::Release);
        node_ref
            .change_ovl
            .store(end_shrink(node_ovl), Ordering::Release);
    }

    fn do_remove(&self, ctx: &ThreadContext, key: i32) -> bool {
        loop {
            let right = self.root_holder().right.load(Ordering::Acquire);

            if right.is_null() {
                self.release_all(ctx);
                return false;
            }

            // SAFETY: see the module-level reclamation note.
            let right_ref = unsafe { &*right };
            let ovl = right_ref.change_ovl.load(Ordering::Acquire);
            if is_shrinking_or_unlinked(ovl) {
                right_ref.wait_until_change_completed(ovl);
            } else if right == self.root_holder().right.load(Ordering::Acquire) {
                match self.attempt_remove(ctx, key, self.root_holder, right, ovl) {
                    Outcome::Retry => {}
                    Outcome::Found => {
                        self.note_removed(ctx);
                        self.release_all(ctx);
                        return true;
                    }
                    Outcome::NotFound => {
                        self.release_all(ctx);
                        return false;
                    }
                }
            }
        }
    }
}

impl<T: KeyHash> ConcurrentSet<T> for CbTree<T> {
    fn add(&self, ctx: &ThreadContext, value: T) -> bool {
        if self.update(ctx, value.hash()) == Outcome::NotFound {
            self.note_added(ctx);
            true
        } else {
            false
        }
    }

    fn remove(&self, ctx: &ThreadContext, value: T) -> bool {
        self.do_remove(ctx, value.hash())
    }

    fn contains(&self, ctx: &ThreadContext, value: T) -> bool {
        self.do_contains(ctx, value.hash())
    }
}

impl<T> Drop for CbTree<T> {
    fn drop(&mut self) {
        let mut stack = vec![self.root_holder];
        while let Some(node) = stack.pop() {
            // SAFETY: linked nodes are exclusively owned during drop and
            // disjoint from the manager's queues (unlink retires).
            let boxed = unsafe { Box::from_raw(node) };
            let left = boxed.left.load(Ordering::Relaxed);
            let right = boxed.right.load(Ordering::Relaxed);
            if !left.is_null() {
                stack.push(left);
            }
            if !right.is_null() {
                stack.push(right);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::core::thread::ThreadRegistry;

    fn check_subtree(node: *mut Node, min: i64, max: i64) -> usize {
        if node.is_null() {
            return 0;
        }
        // SAFETY: quiescent single-threaded walk.
        let n = unsafe { &*node };
        let ovl = n.change_ovl.load(Ordering::Relaxed);
        assert!(!is_changing(ovl), "grow/shrink bit set at quiescence");
        assert!(!is_unlinked(ovl), "unlinked node still linked");

        let key = i64::from(n.key.load(Ordering::Relaxed));
        assert!(min < key && key < max, "search order violated");

        1 + check_subtree(n.left.load(Ordering::Relaxed), min, key)
            + check_subtree(n.right.load(Ordering::Relaxed), key, max)
    }

    fn assert_invariants(tree: &CbTree<i32>, expected_linked_at_least: usize) {
        // SAFETY: quiescent single-threaded walk.
        let root = unsafe { &*tree.root_holder }.right.load(Ordering::Relaxed);
        let linked = check_subtree(root, i64::MIN, i64::MAX);
        assert!(linked >= expected_linked_at_least);
    }

    #[test]
    fn repeated_hits_pull_a_key_toward_the_root() {
        let registry = ThreadRegistry::new(1);
        let ctx = registry.register().unwrap();
        let tree: CbTree<i32> = CbTree::new(1);

        for i in 0..256 {
            assert!(tree.add(&ctx, i));
        }
        for _ in 0..64 {
            assert!(tree.contains(&ctx, 200));
        }
        assert_invariants(&tree, 256);

        // SAFETY: quiescent single-threaded read.
        let root = unsafe { &*tree.root_holder }.right.load(Ordering::Relaxed);
        let root_key = unsafe { &*root }.key.load(Ordering::Relaxed);
        // The hot key does not have to be the root, but its counters must
        // have moved it off the deep right spine a plain BST would keep.
        let mut depth = 0;
        let mut cur = root;
        while !cur.is_null() {
            let n = unsafe { &*cur };
            match 200.cmp(&n.key.load(Ordering::Relaxed)) {
                KeyOrdering::Equal => break,
                KeyOrdering::Less => cur = n.left.load(Ordering::Relaxed),
                KeyOrdering::Greater => cur = n.right.load(Ordering::Relaxed),
            }
            depth += 1;
        }
        assert!(depth < 200, "hot key stayed at depth {depth} (root {root_key})");
    }

    #[test]
    fn add_remove_add_cycles_keep_order() {
        let registry = ThreadRegistry::new(1);
        let ctx = registry.register().unwrap();
        let tree: CbTree<i32> = CbTree::new(1);

        for i in 0..128 {
            assert!(tree.add(&ctx, i));
        }
        for i in 0..128 {
            assert!(tree.remove(&ctx, i), "remove {i}");
            assert!(!tree.contains(&ctx, i));
        }
        for i in 0..128 {
            assert!(tree.add(&ctx, i));
            assert!(tree.contains(&ctx, i));
        }
        assert_invariants(&tree, 128);
    }
}
