//! Relaxed-balance AVL tree with optimistic, version-validated reads.
//!
//! Readers traverse without locks and validate a per-node version word
//! after every child-link dereference; a version change means a shrink
//! (rotation or unlink) intersected the read and the step is retried.
//! Writers take per-node locks root-to-leaf, never holding more than the
//! parent, the node and the affected children of one rotation at a time.
//! Unlinked nodes are stamped with a distinguished version and retired to
//! the hazard manager, which recycles them once no thread can observe
//! them.
//!
//! # Safety
//! Raw node pointers are dereferenced throughout. The memory behind every
//! pointer reachable from the tree stays allocated until the tree drops:
//! retired nodes are recycled through the hazard manager's free lists,
//! never handed back to the allocator mid-run. All shared node fields are
//! atomics, so a stale optimistic reader observes a consistent (possibly
//! recycled) node and is turned back by the version protocol.

#![allow(unsafe_code)]
#![deny(unsafe_op_in_unsafe_fn)]

use crate::core::reclaim::HazardManager;
use crate::core::sets::{ConcurrentSet, KeyHash};
use crate::core::thread::ThreadContext;
use parking_lot::Mutex;
use std::cmp::Ordering as KeyOrdering;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU64, Ordering};

const SPIN_COUNT: usize = 100;

/// Version word layout: bit 0 = shrink in progress, bit 1 = unlinked,
/// upper bits count completed shrinks.
const UNLINKED_VERSION: u64 = 2;

fn begin_change(version: u64) -> u64 {
    version | 1
}

fn end_change(version: u64) -> u64 {
    (version | 3) + 1
}

fn is_shrinking(version: u64) -> bool {
    version & 1 != 0
}

fn is_unlinked(version: u64) -> bool {
    version & 2 != 0
}

fn is_shrinking_or_unlinked(version: u64) -> bool {
    version & 3 != 0
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateMode {
    IfAbsent,
    IfPresent,
}

impl UpdateMode {
    fn should_update(self, prev: bool) -> bool {
        match self {
            UpdateMode::IfAbsent => !prev,
            UpdateMode::IfPresent => prev,
        }
    }

    /// Result reported when the update went through.
    fn applied(self) -> Outcome {
        match self {
            UpdateMode::IfAbsent => Outcome::NotFound,
            UpdateMode::IfPresent => Outcome::Found,
        }
    }

    /// Result reported when the set already had the desired shape.
    fn unchanged(self) -> Outcome {
        match self {
            UpdateMode::IfAbsent => Outcome::Found,
            UpdateMode::IfPresent => Outcome::NotFound,
        }
    }
}

/// What a node needs from the rebalancing walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Condition {
    UnlinkRequired,
    RebalanceRequired,
    NewHeight(i32),
    Nothing,
}

pub struct Node {
    key: AtomicI32,
    height: AtomicI32,
    version: AtomicU64,
    present: AtomicBool,
    parent: AtomicPtr<Node>,
    left: AtomicPtr<Node>,
    right: AtomicPtr<Node>,
    lock: Mutex<()>,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            key: AtomicI32::new(0),
            height: AtomicI32::new(0),
            version: AtomicU64::new(0),
            present: AtomicBool::new(false),
            parent: AtomicPtr::new(ptr::null_mut()),
            left: AtomicPtr::new(ptr::null_mut()),
            right: AtomicPtr::new(ptr::null_mut()),
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
}

fn height(node: *mut Node) -> i32 {
    if node.is_null() {
        0
    } else {
        // SAFETY: tree nodes stay allocated for the tree's lifetime.
        unsafe { (*node).height.load(Ordering::Relaxed) }
    }
}

fn node_condition(node: &Node) -> Condition {
    let left = node.left.load(Ordering::Acquire);
    let right = node.right.load(Ordering::Acquire);

    if (left.is_null() || right.is_null()) && !node.present.load(Ordering::Acquire) {
        return Condition::UnlinkRequired;
    }

    let h_node = node.height.load(Ordering::Relaxed);
    let h_left = height(left);
    let h_right = height(right);
    let h_repl = 1 + h_left.max(h_right);

    if (h_left - h_right).abs() > 1 {
        return Condition::RebalanceRequired;
    }

    if h_node != h_repl {
        Condition::NewHeight(h_repl)
    } else {
        Condition::Nothing
    }
}

// Only valid with the node's lock held.
fn fix_height_locked(node: &Node) -> *mut Node {
    match node_condition(node) {
        Condition::RebalanceRequired | Condition::UnlinkRequired => {
            node as *const Node as *mut Node
        }
        Condition::Nothing => ptr::null_mut(),
        Condition::NewHeight(h) => {
            node.height.store(h, Ordering::Relaxed);
            node.parent.load(Ordering::Acquire)
        }
    }
}

/// Concurrent ordered set backed by the optimistic AVL tree.
///
/// `threads` fixes the number of worker identities the internal hazard
/// manager is dimensioned for.
pub struct AvlTree<T> {
    root_holder: *mut Node,
    hazard: HazardManager<Node>,
    _marker: PhantomData<fn(T) -> T>,
}

// SAFETY: all shared node state is atomic or lock-protected, and the
// hazard manager enforces the reclamation protocol; `T` is never stored.
unsafe impl<T> Send for AvlTree<T> {}
unsafe impl<T> Sync for AvlTree<T> {}

const HAZARDS_PER_THREAD: usize = 6;
const PREFILL: usize = 50;

impl<T: KeyHash> AvlTree<T> {
    pub fn new(threads: usize) -> Self {
        let hazard = HazardManager::new(threads, HAZARDS_PER_THREAD, PREFILL);
        let root_holder = Box::into_raw(Box::new(Node {
            key: AtomicI32::new(i32::MIN),
            height: AtomicI32::new(1),
            ..Node::default()
        }));
        Self {
            root_holder,
            hazard,
            _marker: PhantomData,
        }
    }

    /// Takes a node from the hazard manager and reinitializes it field by
    /// field. The version continues from the recycled node's old value
    /// with the flag bits cleared, so a stale reader still holding a
    /// version of a previous incarnation can never revalidate against it.
    fn init_node(
        &self,
        ctx: &ThreadContext,
        key: i32,
        node_height: i32,
        present: bool,
        parent: *mut Node,
    ) -> *mut Node {
        let node = self.hazard.acquire(ctx);
        // SAFETY: `acquire` hands out nodes no thread holds a hazard on;
        // stale optimistic readers only touch the atomic fields.
        let n = unsafe { &*node };
        n.key.store(key, Ordering::Relaxed);
        n.height.store(node_height, Ordering::Relaxed);
        let recycled = n.version.load(Ordering::Relaxed);
        n.version.store(end_change(recycled), Ordering::Release);
        n.present.store(present, Ordering::Relaxed);
        n.parent.store(parent, Ordering::Relaxed);
        n.left.store(ptr::null_mut(), Ordering::Relaxed);
        n.right.store(ptr::null_mut(), Ordering::Relaxed);
        node
    }

    fn root_holder(&self) -> &Node {
        // SAFETY: the holder lives as long as the tree.
        unsafe { &*self.root_holder }
    }

    fn do_contains(&self, key: i32) -> bool {
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

            let version = right_ref.version.load(Ordering::Acquire);
            if is_shrinking_or_unlinked(version) {
                self.wait_until_not_changing(right_ref);
            } else if right == self.root_holder().right.load(Ordering::Acquire) {
                match self.attempt_get(key, right_ref, dir, version) {
                    Outcome::Retry => {}
                    Outcome::Found => return true,
                    Outcome::NotFound => return false,
                }
            }
        }
    }

    fn attempt_get(&self, key: i32, node: &Node, dir: Dir, node_version: u64) -> Outcome {
        loop {
            let child = node.child(dir);

            if child.is_null() {
                if node.version.load(Ordering::Acquire) != node_version {
                    return Outcome::Retry;
                }
                return Outcome::NotFound;
            }

            // SAFETY: see the module-level reclamation note.
            let child_ref = unsafe { &*child };
            let child_dir = match key.cmp(&child_ref.key.load(Ordering::Relaxed)) {
                KeyOrdering::Equal => {
                    return if child_ref.present.load(Ordering::Acquire) {
                        Outcome::Found
                    } else {
                        Outcome::NotFound
                    };
                }
                KeyOrdering::Less => Dir::Left,
                KeyOrdering::Greater => Dir::Right,
            };

            let child_version = child_ref.version.load(Ordering::Acquire);
            if is_shrinking_or_unlinked(child_version) {
                self.wait_until_not_changing(child_ref);
                if node.version.load(Ordering::Acquire) != node_version {
                    return Outcome::Retry;
                }
            } else if child != node.child(dir) {
                // The link moved under us; revalidate the parent and
                // re-read it.
                if node.version.load(Ordering::Acquire) != node_version {
                    return Outcome::Retry;
                }
            } else {
                if node.version.load(Ordering::Acquire) != node_version {
                    return Outcome::Retry;
                }
                match self.attempt_get(key, child_ref, child_dir, child_version) {
                    Outcome::Retry => {}
                    result => return result,
                }
            }
        }
    }

    fn wait_until_not_changing(&self, node: &Node) {
        let version = node.version.load(Ordering::Acquire);
        if is_shrinking(version) {
            for _ in 0..SPIN_COUNT {
                if node.version.load(Ordering::Acquire) != version {
                    return;
                }
                std::hint::spin_loop();
            }
            // Serializes behind the shrink.
            drop(node.lock.lock());
        }
    }

    fn update_under_root(&self, ctx: &ThreadContext, key: i32, mode: UpdateMode) -> Outcome {
        loop {
            let right = self.root_holder().right.load(Ordering::Acquire);

            if right.is_null() {
                if !mode.should_update(false) {
                    return mode.unchanged();
                }
                if mode == UpdateMode::IfPresent || self.attempt_insert_into_empty(ctx, key) {
                    return mode.applied();
                }
            } else {
                // SAFETY: see the module-level reclamation note.
                let right_ref = unsafe { &*right };
                let version = right_ref.version.load(Ordering::Acquire);

                if is_shrinking_or_unlinked(version) {
                    self.wait_until_not_changing(right_ref);
                } else if right == self.root_holder().right.load(Ordering::Acquire) {
                    let result = self.attempt_update(
                        ctx,
                        key,
                        mode,
                        self.root_holder,
                        right,
                        version,
                    );
                    if result != Outcome::Retry {
                        return result;
                    }
                }
            }
        }
    }

    fn attempt_insert_into_empty(&self, ctx: &ThreadContext, key: i32) -> bool {
        let holder = self.root_holder();
        self.hazard.publish(ctx, 0, self.root_holder);
        let _guard = holder.lock.lock();

        let inserted = if holder.right.load(Ordering::Acquire).is_null() {
            let node = self.init_node(ctx, key, 1, true, self.root_holder);
            holder.right.store(node, Ordering::Release);
            holder.height.store(2, Ordering::Relaxed);
            true
        } else {
            false
        };

        self.hazard.release_all(ctx);
        inserted
    }

    fn attempt_update(
        &self,
        ctx: &ThreadContext,
        key: i32,
        mode: UpdateMode,
        parent: *mut Node,
        node: *mut Node,
        node_version: u64,
    ) -> Outcome {
        debug_assert!(node_version != UNLINKED_VERSION);

        // SAFETY: see the module-level reclamation note.
        let node_ref = unsafe { &*node };
        let dir = match key.cmp(&node_ref.key.load(Ordering::Relaxed)) {
            KeyOrdering::Equal => return self.attempt_node_update(ctx, mode, parent, node),
            KeyOrdering::Less => Dir::Left,
            KeyOrdering::Greater => Dir::Right,
        };

        loop {
            let child = node_ref.child(dir);

            if node_ref.version.load(Ordering::Acquire) != node_version {
                return Outcome::Retry;
            }

            if child.is_null() {
                if mode == UpdateMode::IfPresent {
                    return Outcome::NotFound;
                }

                let damaged;
                {
                    self.hazard.publish(ctx, 0, node);
                    let _guard = node_ref.lock.lock();

                    if node_ref.version.load(Ordering::Acquire) != node_version {
                        self.hazard.release_all(ctx);
                        return Outcome::Retry;
                    }

                    if !node_ref.child(dir).is_null() {
                        // Someone slipped a child in; re-read and retry
                        // from the loop head.
                        self.hazard.release_all(ctx);
                        continue;
                    }

                    let leaf = self.init_node(ctx, key, 1, true, node);
                    node_ref.set_child(dir, leaf);
                    damaged = fix_height_locked(node_ref);
                    self.hazard.release_all(ctx);
                }

                self.fix_height_and_rebalance(ctx, damaged);
                return mode.applied();
            }

            // SAFETY: see the module-level reclamation note.
            let child_ref = unsafe { &*child };
            let child_version = child_ref.version.load(Ordering::Acquire);

            if is_shrinking_or_unlinked(child_version) {
                self.wait_until_not_changing(child_ref);
            } else if child != node_ref.child(dir) {
                // Retry edge: link changed between reads.
            } else {
                if node_ref.version.load(Ordering::Acquire) != node_version {
                    return Outcome::Retry;
                }
                let result = self.attempt_update(ctx, key, mode, node, child, child_version);
                if result != Outcome::Retry {
                    return result;
                }
            }
        }
    }

    fn attempt_node_update(
        &self,
        ctx: &ThreadContext,
        mode: UpdateMode,
        parent: *mut Node,
        node: *mut Node,
    ) -> Outcome {
        // SAFETY: see the module-level reclamation note.
        let node_ref = unsafe { &*node };
        let parent_ref = unsafe { &*parent };

        if mode == UpdateMode::IfPresent && !node_ref.present.load(Ordering::Acquire) {
            return Outcome::NotFound;
        }

        let removing_leafish = mode == UpdateMode::IfPresent
            && (node_ref.left.load(Ordering::Acquire).is_null()
                || node_ref.right.load(Ordering::Acquire).is_null());

        if removing_leafish {
            let prev;
            let damaged;
            {
                self.hazard.publish(ctx, 0, parent);
                let _parent_guard = parent_ref.lock.lock();

                if is_unlinked(parent_ref.version.load(Ordering::Acquire))
                    || node_ref.parent.load(Ordering::Acquire) != parent
                {
                    self.hazard.release_all(ctx);
                    return Outcome::Retry;
                }

                {
                    self.hazard.publish(ctx, 1, node);
                    let _node_guard = node_ref.lock.lock();

                    prev = node_ref.present.load(Ordering::Acquire);
                    if !mode.should_update(prev) {
                        self.hazard.release_all(ctx);
                        return mode.unchanged();
                    }

                    if !self.attempt_unlink_locked(ctx, parent_ref, node) {
                        self.hazard.release_all(ctx);
                        return Outcome::Retry;
                    }
                }

                self.hazard.release_all(ctx);
                damaged = fix_height_locked(parent_ref);
            }

            self.fix_height_and_rebalance(ctx, damaged);
            debug_assert!(prev);
            mode.applied()
        } else {
            self.hazard.publish(ctx, 0, node);
            let _guard = node_ref.lock.lock();

            if is_unlinked(node_ref.version.load(Ordering::Acquire)) {
                self.hazard.release_all(ctx);
                return Outcome::Retry;
            }

            let prev = node_ref.present.load(Ordering::Acquire);
            if !mode.should_update(prev) {
                self.hazard.release_all(ctx);
                return mode.unchanged();
            }

            // A removal that lost a child while we were acquiring the
            // lock must go through the unlink path instead.
            if mode == UpdateMode::IfPresent
                && (node_ref.left.load(Ordering::Acquire).is_null()
                    || node_ref.right.load(Ordering::Acquire).is_null())
            {
                self.hazard.release_all(ctx);
                return Outcome::Retry;
            }

            node_ref
                .present
                .store(mode == UpdateMode::IfAbsent, Ordering::Release);
            self.hazard.release_all(ctx);
            mode.applied()
        }
    }

    // Caller holds locks on both the parent and the node.
    fn attempt_unlink_locked(
        &self,
        ctx: &ThreadContext,
        parent: &Node,
        node: *mut Node,
    ) -> bool {
        debug_assert!(!is_unlinked(parent.version.load(Ordering::Acquire)));

        let parent_left = parent.left.load(Ordering::Acquire);
        let parent_right = parent.right.load(Ordering::Acquire);
        if parent_left != node && parent_right != node {
            return false;
        }

        // SAFETY: see the module-level reclamation note.
        let node_ref = unsafe { &*node };
        debug_assert!(!is_unlinked(node_ref.version.load(Ordering::Acquire)));

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

        node_ref.version.store(UNLINKED_VERSION, Ordering::Release);
        node_ref.present.store(false, Ordering::Release);
        self.hazard.retire(ctx, node);

        true
    }

    fn fix_height_and_rebalance(&self, ctx: &ThreadContext, mut node: *mut Node) {
        while !node.is_null() {
            // SAFETY: see the module-level reclamation note.
            let node_ref = unsafe { &*node };
            if node_ref.parent.load(Ordering::Acquire).is_null() {
                return;
            }

            let condition = node_condition(node_ref);
            if condition == Condition::Nothing
                || is_unlinked(node_ref.version.load(Ordering::Acquire))
            {
                return;
            }

            if let Condition::NewHeight(_) = condition {
                self.hazard.publish(ctx, 0, node);
                let _guard = node_ref.lock.lock();
                node = fix_height_locked(node_ref);
                self.hazard.release_all(ctx);
            } else {
                let parent = node_ref.parent.load(Ordering::Acquire);
                // SAFETY: parents of reachable nodes stay allocated.
                let parent_ref = unsafe { &*parent };
                self.hazard.publish(ctx, 0, parent);
                let _parent_guard = parent_ref.lock.lock();

                if !is_unlinked(parent_ref.version.load(Ordering::Acquire))
                    && node_ref.parent.load(Ordering::Acquire) == parent
                {
                    self.hazard.publish(ctx, 1, node);
                    let _node_guard = node_ref.lock.lock();
                    node = self.rebalance_locked(ctx, parent_ref, node);
                }

                self.hazard.release_all(ctx);
            }
        }
    }

    // Caller holds locks on the parent and the node.
    fn rebalance_locked(
        &self,
        ctx: &ThreadContext,
        parent: &Node,
        node: *mut Node,
    ) -> *mut Node {
        // SAFETY: see the module-level reclamation note.
        let node_ref = unsafe { &*node };
        let left = node_ref.left.load(Ordering::Acquire);
        let right = node_ref.right.load(Ordering::Acquire);

        if (left.is_null() || right.is_null()) && !node_ref.present.load(Ordering::Acquire) {
            return if self.attempt_unlink_locked(ctx, parent, node) {
                fix_height_locked(parent)
            } else {
                node
            };
        }

        let h_node = node_ref.height.load(Ordering::Relaxed);
        let h_left = height(left);
        let h_right = height(right);
        let h_repl = 1 + h_left.max(h_right);

        if h_left - h_right > 1 {
            self.rebalance_to_right_locked(ctx, parent, node, left, h_right)
        } else if h_left - h_right < -1 {
            self.rebalance_to_left_locked(ctx, parent, node, right, h_left)
        } else if h_repl != h_node {
            node_ref.height.store(h_repl, Ordering::Relaxed);
            fix_height_locked(parent)
        } else {
            ptr::null_mut()
        }
    }

    fn rebalance_to_right_locked(
        &self,
        ctx: &ThreadContext,
        parent: &Node,
        node: *mut Node,
        n_left: *mut Node,
        h_right0: i32,
    ) -> *mut Node {
        // SAFETY: n_left is the locked node's child; it stays allocated.
        let left_ref = unsafe { &*n_left };
        self.hazard.publish(ctx, 2, n_left);
        let _left_guard = left_ref.lock.lock();

        let h_left = left_ref.height.load(Ordering::Relaxed);
        if h_left - h_right0 <= 1 {
            return node; // retry
        }

        let n_left_right = left_ref.right.load(Ordering::Acquire);
        let h_ll0 = height(left_ref.left.load(Ordering::Acquire));
        let h_lr0 = height(n_left_right);

        if h_ll0 > h_lr0 {
            return self.rotate_right_locked(parent, node, n_left, h_right0, h_ll0, n_left_right, h_lr0);
        }

        {
            // SAFETY: non-null because h_lr0 >= h_ll0 >= 0 and the
            // balance precondition forces a right child here.
            let lr_ref = unsafe { &*n_left_right };
            self.hazard.publish(ctx, 3, n_left_right);
            let _sub_guard = lr_ref.lock.lock();

            let h_lr = lr_ref.height.load(Ordering::Relaxed);
            if h_ll0 >= h_lr {
                return self.rotate_right_locked(parent, node, n_left, h_right0, h_ll0, n_left_right, h_lr);
            }

            let h_lrl = height(lr_ref.left.load(Ordering::Acquire));
            if (h_ll0 - h_lrl).abs() <= 1 {
                return self.rotate_right_over_left_locked(
                    parent, node, n_left, h_right0, h_ll0, n_left_right, h_lrl,
                );
            }
        }

        // The left-right grandchild is itself out of balance; fix it
        // first, then this node gets re-examined.
        // SAFETY: node is locked by the caller.
        self.rebalance_to_left_locked(ctx, unsafe { &*node }, n_left, n_left_right, h_ll0)
    }

    fn rebalance_to_left_locked(
        &self,
        ctx: &ThreadContext,
        parent: &Node,
        node: *mut Node,
        n_right: *mut Node,
        h_left0: i32,
    ) -> *mut Node {
        // SAFETY: n_right is the locked node's child; it stays allocated.
        let right_ref = unsafe { &*n_right };
        self.hazard.publish(ctx, 4, n_right);
        let _right_guard = right_ref.lock.lock();

        let h_right = right_ref.height.load(Ordering::Relaxed);
        if h_left0 - h_right >= -1 {
            return node; // retry
        }

        let n_right_left = right_ref.left.load(Ordering::Acquire);
        let h_rl0 = height(n_right_left);
        let h_rr0 = height(right_ref.right.load(Ordering::Acquire));

        if h_rr0 >= h_rl0 {
            return self.rotate_left_locked(parent, node, h_left0, n_right, n_right_left, h_rl0, h_rr0);
        }

        {
            // SAFETY: non-null because h_rl0 > h_rr0 >= 0.
            let rl_ref = unsafe { &*n_right_left };
            self.hazard.publish(ctx, 5, n_right_left);
            let _sub_guard = rl_ref.lock.lock();

            let h_rl = rl_ref.height.load(Ordering::Relaxed);
            if h_rr0 >= h_rl {
                return self.rotate_left_locked(parent, node, h_left0, n_right, n_right_left, h_rl, h_rr0);
            }

            let h_rlr = height(rl_ref.right.load(Ordering::Acquire));
            if (h_rr0 - h_rlr).abs() <= 1 {
                return self.rotate_left_over_right_locked(
                    parent, node, h_left0, n_right, n_right_left, h_rr0, h_rlr,
                );
            }
        }

        // SAFETY: node is locked by the caller.
        self.rebalance_to_right_locked(ctx, unsafe { &*node }, n_right, n_right_left, h_rr0)
    }

    #[allow(clippy::too_many_arguments)]
    fn rotate_right_locked(
        &self,
        parent: &Node,
        node: *mut Node,
        n_left: *mut Node,
        h_right: i32,
        h_ll: i32,
        n_left_right: *mut Node,
        h_lr: i32,
    ) -> *mut Node {
        // SAFETY: all pointers are lock-protected participants of this
        // rotation; see the module-level reclamation note.
        let node_ref = unsafe { &*node };
        let left_ref = unsafe { &*n_left };

        let node_version = node_ref.version.load(Ordering::Acquire);
        let parent_left = parent.left.load(Ordering::Acquire);
        node_ref
            .version
            .store(begin_change(node_version), Ordering::Release);

        node_ref.left.store(n_left_right, Ordering::Release);
        if !n_left_right.is_null() {
            // SAFETY: live subtree root being re-parented under locks.
            unsafe { &*n_left_right }.parent.store(node, Ordering::Release);
        }

        left_ref.right.store(node, Ordering::Release);
        node_ref.parent.store(n_left, Ordering::Release);

        if parent_left == node {
            parent.left.store(n_left, Ordering::Release);
        } else {
            parent.right.store(n_left, Ordering::Release);
        }
        left_ref
            .parent
            .store(parent as *const Node as *mut Node, Ordering::Release);

        let h_node_repl = 1 + h_lr.max(h_right);
        node_ref.height.store(h_node_repl, Ordering::Relaxed);
        left_ref
            .height
            .store(1 + h_ll.max(h_node_repl), Ordering::Relaxed);

        node_ref
            .version
            .store(end_change(node_version), Ordering::Release);

        let bal_node = h_lr - h_right;
        if !(-1..=1).contains(&bal_node) {
            return node;
        }
        let bal_left = h_ll - h_node_repl;
        if !(-1..=1).contains(&bal_left) {
            return n_left;
        }
        fix_height_locked(parent)
    }

    #[allow(clippy::too_many_arguments)]
    fn rotate_left_locked(
        &self,
        parent: &Node,
        node: *mut Node,
        h_left: i32,
        n_right: *mut Node,
        n_right_left: *mut Node,
        h_rl: i32,
        h_rr: i32,
    ) -> *mut Node {
        // SAFETY: as in `rotate_right_locked`.
        let node_ref = unsafe { &*node };
        let right_ref = unsafe { &*n_right };

        let node_version = node_ref.version.load(Ordering::Acquire);
        let parent_left = parent.left.load(Ordering::Acquire);
        node_ref
            .version
            .store(begin_change(node_version), Ordering::Release);

        node_ref.right.store(n_right_left, Ordering::Release);
        if !n_right_left.is_null() {
            // SAFETY: live subtree root being re-parented under locks.
            unsafe { &*n_right_left }.parent.store(node, Ordering::Release);
        }

        right_ref.left.store(node, Ordering::Release);
        node_ref.parent.store(n_right, Ordering::Release);

        if parent_left == node {
            parent.left.store(n_right, Ordering::Release);
        } else {
            parent.right.store(n_right, Ordering::Release);
        }
        right_ref
            .parent
            .store(parent as *const Node as *mut Node, Ordering::Release);

        let h_node_repl = 1 + h_left.max(h_rl);
        node_ref.height.store(h_node_repl, Ordering::Relaxed);
        right_ref
            .height
            .store(1 + h_node_repl.max(h_rr), Ordering::Relaxed);

        node_ref
            .version
            .store(end_change(node_version), Ordering::Release);

        let bal_node = h_rl - h_left;
        if !(-1..=1).contains(&bal_node) {
            return node;
        }
        let bal_right = h_rr - h_node_repl;
        if !(-1..=1).contains(&bal_right) {
            return n_right;
        }
        fix_height_locked(parent)
    }

    #[allow(clippy::too_many_arguments)]
    fn rotate_right_over_left_locked(
        &self,
        parent: &Node,
        node: *mut Node,
        n_left: *mut Node,
        h_right: i32,
        h_ll: i32,
        n_left_right: *mut Node,
        h_lrl: i32,
    ) -> *mut Node {
        // SAFETY: as in `rotate_right_locked`; n_left_right is locked too.
        let node_ref = unsafe { &*node };
        let left_ref = unsafe { &*n_left };
        let lr_ref = unsafe { &*n_left_right };

        let node_version = node_ref.version.load(Ordering::Acquire);
        let left_version = left_ref.version.load(Ordering::Acquire);

        let parent_left = parent.left.load(Ordering::Acquire);
        let n_lrl = lr_ref.left.load(Ordering::Acquire);
        let n_lrr = lr_ref.right.load(Ordering::Acquire);
        let h_lrr = height(n_lrr);

        node_ref
            .version
            .store(begin_change(node_version), Ordering::Release);
        left_ref
            .version
            .store(begin_change(left_version), Ordering::Release);

        node_ref.left.store(n_lrr, Ordering::Release);
        if !n_lrr.is_null() {
            // SAFETY: live subtree root being re-parented under locks.
            unsafe { &*n_lrr }.parent.store(node, Ordering::Release);
        }

        left_ref.right.store(n_lrl, Ordering::Release);
        if !n_lrl.is_null() {
            // SAFETY: as above.
            unsafe { &*n_lrl }.parent.store(n_left, Ordering::Release);
        }

        lr_ref.left.store(n_left, Ordering::Release);
        left_ref.parent.store(n_left_right, Ordering::Release);
        lr_ref.right.store(node, Ordering::Release);
        node_ref.parent.store(n_left_right, Ordering::Release);

        if parent_left == node {
            parent.left.store(n_left_right, Ordering::Release);
        } else {
            parent.right.store(n_left_right, Ordering::Release);
        }
        lr_ref
            .parent
            .store(parent as *const Node as *mut Node, Ordering::Release);

        let h_node_repl = 1 + h_lrr.max(h_right);
        node_ref.height.store(h_node_repl, Ordering::Relaxed);
        let h_left_repl = 1 + h_ll.max(h_lrl);
        left_ref.height.store(h_left_repl, Ordering::Relaxed);
        lr_ref
            .height
            .store(1 + h_left_repl.max(h_node_repl), Ordering::Relaxed);

        node_ref
            .version
            .store(end_change(node_version), Ordering::Release);
        left_ref
            .version
            .store(end_change(left_version), Ordering::Release);

        let bal_node = h_lrr - h_right;
        if !(-1..=1).contains(&bal_node) {
            return node;
        }
        let bal_lr = h_left_repl - h_node_repl;
        if !(-1..=1).contains(&bal_lr) {
            return n_left_right;
        }
        fix_height_locked(parent)
    }

    #[allow(clippy::too_many_arguments)]
    fn rotate_left_over_right_locked(
        &self,
        parent: &Node,
        node: *mut Node,
        h_left: i32,
        n_right: *mut Node,
        n_right_left: *mut Node,
        h_rr: i32,
        h_rlr: i32,
    ) -> *mut Node {
        // SAFETY: as in `rotate_right_locked`; n_right_left is locked too.
        let node_ref = unsafe { &*node };
        let right_ref = unsafe { &*n_right };
        let rl_ref = unsafe { &*n_right_left };

        let node_version = node_ref.version.load(Ordering::Acquire);
        let right_version = right_ref.version.load(Ordering::Acquire);

        node_ref
            .version
            .store(begin_change(node_version), Ordering::Release);
        right_ref
            .version
            .store(begin_change(right_version), Ordering::Release);

        let parent_left = parent.left.load(Ordering::Acquire);
        let n_rll = rl_ref.left.load(Ordering::Acquire);
        let n_rlr = rl_ref.right.load(Ordering::Acquire);
        let h_rll = height(n_rll);

        node_ref.right.store(n_rll, Ordering::Release);
        if !n_rll.is_null() {
            // SAFETY: live subtree root being re-parented under locks.
            unsafe { &*n_rll }.parent.store(node, Ordering::Release);
        }

        right_ref.left.store(n_rlr, Ordering::Release);
        if !n_rlr.is_null() {
            // SAFETY: as above.
            unsafe { &*n_rlr }.parent.store(n_right, Ordering::Release);
        }

        rl_ref.right.store(n_right, Ordering::Release);
        right_ref.parent.store(n_right_left, Ordering::Release);
        rl_ref.left.store(node, Ordering::Release);
        node_ref.parent.store(n_right_left, Ordering::Release);

        if parent_left == node {
            parent.left.store(n_right_left, Ordering::Release);
        } else {
            parent.right.store(n_right_left, Ordering::Release);
        }
        rl_ref
            .parent
            .store(parent as *const Node as *mut Node, Ordering::Release);

        let h_node_repl = 1 + h_left.max(h_rll);
        node_ref.height.store(h_node_repl, Ordering::Relaxed);
        let h_right_repl = 1 + h_rlr.max(h_rr);
        right_ref.height.store(h_right_repl, Ordering::Relaxed);
        rl_ref
            .height
            .store(1 + h_node_repl.max(h_right_repl), Ordering::Relaxed);

        node_ref
            .version
            .store(end_change(node_version), Ordering::Release);
        right_ref
            .version
            .store(end_change(right_version), Ordering::Release);

        let bal_node = h_rll - h_left;
        if !(-1..=1).contains(&bal_node) {
            return node;
        }
        let bal_rl = h_right_repl - h_node_repl;
        if !(-1..=1).contains(&bal_rl) {
            return n_right_left;
        }
        fix_height_locked(parent)
    }
}

impl<T: KeyHash> ConcurrentSet<T> for AvlTree<T> {
    fn add(&self, ctx: &ThreadContext, value: T) -> bool {
        self.update_under_root(ctx, value.hash(), UpdateMode::IfAbsent) == Outcome::NotFound
    }

    fn remove(&self, ctx: &ThreadContext, value: T) -> bool {
        self.update_under_root(ctx, value.hash(), UpdateMode::IfPresent) == Outcome::Found
    }

    fn contains(&self, ctx: &ThreadContext, value: T) -> bool {
        let _ = ctx;
        self.do_contains(value.hash())
    }
}

impl<T> Drop for AvlTree<T> {
    fn drop(&mut self) {
        // Free every node still linked under the holder; the hazard
        // manager's own drop takes care of retired and prefilled nodes.
        let mut stack = vec![self.root_holder];
        while let Some(node) = stack.pop() {
            // SAFETY: linked nodes are exclusively owned once the tree is
            // being dropped; each is freed exactly once because unlinked
            // nodes are only ever in the manager's queues.
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

    fn check_subtree(node: *mut Node) -> i32 {
        if node.is_null() {
            return 0;
        }
        // SAFETY: quiescent single-threaded walk.
        let n = unsafe { &*node };
        let version = n.version.load(Ordering::Relaxed);
        assert!(!is_shrinking(version), "shrink bit set at quiescence");
        assert!(!is_unlinked(version), "unlinked node still linked");

        let hl = check_subtree(n.left.load(Ordering::Relaxed));
        let hr = check_subtree(n.right.load(Ordering::Relaxed));
        assert!((hl - hr).abs() <= 1, "balance factor out of range");
        assert_eq!(n.height.load(Ordering::Relaxed), 1 + hl.max(hr));
        1 + hl.max(hr)
    }

    fn assert_invariants(tree: &AvlTree<i32>) {
        // SAFETY: quiescent single-threaded walk.
        let root = unsafe { &*tree.root_holder }.right.load(Ordering::Relaxed);
        check_subtree(root);
    }

    #[test]
    fn stays_balanced_under_sequential_churn() {
        let registry = ThreadRegistry::new(1);
        let ctx = registry.register().unwrap();
        let tree: AvlTree<i32> = AvlTree::new(1);

        for i in 0..512 {
            assert!(tree.add(&ctx, i));
        }
        assert_invariants(&tree);

        for i in (0..512).step_by(2) {
            assert!(tree.remove(&ctx, i));
        }
        assert_invariants(&tree);

        for i in 0..512 {
            assert_eq!(tree.contains(&ctx, i), i % 2 == 1);
        }
    }

    #[test]
    fn logical_delete_keeps_two_child_nodes_linked() {
        let registry = ThreadRegistry::new(1);
        let ctx = registry.register().unwrap();
        let tree: AvlTree<i32> = AvlTree::new(1);

        for i in [5, 3, 8, 1, 4, 7, 9] {
            assert!(tree.add(&ctx, i));
        }
        assert!(tree.remove(&ctx, 5));
        assert!(!tree.contains(&ctx, 5));
        // Re-adding a logically deleted key flips the present bit back.
        assert!(tree.add(&ctx, 5));
        assert!(tree.contains(&ctx, 5));
        assert_invariants(&tree);
    }
}
