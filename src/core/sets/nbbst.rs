//! Lock-free external binary search tree.
//!
//! Internal nodes route; leaves store keys. Every internal node carries a
//! single update word: a descriptor pointer tagged in its two low bits
//! with CLEAN, IFLAG (insert pending), DFLAG (delete pending at the
//! grandparent) or MARK (this node is being spliced out). Writers
//! announce an operation by CAS-ing a flagged descriptor into the word;
//! any thread that observes a non-clean word completes the announced
//! operation before proceeding, which is what makes the structure
//! lock-free.
//!
//! Two sentinel internal nodes sit above the user keys, so every
//! deletable leaf has both a parent and a grandparent. The sentinel keys
//! are `i32::MIN` / `i32::MAX`; those two values cannot be stored.
//!
//! Replaced leaves, spliced internal nodes and displaced descriptors are
//! retired to hazard managers; searches keep the grandparent, parent and
//! leaf published while they walk.
//!
//! # Safety
//! Node and descriptor memory is type-stable: retired objects are
//! recycled in place by the hazard managers and never returned to the
//! allocator before the tree drops, and every shared field is atomic, so
//! a load through a stale pointer is always memory-safe. A pointer is
//! trusted beyond such probing loads only once it has been published in
//! a hazard slot and revalidated: searches revalidate each node against
//! the child link it was read from, and the helping routines revalidate
//! a descriptor's nodes against the update word that announces the
//! operation. The latter check is conclusive because the descriptor is
//! itself hazard-published — its bit pattern cannot be recycled into any
//! other update word — so a matching tagged word identifies the genuine
//! node, proves the operation is still in flight, and thereby pins every
//! node the descriptor names until the announcement is cleared.

#![allow(unsafe_code)]
#![deny(unsafe_op_in_unsafe_fn)]

use crate::core::reclaim::HazardManager;
use crate::core::sets::{ConcurrentSet, KeyHash};
use crate::core::thread::ThreadContext;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicUsize, Ordering};

const CLEAN: usize = 0;
const DFLAG: usize = 1;
const IFLAG: usize = 2;
const MARK: usize = 3;
const TAG_MASK: usize = 3;

// The tag lives in the low pointer bits, so descriptors must be at least
// 4-byte aligned.
const _: () = assert!(std::mem::align_of::<OpDesc>() >= 4);

fn pack(desc: *mut OpDesc, tag: usize) -> usize {
    debug_assert_eq!(desc as usize & TAG_MASK, 0);
    desc as usize | tag
}

fn tag_of(word: usize) -> usize {
    word & TAG_MASK
}

fn desc_of(word: usize) -> *mut OpDesc {
    (word & !TAG_MASK) as *mut OpDesc
}

pub struct Node {
    internal: AtomicBool,
    key: AtomicI32,
    update: AtomicUsize,
    left: AtomicPtr<Node>,
    right: AtomicPtr<Node>,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            internal: AtomicBool::new(false),
            key: AtomicI32::new(0),
            update: AtomicUsize::new(pack(ptr::null_mut(), CLEAN)),
            left: AtomicPtr::new(ptr::null_mut()),
            right: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// One descriptor type for both operations so a single hazard manager
/// can recycle them; `is_delete` selects which fields are meaningful.
pub struct OpDesc {
    is_delete: AtomicBool,
    gp: AtomicPtr<Node>,
    p: AtomicPtr<Node>,
    l: AtomicPtr<Node>,
    new_internal: AtomicPtr<Node>,
    p_update: AtomicUsize,
}

impl Default for OpDesc {
    fn default() -> Self {
        Self {
            is_delete: AtomicBool::new(false),
            gp: AtomicPtr::new(ptr::null_mut()),
            p: AtomicPtr::new(ptr::null_mut()),
            l: AtomicPtr::new(ptr::null_mut()),
            new_internal: AtomicPtr::new(ptr::null_mut()),
            p_update: AtomicUsize::new(0),
        }
    }
}

struct SearchResult {
    gp: *mut Node,
    p: *mut Node,
    l: *mut Node,
    gp_update: usize,
    p_update: usize,
}

/// Concurrent ordered set backed by the non-blocking external BST.
pub struct NonBlockingBst<T> {
    root: *mut Node,
    nodes: HazardManager<Node>,
    descs: HazardManager<OpDesc>,
    _marker: PhantomData<fn(T) -> T>,
}

// SAFETY: all shared state is atomic and reclaimed through the hazard
// protocol; `T` is never stored.
unsafe impl<T> Send for NonBlockingBst<T> {}
unsafe impl<T> Sync for NonBlockingBst<T> {}

const NODE_HAZARDS: usize = 6;
const DESC_HAZARDS: usize = 2;
const PREFILL: usize = 50;

/// The search walk rotates the grandparent, parent and leaf through the
/// first three node slots; the helpers pin a descriptor's nodes in the
/// band above, so helping never steals protection from the search state
/// of the same thread.
const SEARCH_SLOTS: usize = 3;
const HELP_GP_SLOT: usize = 3;
const HELP_P_SLOT: usize = 4;
const HELP_CHILD_SLOT: usize = 5;

impl<T: KeyHash> NonBlockingBst<T> {
    pub fn new(threads: usize) -> Self {
        let nodes = HazardManager::new(threads, NODE_HAZARDS, PREFILL);
        let descs = HazardManager::new(threads, DESC_HAZARDS, PREFILL);

        let leaf = |key: i32| -> *mut Node {
            Box::into_raw(Box::new(Node {
                key: AtomicI32::new(key),
                ..Node::default()
            }))
        };
        let internal = |key: i32, left: *mut Node, right: *mut Node| -> *mut Node {
            Box::into_raw(Box::new(Node {
                internal: AtomicBool::new(true),
                key: AtomicI32::new(key),
                left: AtomicPtr::new(left),
                right: AtomicPtr::new(right),
                ..Node::default()
            }))
        };

        let inner = internal(i32::MAX, leaf(i32::MIN), leaf(i32::MAX));
        let root = internal(i32::MAX, inner, leaf(i32::MAX));

        Self {
            root,
            nodes,
            descs,
            _marker: PhantomData,
        }
    }

    fn init_leaf(&self, ctx: &ThreadContext, key: i32) -> *mut Node {
        let node = self.nodes.acquire(ctx);
        // SAFETY: `acquire` hands out nodes no thread holds a hazard on.
        let n = unsafe { &*node };
        n.internal.store(false, Ordering::Relaxed);
        n.key.store(key, Ordering::Relaxed);
        n.update.store(pack(ptr::null_mut(), CLEAN), Ordering::Relaxed);
        n.left.store(ptr::null_mut(), Ordering::Relaxed);
        n.right.store(ptr::null_mut(), Ordering::Release);
        node
    }

    fn init_internal(
        &self,
        ctx: &ThreadContext,
        key: i32,
        left: *mut Node,
        right: *mut Node,
    ) -> *mut Node {
        let node = self.nodes.acquire(ctx);
        // SAFETY: as in `init_leaf`.
        let n = unsafe { &*node };
        n.internal.store(true, Ordering::Relaxed);
        n.key.store(key, Ordering::Relaxed);
        n.update.store(pack(ptr::null_mut(), CLEAN), Ordering::Relaxed);
        n.left.store(left, Ordering::Relaxed);
        n.right.store(right, Ordering::Release);
        node
    }

    /// Walks from the root to the leaf for `key`, publishing the
    /// grandparent, parent and leaf in rotating hazard slots. A link
    /// revalidation failure after publishing restarts from the root.
    fn search(&self, ctx: &ThreadContext, key: i32) -> SearchResult {
        'restart: loop {
            let mut gp: *mut Node = ptr::null_mut();
            let mut p: *mut Node = ptr::null_mut();
            let mut gp_update = pack(ptr::null_mut(), CLEAN);
            let mut p_update = pack(ptr::null_mut(), CLEAN);

            let mut l = self.root;
            let mut slot = 0;
            self.nodes.publish(ctx, slot, l);

            loop {
                // SAFETY: `l` is hazard-published and was revalidated as
                // linked (or is the never-retired root).
                let l_ref = unsafe { &*l };
                if !l_ref.internal.load(Ordering::Acquire) {
                    return SearchResult {
                        gp,
                        p,
                        l,
                        gp_update,
                        p_update,
                    };
                }

                gp = p;
                p = l;
                gp_update = p_update;
                p_update = l_ref.update.load(Ordering::SeqCst);

                let go_left = key < l_ref.key.load(Ordering::Relaxed);
                let link = if go_left { &l_ref.left } else { &l_ref.right };
                let child = link.load(Ordering::Acquire);

                // The slot that held the discarded great-grandparent is
                // free again; the three live nodes keep their slots.
                slot = (slot + 1) % SEARCH_SLOTS;
                self.nodes.publish(ctx, slot, child);
                if link.load(Ordering::SeqCst) != child {
                    continue 'restart;
                }

                l = child;
            }
        }
    }

    fn cas_update(
        word: &AtomicUsize,
        old_desc: *mut OpDesc,
        old_tag: usize,
        new_desc: *mut OpDesc,
        new_tag: usize,
    ) -> bool {
        word.compare_exchange(
            pack(old_desc, old_tag),
            pack(new_desc, new_tag),
            Ordering::SeqCst,
            Ordering::SeqCst,
        )
        .is_ok()
    }

    /// Swings the correct child pointer of `parent` from `old` to `new`.
    /// Callers have published and revalidated both `parent` and `new`;
    /// `old` is only an expected value and is never dereferenced.
    fn cas_child(parent: &Node, old: *mut Node, new: *mut Node) {
        // SAFETY: `new` is pinned by the caller's hazard slot.
        let new_key = unsafe { &*new }.key.load(Ordering::Relaxed);
        let link = if new_key < parent.key.load(Ordering::Relaxed) {
            &parent.left
        } else {
            &parent.right
        };
        let _ = link.compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Completes the operation announced by `word`, which was read from
    /// `source`. The descriptor is published and the word re-read before
    /// it is trusted; a nested help (from inside a delete) does not help
    /// further, which bounds the descriptor slots a thread can occupy.
    fn help(&self, ctx: &ThreadContext, word: usize, source: &AtomicUsize, desc_slot: usize) {
        let desc = desc_of(word);
        if tag_of(word) == CLEAN || desc.is_null() {
            return;
        }

        self.descs.publish(ctx, desc_slot, desc);
        if source.load(Ordering::SeqCst) != word {
            self.descs.release(ctx, desc_slot);
            return;
        }

        // SAFETY: the descriptor is hazard-published and still announced.
        let op = unsafe { &*desc };
        match tag_of(word) {
            IFLAG => self.help_insert(ctx, op, desc),
            MARK => self.help_marked(ctx, op, desc),
            DFLAG => {
                let _ = self.help_delete(ctx, op, desc, desc_slot == 1);
            }
            _ => {}
        }
        self.descs.release(ctx, desc_slot);
    }

    /// Applies an announced insert: swing the parent's child pointer from
    /// the old leaf to the new internal node, then clear the flag.
    fn help_insert(&self, ctx: &ThreadContext, op: &OpDesc, desc: *mut OpDesc) {
        let p = op.p.load(Ordering::Acquire);
        let l = op.l.load(Ordering::Acquire);
        let new_internal = op.new_internal.load(Ordering::Acquire);

        self.nodes.publish(ctx, HELP_P_SLOT, p);
        self.nodes.publish(ctx, HELP_CHILD_SLOT, new_internal);

        // SAFETY: the probing load is sound on type-stable, atomic node
        // memory even if `p` was recycled (module note). The match below
        // proves `p` is the announced parent and the insert has not hit
        // its IFLAG -> CLEAN transition, before which neither the old
        // leaf nor `new_internal` can be retired, so the publishes above
        // pin everything this function touches.
        let p_ref = unsafe { &*p };
        if p_ref.update.load(Ordering::SeqCst) != pack(desc, IFLAG) {
            // Another helper already finished this insert.
            return;
        }

        // `l` is only compared against inside the child CAS.
        Self::cas_child(p_ref, l, new_internal);
        let _ = Self::cas_update(&p_ref.update, desc, IFLAG, desc, CLEAN);
    }

    fn help_delete(
        &self,
        ctx: &ThreadContext,
        op: &OpDesc,
        desc: *mut OpDesc,
        nested: bool,
    ) -> bool {
        let gp = op.gp.load(Ordering::Acquire);
        let p = op.p.load(Ordering::Acquire);

        self.nodes.publish(ctx, HELP_GP_SLOT, gp);
        self.nodes.publish(ctx, HELP_P_SLOT, p);

        // SAFETY: probing loads on type-stable, atomic node memory
        // (module note); a word matching the hazard-protected `desc`
        // proves identity. While the grandparent's word holds
        // (desc, DFLAG) the delete is announced: marking either node for
        // some other operation needs a clean-tagged snapshot, so neither
        // can be spliced or retired, and the publishes above pin them.
        let gp_ref = unsafe { &*gp };
        let p_ref = unsafe { &*p };

        if gp_ref.update.load(Ordering::SeqCst) != pack(desc, DFLAG) {
            // The operation already finished. It succeeded exactly when
            // its MARK landed; a landed MARK is permanent.
            return p_ref.update.load(Ordering::SeqCst) == pack(desc, MARK);
        }

        let before = p_ref.update.load(Ordering::SeqCst);
        let expected = op.p_update.load(Ordering::Acquire);

        let marked = Self::cas_update(
            &p_ref.update,
            desc_of(expected),
            tag_of(expected),
            desc,
            MARK,
        ) || p_ref.update.load(Ordering::SeqCst) == pack(desc, MARK);

        if marked {
            self.help_marked(ctx, op, desc);
            true
        } else {
            if !nested {
                self.help(ctx, before, &p_ref.update, 1);
            }
            // Back out: the delete failed to mark its parent. The nested
            // help reused the helping band, so re-pin the grandparent and
            // re-check the announcement before touching its word.
            self.nodes.publish(ctx, HELP_GP_SLOT, gp);
            if gp_ref.update.load(Ordering::SeqCst) == pack(desc, DFLAG) {
                let _ = Self::cas_update(&gp_ref.update, desc, DFLAG, desc, CLEAN);
            }
            false
        }
    }

    /// Splices the marked parent out from under the grandparent, then
    /// clears the DFLAG.
    fn help_marked(&self, ctx: &ThreadContext, op: &OpDesc, desc: *mut OpDesc) {
        let gp = op.gp.load(Ordering::Acquire);
        let p = op.p.load(Ordering::Acquire);
        let l = op.l.load(Ordering::Acquire);

        self.nodes.publish(ctx, HELP_GP_SLOT, gp);
        self.nodes.publish(ctx, HELP_P_SLOT, p);

        // SAFETY: probing load as in `help_delete`; the match pins `gp`
        // and `p` for the rest of the splice. A stale MARK observer whose
        // operation long since completed fails this check and backs off
        // without touching anything.
        let gp_ref = unsafe { &*gp };
        if gp_ref.update.load(Ordering::SeqCst) != pack(desc, DFLAG) {
            return;
        }

        // SAFETY: pinned by the published slot and the check above; `p`
        // is marked, so its children are frozen and every helper reads
        // the same survivor.
        let p_ref = unsafe { &*p };
        let other = if p_ref.right.load(Ordering::Acquire) == l {
            p_ref.left.load(Ordering::Acquire)
        } else {
            p_ref.right.load(Ordering::Acquire)
        };

        // The survivor stays linked under the marked `p` until the DFLAG
        // clears, so re-checking the announcement after publishing pins
        // it as well.
        self.nodes.publish(ctx, HELP_CHILD_SLOT, other);
        if gp_ref.update.load(Ordering::SeqCst) != pack(desc, DFLAG) {
            return;
        }

        Self::cas_child(gp_ref, p, other);
        let _ = Self::cas_update(&gp_ref.update, desc, DFLAG, desc, CLEAN);
    }

    fn do_contains(&self, ctx: &ThreadContext, key: i32) -> bool {
        let result = self.search(ctx, key);
        // SAFETY: the leaf is hazard-published by the search.
        let found = unsafe { &*result.l }.key.load(Ordering::Relaxed) == key;
        self.nodes.release_all(ctx);
        found
    }

    fn do_add(&self, ctx: &ThreadContext, key: i32) -> bool {
        loop {
            let search = self.search(ctx, key);
            let p = search.p;
            let l = search.l;

            // SAFETY: hazard-published by the search.
            if unsafe { &*l }.key.load(Ordering::Relaxed) == key {
                self.nodes.release_all(ctx);
                return false;
            }

            if tag_of(search.p_update) != CLEAN {
                // SAFETY: p is hazard-published.
                self.help(ctx, search.p_update, unsafe { &(*p).update }, 0);
                continue;
            }

            // SAFETY: as above.
            let l_key = unsafe { &*l }.key.load(Ordering::Relaxed);
            let new_leaf = self.init_leaf(ctx, key);
            let new_sibling = self.init_leaf(ctx, l_key);
            let (left, right) = if key <= l_key {
                (new_leaf, new_sibling)
            } else {
                (new_sibling, new_leaf)
            };
            let new_internal = self.init_internal(ctx, key.max(l_key), left, right);

            let desc = self.descs.acquire(ctx);
            // SAFETY: `acquire` hands out descriptors without hazards.
            let op = unsafe { &*desc };
            op.is_delete.store(false, Ordering::Relaxed);
            op.p.store(p, Ordering::Relaxed);
            op.l.store(l, Ordering::Relaxed);
            op.new_internal.store(new_internal, Ordering::Release);

            // SAFETY: p is hazard-published.
            let p_update_word = unsafe { &(*p).update };
            let before = p_update_word.load(Ordering::SeqCst);
            if Self::cas_update(
                p_update_word,
                desc_of(search.p_update),
                tag_of(search.p_update),
                desc,
                IFLAG,
            ) {
                // The descriptor we displaced can never be announced
                // again; it is ours to retire.
                let displaced = desc_of(search.p_update);
                if displaced != desc {
                    self.descs.retire(ctx, displaced);
                }

                self.help_insert(ctx, op, desc);
                self.nodes.retire(ctx, l);
                self.nodes.release_all(ctx);
                return true;
            }

            // Lost the race: the freshly built nodes and descriptor were
            // never visible, so they go straight back.
            self.nodes.retire(ctx, new_leaf);
            self.nodes.retire(ctx, new_sibling);
            self.nodes.retire(ctx, new_internal);
            self.descs.retire(ctx, desc);
            self.help(ctx, before, p_update_word, 0);
        }
    }

    fn do_remove(&self, ctx: &ThreadContext, key: i32) -> bool {
        loop {
            let search = self.search(ctx, key);
            let gp = search.gp;
            let p = search.p;
            let l = search.l;

            // SAFETY: hazard-published by the search.
            if unsafe { &*l }.key.load(Ordering::Relaxed) != key {
                self.nodes.release_all(ctx);
                return false;
            }

            if gp.is_null() {
                // Only the sentinel leaves hang this high.
                self.nodes.release_all(ctx);
                return false;
            }

            // SAFETY: gp and p are hazard-published.
            let gp_update_word = unsafe { &(*gp).update };
            let p_update_word = unsafe { &(*p).update };

            if tag_of(search.gp_update) != CLEAN {
                self.help(ctx, search.gp_update, gp_update_word, 0);
                continue;
            }
            if tag_of(search.p_update) != CLEAN {
                self.help(ctx, search.p_update, p_update_word, 0);
                continue;
            }

            let desc = self.descs.acquire(ctx);
            // SAFETY: `acquire` hands out descriptors without hazards.
            let op = unsafe { &*desc };
            op.is_delete.store(true, Ordering::Relaxed);
            op.gp.store(gp, Ordering::Relaxed);
            op.p.store(p, Ordering::Relaxed);
            op.l.store(l, Ordering::Relaxed);
            op.p_update.store(search.p_update, Ordering::Release);

            let before = gp_update_word.load(Ordering::SeqCst);
            if Self::cas_update(
                gp_update_word,
                desc_of(search.gp_update),
                tag_of(search.gp_update),
                desc,
                DFLAG,
            ) {
                let displaced = desc_of(search.gp_update);
                if displaced != desc {
                    self.descs.retire(ctx, displaced);
                }

                if self.help_delete(ctx, op, desc, false) {
                    // The operation owner retires the spliced pair.
                    self.nodes.retire(ctx, p);
                    self.nodes.retire(ctx, l);
                    self.nodes.release_all(ctx);
                    return true;
                }
                // Backed out; the descriptor stays referenced by gp's
                // update word until another operation displaces it.
            } else {
                self.descs.retire(ctx, desc);
                self.help(ctx, before, gp_update_word, 0);
            }
        }
    }
}

impl<T: KeyHash> ConcurrentSet<T> for NonBlockingBst<T> {
    fn add(&self, ctx: &ThreadContext, value: T) -> bool {
        self.do_add(ctx, value.hash())
    }

    fn remove(&self, ctx: &ThreadContext, value: T) -> bool {
        self.do_remove(ctx, value.hash())
    }

    fn contains(&self, ctx: &ThreadContext, value: T) -> bool {
        self.do_contains(ctx, value.hash())
    }
}

impl<T> Drop for NonBlockingBst<T> {
    fn drop(&mut self) {
        use std::collections::HashSet;

        let mut node_set: HashSet<*mut Node> = self.nodes.take_all_queued().into_iter().collect();
        let mut desc_set: HashSet<*mut OpDesc> = self.descs.take_all_queued().into_iter().collect();

        let mut stack = vec![self.root];
        while let Some(node) = stack.pop() {
            if !node_set.insert(node) {
                continue;
            }
            // SAFETY: exclusive access during drop; linked and queued
            // nodes are deduplicated through the set.
            let n = unsafe { &*node };
            if n.internal.load(Ordering::Relaxed) {
                desc_set.insert(desc_of(n.update.load(Ordering::Relaxed)));
                stack.push(n.left.load(Ordering::Relaxed));
                stack.push(n.right.load(Ordering::Relaxed));
            }
        }

        for node in node_set {
            if !node.is_null() {
                // SAFETY: collected exactly once above.
                drop(unsafe { Box::from_raw(node) });
            }
        }
        for desc in desc_set {
            if !desc.is_null() {
                // SAFETY: descriptors are either queued or referenced by
                // exactly the update words walked above.
                drop(unsafe { Box::from_raw(desc) });
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
        // SAFETY: quiescent single-threaded walk.
        let n = unsafe { &*node };
        let key = i64::from(n.key.load(Ordering::Relaxed));
        if !n.internal.load(Ordering::Relaxed) {
            assert!(min <= key && key <= max, "leaf key out of range");
            return 1;
        }
        assert_eq!(
            tag_of(n.update.load(Ordering::Relaxed)),
            CLEAN,
            "update word not clean at quiescence"
        );
        // External BST: left keys are strictly below the routing key.
        check_subtree(n.left.load(Ordering::Relaxed), min, key - 1)
            + check_subtree(n.right.load(Ordering::Relaxed), key, max)
    }

    #[test]
    fn leaves_stay_ordered_and_words_clean() {
        let registry = ThreadRegistry::new(1);
        let ctx = registry.register().unwrap();
        let tree: NonBlockingBst<i32> = NonBlockingBst::new(1);

        for key in [13, 5, 21, 1, 8, 34, 2] {
            assert!(tree.add(&ctx, key));
            assert!(!tree.add(&ctx, key));
        }
        for key in [5, 34, 1] {
            assert!(tree.remove(&ctx, key));
            assert!(!tree.contains(&ctx, key));
        }
        for key in [13, 21, 8, 2] {
            assert!(tree.contains(&ctx, key));
        }

        check_subtree(tree.root, i64::MIN, i64::MAX);
    }

    #[test]
    fn empties_back_to_the_sentinel_shape() {
        let registry = ThreadRegistry::new(1);
        let ctx = registry.register().unwrap();
        let tree: NonBlockingBst<i32> = NonBlockingBst::new(1);

        for key in 0..200 {
            assert!(tree.add(&ctx, key));
        }
        for key in 0..200 {
            assert!(tree.remove(&ctx, key));
        }
        for key in 0..200 {
            assert!(!tree.contains(&ctx, key));
        }
        assert_eq!(check_subtree(tree.root, i64::MIN, i64::MAX), 3);
    }
}
