//! Lock-free multiway search tree.
//!
//! A stack of linked levels of B-tree-style nodes. Each node is nothing
//! but a pointer to an immutable Contents block (sorted keys, child
//! pointers for non-leaf levels, and a `link` to the right sibling at the
//! same level); every mutation builds a fresh Contents and swings the
//! node's pointer with a single CAS. Deleted keys leave nodes behind with
//! shrinking Contents; searches skip the empties by following `link`
//! ("push right") and tidy stale child pointers as they pass
//! (good-samaritan cleanup). Insertions pick a geometric random height;
//! the common case is a one-CAS insert at the leaf level, taller inserts
//! split one node per level and patch the level above.
//!
//! # Safety
//! Node and HeadNode objects expose only an atomic pointer (plus plain
//! fields read behind validation), and no object of any class is handed
//! back to the allocator before the tree drops, so pointer loads are
//! always safe. Contents, Keys and Children blocks are immutable while
//! reachable: they are dereferenced only under a published hazard that
//! was revalidated against the owning node's Contents pointer, which
//! proves the block had not been displaced (and therefore could not have
//! been recycled) when the hazard took effect. Working copies of their
//! fields travel in `Snapshot` values so helpers never re-dereference a
//! block whose protection might have lapsed.

#![allow(unsafe_code)]
#![deny(unsafe_op_in_unsafe_fn)]

use crate::core::reclaim::HazardManager;
use crate::core::sets::{ConcurrentSet, KeyHash};
use crate::core::thread::ThreadContext;
use crossbeam::utils::CachePadded;
use rand::RngCore;
use std::cell::UnsafeCell;
use std::cmp::Ordering as KeyOrdering;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

/// First hazard slot used for per-level saved search results; slots
/// `0..=5` belong to the descent and the cleanup helpers.
const FIRST: usize = 6;
/// Maximum insertion height above the leaf level.
const MAX_HEIGHT: usize = 8;
const SLOTS: usize = FIRST + MAX_HEIGHT + 1;

/// Dedicated slots for `push_right`, so its walks never clobber the
/// protection the cleanup helpers keep on slots 0..=4.
const PUSH_RIGHT_SLOT: usize = 5;

const AVG_LENGTH: u32 = 32;
const AVG_LENGTH_MINUS_ONE: u32 = 31;
const LOG_AVG_LENGTH: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyFlag {
    Empty,
    Normal,
    Inf,
}

/// A routing key: a plain value, the `+inf` sentinel that terminates the
/// rightmost node of each level, or the empty marker used as a "no
/// barrier" argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Key {
    flag: KeyFlag,
    key: i32,
}

const EMPTY_KEY: Key = Key {
    flag: KeyFlag::Empty,
    key: 0,
};

fn normal_key(key: i32) -> Key {
    Key {
        flag: KeyFlag::Normal,
        key,
    }
}

fn compare(a: Key, b: Key) -> KeyOrdering {
    if a.flag == KeyFlag::Inf {
        return KeyOrdering::Greater;
    }
    if b.flag == KeyFlag::Inf {
        return KeyOrdering::Less;
    }
    a.key.cmp(&b.key)
}

#[derive(Default)]
pub struct Keys {
    items: Vec<Key>,
}

#[derive(Default)]
pub struct Children {
    slots: Vec<*mut Node>,
}

/// Immutable once a node's pointer has been CAS-ed onto it.
pub struct Contents {
    items: *mut Keys,
    children: *mut Children,
    link: *mut Node,
}

impl Default for Contents {
    fn default() -> Self {
        Self {
            items: ptr::null_mut(),
            children: ptr::null_mut(),
            link: ptr::null_mut(),
        }
    }
}

pub struct Node {
    contents: AtomicPtr<Contents>,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            contents: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// Names the root node of the top level and how many levels hang below.
pub struct HeadNode {
    node: *mut Node,
    height: usize,
}

impl Default for HeadNode {
    fn default() -> Self {
        Self {
            node: ptr::null_mut(),
            height: 0,
        }
    }
}

/// A validated view of one node: the Contents pointer that was current
/// when the hazard took effect, plus its fields, so later steps never
/// have to reach back through the (possibly displaced) block.
#[derive(Clone, Copy)]
struct Snapshot {
    node: *mut Node,
    contents: *mut Contents,
    items: *mut Keys,
    children: *mut Children,
    link: *mut Node,
}

/// One level of a saved search path.
#[derive(Clone, Copy)]
struct Search {
    snap: Snapshot,
    index: i32,
}

enum LeafInsert {
    Inserted,
    Duplicate,
    Retry,
}

/// Binary search over a sorted key block. Non-negative: exact index.
/// Negative `-i - 1`: the key belongs at position `i`; when that equals
/// the block length the key is beyond this node and the search must
/// follow `link`.
fn search_keys(keys: &Keys, key: Key) -> i32 {
    let mut low: i32 = 0;
    let mut high: i32 = keys.items.len() as i32 - 1;

    if low > high {
        return -1;
    }
    if keys.items[high as usize].flag == KeyFlag::Inf {
        high -= 1;
    }

    while low <= high {
        let mid = (low + high) >> 1;
        match compare(key, keys.items[mid as usize]) {
            KeyOrdering::Greater => low = mid + 1,
            KeyOrdering::Less => high = mid - 1,
            KeyOrdering::Equal => return mid,
        }
    }
    -(low + 1)
}

/// Same as [`search_keys`] but starts probing at `hint`, the position the
/// key had in a previous incarnation of the block.
fn search_keys_with_hint(keys: &Keys, key: Key, hint: i32) -> i32 {
    let mut low: i32 = 0;
    let mut high: i32 = keys.items.len() as i32 - 1;
    let mut mid = hint;

    if low > high {
        return -1;
    }
    if keys.items[high as usize].flag == KeyFlag::Inf {
        high -= 1;
    }
    if mid > high {
        mid = (low + high) >> 1;
    }

    while low <= high {
        match compare(key, keys.items[mid as usize]) {
            KeyOrdering::Greater => low = mid + 1,
            KeyOrdering::Less => high = mid - 1,
            KeyOrdering::Equal => return mid,
        }
        mid = (low + high) >> 1;
    }
    -(low + 1)
}

/// Concurrent ordered set backed by the lock-free multiway search tree.
pub struct MultiwaySearchTree<T> {
    root: AtomicPtr<HeadNode>,
    heads: HazardManager<HeadNode>,
    nodes: HazardManager<Node>,
    contents: HazardManager<Contents>,
    keys: HazardManager<Keys>,
    children: HazardManager<Children>,
    seeds: Box<[CachePadded<AtomicU32>]>,
    trash: Box<[CachePadded<UnsafeCell<Vec<*mut Node>>>]>,
    _marker: PhantomData<fn(T) -> T>,
}

// SAFETY: shared state is reached through atomics under the hazard
// protocol; the seed and trash lanes are single-owner by thread id.
unsafe impl<T> Send for MultiwaySearchTree<T> {}
unsafe impl<T> Sync for MultiwaySearchTree<T> {}

const PREFILL: usize = 50;

impl<T: KeyHash> MultiwaySearchTree<T> {
    pub fn new(threads: usize) -> Self {
        let mut rng = rand::thread_rng();
        let tree = Self {
            root: AtomicPtr::new(ptr::null_mut()),
            heads: HazardManager::new(threads, 1, 1),
            nodes: HazardManager::new(threads, SLOTS, PREFILL),
            contents: HazardManager::new(threads, SLOTS, PREFILL),
            keys: HazardManager::new(threads, SLOTS, PREFILL),
            children: HazardManager::new(threads, SLOTS, PREFILL),
            seeds: (0..threads)
                .map(|_| CachePadded::new(AtomicU32::new(rng.next_u32() | 0x0100)))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            trash: (0..threads)
                .map(|_| CachePadded::new(UnsafeCell::new(Vec::new())))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            _marker: PhantomData,
        };

        let keys = Box::into_raw(Box::new(Keys {
            items: vec![Key {
                flag: KeyFlag::Inf,
                key: 0,
            }],
        }));
        let contents = Box::into_raw(Box::new(Contents {
            items: keys,
            children: ptr::null_mut(),
            link: ptr::null_mut(),
        }));
        let node = Box::into_raw(Box::new(Node {
            contents: AtomicPtr::new(contents),
        }));
        let head = Box::into_raw(Box::new(HeadNode { node, height: 0 }));
        tree.root.store(head, Ordering::Release);
        tree
    }

    // --- allocation helpers ------------------------------------------------

    fn new_node(&self, ctx: &ThreadContext, contents: *mut Contents) -> *mut Node {
        let node = self.nodes.acquire(ctx);
        // SAFETY: `acquire` hands out objects no thread holds a hazard on.
        unsafe { &*node }.contents.store(contents, Ordering::Release);
        node
    }

    fn new_contents(
        &self,
        ctx: &ThreadContext,
        items: *mut Keys,
        children: *mut Children,
        link: *mut Node,
    ) -> *mut Contents {
        let contents = self.contents.acquire(ctx);
        // SAFETY: as in `new_node`; the block is invisible until CAS-ed in.
        let c = unsafe { &mut *contents };
        c.items = items;
        c.children = children;
        c.link = link;
        contents
    }

    fn new_head(&self, ctx: &ThreadContext, node: *mut Node, height: usize) -> *mut HeadNode {
        let head = self.heads.acquire(ctx);
        // SAFETY: as in `new_node`.
        let h = unsafe { &mut *head };
        h.node = node;
        h.height = height;
        head
    }

    fn build_keys(
        &self,
        ctx: &ThreadContext,
        fill: impl FnOnce(&mut Vec<Key>),
    ) -> *mut Keys {
        let keys = self.keys.acquire(ctx);
        // SAFETY: as in `new_node`.
        let k = unsafe { &mut *keys };
        k.items.clear();
        fill(&mut k.items);
        keys
    }

    fn build_children(
        &self,
        ctx: &ThreadContext,
        fill: impl FnOnce(&mut Vec<*mut Node>),
    ) -> *mut Children {
        let children = self.children.acquire(ctx);
        // SAFETY: as in `new_node`.
        let c = unsafe { &mut *children };
        c.slots.clear();
        fill(&mut c.slots);
        children
    }

    // --- hazard protocol ---------------------------------------------------

    /// Publishes and validates the current root head.
    fn protect_root(&self, ctx: &ThreadContext) -> (*mut HeadNode, *mut Node, usize) {
        loop {
            let head = self.root.load(Ordering::Acquire);
            self.heads.publish(ctx, 0, head);
            if self.root.load(Ordering::SeqCst) != head {
                continue;
            }
            // SAFETY: hazard-published and revalidated as current.
            let h = unsafe { &*head };
            return (head, h.node, h.height);
        }
    }

    /// Publishes `node`'s current Contents (and its key/child blocks) in
    /// `slot` of the respective managers, revalidating against the node
    /// after each publication so a displaced block is never trusted.
    fn protect(&self, ctx: &ThreadContext, node: *mut Node, slot: usize) -> Snapshot {
        // SAFETY: Node objects are never freed before drop.
        let node_ref = unsafe { &*node };
        loop {
            let contents = node_ref.contents.load(Ordering::Acquire);
            self.contents.publish(ctx, slot, contents);
            if node_ref.contents.load(Ordering::SeqCst) != contents {
                continue;
            }

            // SAFETY: validated above, so the block was reachable (hence
            // not recycled) when the hazard took effect; it is immutable.
            let c = unsafe { &*contents };
            let items = c.items;
            let children = c.children;
            let link = c.link;

            self.keys.publish(ctx, slot, items);
            self.children.publish(ctx, slot, children);
            if node_ref.contents.load(Ordering::SeqCst) != contents {
                continue;
            }

            return Snapshot {
                node,
                contents,
                items,
                children,
                link,
            };
        }
    }

    /// Re-publishes a snapshot's blocks in `slot`. Only valid while the
    /// snapshot is still protected by some other slot.
    fn republish(&self, ctx: &ThreadContext, snap: &Snapshot, slot: usize) {
        self.nodes.publish(ctx, slot, snap.node);
        self.contents.publish(ctx, slot, snap.contents);
        self.keys.publish(ctx, slot, snap.items);
        self.children.publish(ctx, slot, snap.children);
    }

    fn release_everything(&self, ctx: &ThreadContext) {
        self.heads.release_all(ctx);
        self.nodes.release_all(ctx);
        self.contents.release_all(ctx);
        self.keys.release_all(ctx);
        self.children.release_all(ctx);
    }

    fn cas_contents(&self, node: *mut Node, old: *mut Contents, new: *mut Contents) -> bool {
        // SAFETY: Node objects are never freed before drop.
        unsafe { &*node }
            .contents
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Retires the whole displaced triple of a successful Contents swap.
    fn retire_displaced(&self, ctx: &ThreadContext, snap: &Snapshot) {
        self.contents.retire(ctx, snap.contents);
        self.keys.retire(ctx, snap.items);
        self.children.retire(ctx, snap.children);
    }

    // SAFETY-sensitive readers; all go through validated snapshots.

    fn items_len(snap: &Snapshot) -> i32 {
        // SAFETY: snapshot blocks are protected and immutable.
        unsafe { (*snap.items).items.len() as i32 }
    }

    fn item_at(snap: &Snapshot, index: i32) -> Key {
        // SAFETY: as in `items_len`.
        unsafe { (&(*snap.items).items)[index as usize] }
    }

    fn child_at(snap: &Snapshot, index: i32) -> *mut Node {
        // SAFETY: as in `items_len`.
        unsafe { (&(*snap.children).slots)[index as usize] }
    }

    fn children_len(snap: &Snapshot) -> i32 {
        // SAFETY: as in `items_len`.
        unsafe { (*snap.children).slots.len() as i32 }
    }

    fn search_snap(snap: &Snapshot, key: Key) -> i32 {
        // SAFETY: as in `items_len`.
        search_keys(unsafe { &*snap.items }, key)
    }

    // --- random level ------------------------------------------------------

    /// Geometric height with mean `1 / AVG_LENGTH`; ~97% of inserts get
    /// height zero and stay a single leaf-level CAS.
    fn random_level(&self, ctx: &ThreadContext) -> usize {
        let seed = &self.seeds[ctx.id()];
        let step = |s: &AtomicU32| {
            let mut x = s.load(Ordering::Relaxed);
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            s.store(x, Ordering::Relaxed);
            x
        };

        let mut x = step(seed);
        let mut level: u32 = 1;
        while x & AVG_LENGTH_MINUS_ONE == 0 {
            if level % 6 == 0 {
                x = step(seed);
            } else {
                x >>= LOG_AVG_LENGTH;
            }
            level += 1;
        }
        ((level - 1) as usize).min(MAX_HEIGHT)
    }

    // --- push right & cleanup ----------------------------------------------

    /// Follows `link` pointers rightward past empty nodes and past nodes
    /// whose keys are all at or below `left_barrier`. Nodes skipped as
    /// empty can never be reached usefully again; they go on the caller's
    /// trash list to be freed at teardown.
    fn push_right(&self, ctx: &ThreadContext, mut node: *mut Node, left_barrier: Key) -> *mut Node {
        loop {
            self.nodes.publish(ctx, PUSH_RIGHT_SLOT, node);
            let snap = self.protect(ctx, node, PUSH_RIGHT_SLOT);
            let length = Self::items_len(&snap);

            if length == 0 {
                // SAFETY: the trash lane belongs to the calling thread.
                unsafe { &mut *self.trash[ctx.id()].get() }.push(node);
                node = snap.link;
            } else if left_barrier.flag == KeyFlag::Empty
                || compare(Self::item_at(&snap, length - 1), left_barrier) == KeyOrdering::Greater
            {
                self.nodes.release(ctx, PUSH_RIGHT_SLOT);
                self.contents.release(ctx, PUSH_RIGHT_SLOT);
                self.keys.release(ctx, PUSH_RIGHT_SLOT);
                self.children.release(ctx, PUSH_RIGHT_SLOT);
                return node;
            } else {
                node = snap.link;
            }
        }
    }

    /// Repairs a node whose `link` points at skippable nodes.
    fn clean_link(&self, ctx: &ThreadContext, node: *mut Node, mut snap: Snapshot) -> Snapshot {
        loop {
            let new_link = self.push_right(ctx, snap.link, EMPTY_KEY);
            if new_link == snap.link {
                return snap;
            }

            let update = self.new_contents(ctx, snap.items, snap.children, new_link);
            if self.cas_contents(node, snap.contents, update) {
                // The key and child blocks moved into the replacement;
                // only the Contents shell is done for.
                self.contents.retire(ctx, snap.contents);
                return Snapshot {
                    node,
                    contents: update,
                    items: snap.items,
                    children: snap.children,
                    link: new_link,
                };
            }
            self.contents.retire(ctx, update);
            snap = self.protect(ctx, node, 1);
        }
    }

    /// Routes to the arity-specific cleanup for the node the descent is
    /// about to leave through child `index`.
    fn clean_node(
        &self,
        ctx: &ThreadContext,
        key: Key,
        node: *mut Node,
        mut snap: Snapshot,
        mut index: i32,
        left_barrier: Key,
    ) {
        loop {
            self.republish(ctx, &snap, 1);
            let length = Self::items_len(&snap);

            let done = match length {
                0 => return,
                1 => self.clean_node1(ctx, node, &snap, left_barrier),
                2 => self.clean_node2(ctx, node, &snap, left_barrier),
                _ => self.clean_node_n(ctx, node, &snap, index, left_barrier),
            };
            if done {
                return;
            }

            snap = self.protect(ctx, node, 1);
            index = Self::search_snap(&snap, key);
            if -index - 1 == Self::items_len(&snap) {
                return;
            }
            if index < 0 {
                index = -index - 1;
            }
        }
    }

    fn clean_node1(
        &self,
        ctx: &ThreadContext,
        node: *mut Node,
        snap: &Snapshot,
        mut left_barrier: Key,
    ) -> bool {
        if self.attempt_slide_key(ctx, node, snap) {
            return true;
        }

        let key = Self::item_at(snap, 0);
        if left_barrier.flag != KeyFlag::Empty
            && compare(key, left_barrier) != KeyOrdering::Greater
        {
            left_barrier = EMPTY_KEY;
        }

        let child = Self::child_at(snap, 0);
        let adjusted = self.push_right(ctx, child, left_barrier);
        if adjusted == child {
            return true;
        }
        self.shift_child(ctx, node, snap, 0, adjusted)
    }

    fn clean_node2(
        &self,
        ctx: &ThreadContext,
        node: *mut Node,
        snap: &Snapshot,
        mut left_barrier: Key,
    ) -> bool {
        if self.attempt_slide_key(ctx, node, snap) {
            return true;
        }

        let key = Self::item_at(snap, 0);
        if left_barrier.flag != KeyFlag::Empty
            && compare(key, left_barrier) != KeyOrdering::Greater
        {
            left_barrier = EMPTY_KEY;
        }

        let child1 = Self::child_at(snap, 0);
        let adjusted1 = self.push_right(ctx, child1, left_barrier);
        let barrier2 = Self::item_at(snap, 0);
        let child2 = Self::child_at(snap, 1);
        let adjusted2 = self.push_right(ctx, child2, barrier2);

        if adjusted1 == child1 && adjusted2 == child2 {
            return true;
        }
        self.shift_children(ctx, node, snap, adjusted1, adjusted2)
    }

    fn clean_node_n(
        &self,
        ctx: &ThreadContext,
        node: *mut Node,
        snap: &Snapshot,
        index: i32,
        mut left_barrier: Key,
    ) -> bool {
        let key0 = Self::item_at(snap, 0);
        if index > 0 {
            left_barrier = Self::item_at(snap, index - 1);
        } else if left_barrier.flag != KeyFlag::Empty
            && compare(key0, left_barrier) != KeyOrdering::Greater
        {
            left_barrier = EMPTY_KEY;
        }

        let child = Self::child_at(snap, index);
        let adjusted = self.push_right(ctx, child, left_barrier);

        if index == 0 || index == Self::children_len(snap) - 1 {
            if adjusted == child {
                return true;
            }
            return self.shift_child(ctx, node, snap, index, adjusted);
        }

        let neighbor = self.push_right(ctx, Self::child_at(snap, index + 1), Self::item_at(snap, index));
        if neighbor == adjusted {
            self.drop_child(ctx, node, snap, index, adjusted)
        } else if adjusted != child {
            self.shift_child(ctx, node, snap, index, adjusted)
        } else {
            true
        }
    }

    fn shift_child(
        &self,
        ctx: &ThreadContext,
        node: *mut Node,
        snap: &Snapshot,
        index: i32,
        adjusted: *mut Node,
    ) -> bool {
        // SAFETY: snapshot blocks are protected and immutable.
        let source = unsafe { &*snap.children };
        let children = self.build_children(ctx, |out| {
            out.extend_from_slice(&source.slots);
            out[index as usize] = adjusted;
        });

        let update = self.new_contents(ctx, snap.items, children, snap.link);
        if self.cas_contents(node, snap.contents, update) {
            self.contents.retire(ctx, snap.contents);
            self.children.retire(ctx, snap.children);
            true
        } else {
            self.children.retire(ctx, children);
            self.contents.retire(ctx, update);
            false
        }
    }

    fn shift_children(
        &self,
        ctx: &ThreadContext,
        node: *mut Node,
        snap: &Snapshot,
        child1: *mut Node,
        child2: *mut Node,
    ) -> bool {
        let children = self.build_children(ctx, |out| {
            out.push(child1);
            out.push(child2);
        });

        let update = self.new_contents(ctx, snap.items, children, snap.link);
        if self.cas_contents(node, snap.contents, update) {
            self.contents.retire(ctx, snap.contents);
            self.children.retire(ctx, snap.children);
            true
        } else {
            self.children.retire(ctx, children);
            self.contents.retire(ctx, update);
            false
        }
    }

    /// Drops key `index` and merges its child into `adjusted`, which the
    /// caller proved already covers both ranges.
    fn drop_child(
        &self,
        ctx: &ThreadContext,
        node: *mut Node,
        snap: &Snapshot,
        index: i32,
        adjusted: *mut Node,
    ) -> bool {
        let idx = index as usize;
        // SAFETY: snapshot blocks are protected and immutable.
        let src_keys = unsafe { &*snap.items };
        let src_children = unsafe { &*snap.children };

        let keys = self.build_keys(ctx, |out| {
            out.extend_from_slice(&src_keys.items[..idx]);
            out.extend_from_slice(&src_keys.items[idx + 1..]);
        });
        let children = self.build_children(ctx, |out| {
            out.extend_from_slice(&src_children.slots[..idx]);
            out.push(adjusted);
            out.extend_from_slice(&src_children.slots[idx + 2..]);
        });

        let update = self.new_contents(ctx, keys, children, snap.link);
        if self.cas_contents(node, snap.contents, update) {
            self.retire_displaced(ctx, snap);
            true
        } else {
            self.children.retire(ctx, children);
            self.keys.retire(ctx, keys);
            self.contents.retire(ctx, update);
            false
        }
    }

    /// Tries to move this node's last key (and child) over to the right
    /// sibling, so a nearly-empty node drains instead of lingering.
    fn attempt_slide_key(&self, ctx: &ThreadContext, node: *mut Node, snap: &Snapshot) -> bool {
        if snap.link.is_null() {
            return false;
        }

        let length = Self::items_len(snap);
        let kkey = Self::item_at(snap, length - 1);
        let child = Self::child_at(snap, length - 1);
        self.nodes.publish(ctx, 2, child);

        let sibling = self.push_right(ctx, snap.link, EMPTY_KEY);
        self.nodes.publish(ctx, 3, sibling);
        let sib_snap = self.protect(ctx, sibling, 2);

        if Self::children_len(&sib_snap) == 0 {
            return false;
        }
        let mut nephew = Self::child_at(&sib_snap, 0);
        self.nodes.publish(ctx, 1, nephew);

        if compare(Self::item_at(&sib_snap, 0), kkey) == KeyOrdering::Greater {
            nephew = self.push_right(ctx, nephew, kkey);
        } else {
            nephew = self.push_right(ctx, nephew, EMPTY_KEY);
        }
        self.nodes.publish(ctx, 1, nephew);

        if nephew != child {
            return false;
        }

        if self.slide_to_neighbor(ctx, sibling, &sib_snap, kkey, child) {
            self.delete_slided_key(ctx, node, *snap, kkey);
        }
        true
    }

    fn slide_to_neighbor(
        &self,
        ctx: &ThreadContext,
        sibling: *mut Node,
        sib_snap: &Snapshot,
        kkey: Key,
        child: *mut Node,
    ) -> bool {
        let index = Self::search_snap(sib_snap, kkey);
        if index >= 0 {
            return true;
        }
        if index < -1 {
            return false;
        }

        // SAFETY: snapshot blocks are protected and immutable.
        let src_keys = unsafe { &*sib_snap.items };
        let src_children = unsafe { &*sib_snap.children };
        let keys = self.build_keys(ctx, |out| {
            out.push(kkey);
            out.extend_from_slice(&src_keys.items);
        });
        let children = self.build_children(ctx, |out| {
            out.push(child);
            out.extend_from_slice(&src_children.slots);
        });

        let update = self.new_contents(ctx, keys, children, sib_snap.link);
        if self.cas_contents(sibling, sib_snap.contents, update) {
            self.retire_displaced(ctx, sib_snap);
            true
        } else {
            self.keys.retire(ctx, keys);
            self.children.retire(ctx, children);
            self.contents.retire(ctx, update);
            false
        }
    }

    fn delete_slided_key(
        &self,
        ctx: &ThreadContext,
        node: *mut Node,
        snap: Snapshot,
        key: Key,
    ) -> Snapshot {
        let index = Self::search_snap(&snap, key);
        if index < 0 {
            return snap;
        }
        let idx = index as usize;

        // SAFETY: snapshot blocks are protected and immutable.
        let src_keys = unsafe { &*snap.items };
        let src_children = unsafe { &*snap.children };
        let keys = self.build_keys(ctx, |out| {
            out.extend_from_slice(&src_keys.items[..idx]);
            out.extend_from_slice(&src_keys.items[idx + 1..]);
        });
        let children = self.build_children(ctx, |out| {
            out.extend_from_slice(&src_children.slots[..idx]);
            out.extend_from_slice(&src_children.slots[idx + 1..]);
        });

        let update = self.new_contents(ctx, keys, children, snap.link);
        if self.cas_contents(node, snap.contents, update) {
            self.retire_displaced(ctx, &snap);
            Snapshot {
                node,
                contents: update,
                items: keys,
                children,
                link: snap.link,
            }
        } else {
            self.keys.retire(ctx, keys);
            self.children.retire(ctx, children);
            self.contents.retire(ctx, update);
            snap
        }
    }

    /// Cleans the boundary between a non-leaf node and its right
    /// neighbor while a taller insert descends past it.
    fn good_samaritan_clean_neighbor(
        &self,
        ctx: &ThreadContext,
        key: Key,
        results: Search,
    ) -> Search {
        let node = results.snap.node;
        self.nodes.publish(ctx, 1, node);
        let snap = results.snap;

        if snap.link.is_null() || snap.items.is_null() {
            return results;
        }
        self.republish(ctx, &snap, 2);

        let length = Self::items_len(&snap);
        let left_barrier = Self::item_at(&snap, length - 1);
        let child = Self::child_at(&snap, length - 1);
        self.nodes.publish(ctx, 2, child);

        let sibling = self.push_right(ctx, snap.link, EMPTY_KEY);
        self.nodes.publish(ctx, 3, sibling);
        let sib_snap = self.protect(ctx, sibling, 3);

        if Self::children_len(&sib_snap) == 0 {
            let fresh = self.protect(ctx, node, 2);
            let cleaned = self.clean_link(ctx, node, fresh);
            let index = Self::search_snap(&cleaned, key);
            return Search {
                snap: cleaned,
                index,
            };
        }

        let nephew = Self::child_at(&sib_snap, 0);
        self.nodes.publish(ctx, 4, nephew);

        let adjusted = if compare(Self::item_at(&sib_snap, 0), left_barrier) == KeyOrdering::Greater
        {
            self.push_right(ctx, nephew, left_barrier)
        } else {
            self.push_right(ctx, nephew, EMPTY_KEY)
        };
        self.nodes.publish(ctx, 5, adjusted);

        if nephew != child {
            if adjusted != nephew {
                self.shift_child(ctx, sibling, &sib_snap, 0, adjusted);
            }
        } else if self.slide_to_neighbor(ctx, sibling, &sib_snap, left_barrier, child) {
            let slid = self.delete_slided_key(ctx, node, snap, left_barrier);
            self.republish(ctx, &slid, 2);
            let index = Self::search_snap(&slid, key);
            return Search { snap: slid, index };
        }

        results
    }

    // --- traversal ---------------------------------------------------------

    fn traverse_leaf(&self, ctx: &ThreadContext, key: Key, cleanup: bool) -> Search {
        let (_, root_node, _) = self.protect_root(ctx);
        let mut node = root_node;
        self.nodes.publish(ctx, 0, node);
        let mut snap = self.protect(ctx, node, 0);
        let mut index = Self::search_snap(&snap, key);
        let mut left_barrier = EMPTY_KEY;

        while !snap.children.is_null() {
            let length = Self::items_len(&snap);
            if -index - 1 == length {
                if length > 0 {
                    left_barrier = Self::item_at(&snap, length - 1);
                }
                node = self.clean_link(ctx, node, snap).link;
            } else {
                if index < 0 {
                    index = -index - 1;
                }
                if cleanup {
                    self.clean_node(ctx, key, node, snap, index, left_barrier);
                }
                node = Self::child_at(&snap, index);
                left_barrier = EMPTY_KEY;
            }

            self.nodes.publish(ctx, 0, node);
            snap = self.protect(ctx, node, 0);
            index = Self::search_snap(&snap, key);
        }

        loop {
            if index > -Self::items_len(&snap) - 1 {
                self.republish(ctx, &snap, FIRST);
                return Search { snap, index };
            }
            node = self.clean_link(ctx, node, snap).link;

            self.nodes.publish(ctx, 0, node);
            snap = self.protect(ctx, node, 0);
            index = Self::search_snap(&snap, key);
        }
    }

    fn traverse_non_leaf(
        &self,
        ctx: &ThreadContext,
        key: Key,
        target: usize,
        results: &mut [Option<Search>],
    ) {
        let (_, mut root_node, mut height) = self.protect_root(ctx);
        if height < target {
            let grown = self.increase_root_height(ctx, target);
            root_node = grown.0;
            height = grown.1;
        }

        let mut node = root_node;
        loop {
            self.nodes.publish(ctx, 0, node);
            let snap = self.protect(ctx, node, 0);
            let index = Self::search_snap(&snap, key);

            if -index - 1 == Self::items_len(&snap) {
                node = snap.link;
            } else if height == 0 {
                self.republish(ctx, &snap, FIRST);
                results[0] = Some(Search { snap, index });
                return;
            } else {
                let first = Search { snap, index };
                let cleaned = self.good_samaritan_clean_neighbor(ctx, key, first);

                if height <= target {
                    self.republish(ctx, &cleaned.snap, FIRST + height);
                    results[height] = Some(cleaned);
                }

                let idx = if index < 0 { -index - 1 } else { index };
                node = Self::child_at(&snap, idx);
                height -= 1;
            }
        }
    }

    fn move_forward(&self, ctx: &ThreadContext, mut node: *mut Node, key: Key, hint: i32) -> Search {
        loop {
            let snap = self.protect(ctx, node, 1);
            // SAFETY: snapshot blocks are protected and immutable.
            let index = search_keys_with_hint(unsafe { &*snap.items }, key, hint);
            if index > -Self::items_len(&snap) - 1 {
                return Search { snap, index };
            }
            node = snap.link;
            self.nodes.publish(ctx, 0, node);
        }
    }

    // --- insertion ---------------------------------------------------------

    fn insert_leaf_level(
        &self,
        ctx: &ThreadContext,
        key: Key,
        mut results: Search,
        back_length: i32,
    ) -> LeafInsert {
        let mut back_length = back_length;
        loop {
            let snap = results.snap;
            let node = snap.node;
            let mut index = results.index;
            self.nodes.publish(ctx, 0, node);
            self.republish(ctx, &snap, 0);

            if index >= 0 {
                return LeafInsert::Duplicate;
            }
            index = -index - 1;

            let length = Self::items_len(&snap);
            if length != back_length || index >= back_length {
                return LeafInsert::Retry;
            }

            // SAFETY: snapshot blocks are protected and immutable.
            let src_keys = unsafe { &*snap.items };
            let idx = index as usize;
            let keys = self.build_keys(ctx, |out| {
                out.extend_from_slice(&src_keys.items[..idx]);
                out.push(key);
                out.extend_from_slice(&src_keys.items[idx..]);
            });

            let update = self.new_contents(ctx, keys, ptr::null_mut(), snap.link);
            if self.cas_contents(node, snap.contents, update) {
                self.retire_displaced(ctx, &snap);
                return LeafInsert::Inserted;
            }
            self.keys.retire(ctx, keys);
            self.contents.retire(ctx, update);
            results = self.move_forward(ctx, node, key, index);
            back_length = Self::items_len(&results.snap);
        }
    }

    fn begin_insert_one_level(
        &self,
        ctx: &ThreadContext,
        key: Key,
        results: &mut [Option<Search>],
    ) -> bool {
        let Some(mut current) = results[0] else {
            return false;
        };

        loop {
            let snap = current.snap;
            let node = snap.node;
            let mut index = current.index;
            self.nodes.publish(ctx, 0, node);
            self.republish(ctx, &snap, 0);

            if index >= 0 {
                return false;
            }
            index = -index - 1;

            // SAFETY: snapshot blocks are protected and immutable.
            let src_keys = unsafe { &*snap.items };
            let idx = index as usize;
            let keys = self.build_keys(ctx, |out| {
                out.extend_from_slice(&src_keys.items[..idx]);
                out.push(key);
                out.extend_from_slice(&src_keys.items[idx..]);
            });

            let update = self.new_contents(ctx, keys, ptr::null_mut(), snap.link);
            if self.cas_contents(node, snap.contents, update) {
                self.retire_displaced(ctx, &snap);
                let inserted = Snapshot {
                    node,
                    contents: update,
                    items: keys,
                    children: ptr::null_mut(),
                    link: snap.link,
                };
                self.republish(ctx, &inserted, FIRST);
                results[0] = Some(Search {
                    snap: inserted,
                    index,
                });
                return true;
            }
            self.keys.retire(ctx, keys);
            self.contents.retire(ctx, update);
            current = self.move_forward(ctx, node, key, index);
        }
    }

    /// Splits the node holding `key` at this level so everything above
    /// `key` moves into a fresh right sibling; returns that sibling for
    /// the level above to adopt, or null when no split is needed.
    fn split_one_level(&self, ctx: &ThreadContext, key: Key, entry: Search) -> *mut Node {
        let mut results = entry;
        loop {
            let snap = results.snap;
            let node = snap.node;
            let index = results.index;
            self.nodes.publish(ctx, 0, node);
            self.republish(ctx, &snap, 0);

            let length = Self::items_len(&snap);
            if index < 0 || length < 2 || index == length - 1 {
                return ptr::null_mut();
            }
            let idx = index as usize;

            // SAFETY: snapshot blocks are protected and immutable.
            let src_keys = unsafe { &*snap.items };
            let left_keys = self.build_keys(ctx, |out| {
                out.extend_from_slice(&src_keys.items[..=idx]);
            });
            let right_keys = self.build_keys(ctx, |out| {
                out.extend_from_slice(&src_keys.items[idx + 1..]);
            });

            let (left_children, right_children) = if snap.children.is_null() {
                (ptr::null_mut(), ptr::null_mut())
            } else {
                // SAFETY: as above.
                let src_children = unsafe { &*snap.children };
                (
                    self.build_children(ctx, |out| {
                        out.extend_from_slice(&src_children.slots[..=idx]);
                    }),
                    self.build_children(ctx, |out| {
                        out.extend_from_slice(&src_children.slots[idx + 1..]);
                    }),
                )
            };

            let right_contents = self.new_contents(ctx, right_keys, right_children, snap.link);
            let right = self.new_node(ctx, right_contents);
            let left = self.new_contents(ctx, left_keys, left_children, right);

            if self.cas_contents(node, snap.contents, left) {
                self.retire_displaced(ctx, &snap);
                return right;
            }

            self.keys.retire(ctx, left_keys);
            self.keys.retire(ctx, right_keys);
            self.children.retire(ctx, left_children);
            self.children.retire(ctx, right_children);
            self.contents.retire(ctx, right_contents);
            self.nodes.retire(ctx, right);
            self.contents.retire(ctx, left);

            results = self.move_forward(ctx, node, key, index);
        }
    }

    fn insert_one_level(
        &self,
        ctx: &ThreadContext,
        key: Key,
        results: &mut [Option<Search>],
        child: *mut Node,
        target: usize,
    ) {
        if child.is_null() {
            return;
        }
        let Some(entry) = results[target] else {
            return;
        };

        let mut current = entry;
        loop {
            let snap = current.snap;
            let node = snap.node;
            let index = current.index;
            self.nodes.publish(ctx, 0, node);
            self.republish(ctx, &snap, 0);

            if index >= 0 {
                return;
            }

            if index > -Self::items_len(&snap) - 1 {
                let pos = -index - 1;
                let idx = pos as usize;

                // SAFETY: snapshot blocks are protected and immutable.
                let src_keys = unsafe { &*snap.items };
                let src_children = unsafe { &*snap.children };
                let keys = self.build_keys(ctx, |out| {
                    out.extend_from_slice(&src_keys.items[..idx]);
                    out.push(key);
                    out.extend_from_slice(&src_keys.items[idx..]);
                });
                let children = self.build_children(ctx, |out| {
                    out.extend_from_slice(&src_children.slots[..=idx]);
                    out.push(child);
                    out.extend_from_slice(&src_children.slots[idx + 1..]);
                });

                let update = self.new_contents(ctx, keys, children, snap.link);
                if self.cas_contents(node, snap.contents, update) {
                    self.retire_displaced(ctx, &snap);
                    let inserted = Snapshot {
                        node,
                        contents: update,
                        items: keys,
                        children,
                        link: snap.link,
                    };
                    self.republish(ctx, &inserted, FIRST + target);
                    results[target] = Some(Search {
                        snap: inserted,
                        index: pos,
                    });
                    return;
                }
                self.keys.retire(ctx, keys);
                self.children.retire(ctx, children);
                self.contents.retire(ctx, update);
                current = self.move_forward(ctx, node, key, pos);
            } else {
                current = self.move_forward(ctx, node, key, -index - 1);
            }
        }
    }

    fn increase_root_height(&self, ctx: &ThreadContext, target: usize) -> (*mut Node, usize) {
        let (mut head, mut node, mut height) = self.protect_root(ctx);

        while height < target {
            let keys = self.build_keys(ctx, |out| {
                out.push(Key {
                    flag: KeyFlag::Inf,
                    key: 0,
                });
            });
            let children = self.build_children(ctx, |out| {
                out.push(node);
            });
            let contents = self.new_contents(ctx, keys, children, ptr::null_mut());
            let new_root_node = self.new_node(ctx, contents);
            let update = self.new_head(ctx, new_root_node, height + 1);

            if self
                .root
                .compare_exchange(head, update, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                tracing::debug!(height = height + 1, "grew multiway tree root");
                self.heads.retire(ctx, head);
            } else {
                self.children.retire(ctx, children);
                self.keys.retire(ctx, keys);
                self.contents.retire(ctx, contents);
                self.nodes.retire(ctx, new_root_node);
                self.heads.retire(ctx, update);
            }

            let fresh = self.protect_root(ctx);
            head = fresh.0;
            node = fresh.1;
            height = fresh.2;
        }

        (node, height)
    }

    // --- removal -----------------------------------------------------------

    fn remove_from_node(&self, ctx: &ThreadContext, key: Key, mut results: Search) -> bool {
        loop {
            let snap = results.snap;
            let node = snap.node;
            let index = results.index;

            if index < 0 {
                return false;
            }
            let idx = index as usize;

            self.nodes.publish(ctx, 0, node);
            self.republish(ctx, &snap, 0);

            // SAFETY: snapshot blocks are protected and immutable.
            let src_keys = unsafe { &*snap.items };
            let keys = self.build_keys(ctx, |out| {
                out.extend_from_slice(&src_keys.items[..idx]);
                out.extend_from_slice(&src_keys.items[idx + 1..]);
            });

            // Leaf level: there are no children to carry over.
            let update = self.new_contents(ctx, keys, ptr::null_mut(), snap.link);
            if self.cas_contents(node, snap.contents, update) {
                self.retire_displaced(ctx, &snap);
                return true;
            }
            self.keys.retire(ctx, keys);
            self.contents.retire(ctx, update);
            results = self.move_forward(ctx, node, key, index);
        }
    }

    // --- public operations -------------------------------------------------

    fn do_contains(&self, ctx: &ThreadContext, key: Key) -> bool {
        let (_, root_node, _) = self.protect_root(ctx);
        let mut node = root_node;
        self.nodes.publish(ctx, 0, node);
        let mut snap = self.protect(ctx, node, 0);
        let mut index = Self::search_snap(&snap, key);

        while !snap.children.is_null() {
            node = if -index - 1 == Self::items_len(&snap) {
                snap.link
            } else if index < 0 {
                Self::child_at(&snap, -index - 1)
            } else {
                Self::child_at(&snap, index)
            };

            self.nodes.publish(ctx, 0, node);
            snap = self.protect(ctx, node, 0);
            index = Self::search_snap(&snap, key);
        }

        loop {
            if -index - 1 != Self::items_len(&snap) {
                self.release_everything(ctx);
                return index >= 0;
            }
            node = snap.link;

            self.nodes.publish(ctx, 0, node);
            snap = self.protect(ctx, node, 0);
            index = Self::search_snap(&snap, key);
        }
    }

    fn do_add(&self, ctx: &ThreadContext, key: Key) -> bool {
        loop {
            let height = self.random_level(ctx);

            if height == 0 {
                let results = self.traverse_leaf(ctx, key, false);
                let back_length = Self::items_len(&results.snap);
                match self.insert_leaf_level(ctx, key, results, back_length) {
                    LeafInsert::Inserted => {
                        self.release_everything(ctx);
                        return true;
                    }
                    LeafInsert::Duplicate => {
                        self.release_everything(ctx);
                        return false;
                    }
                    LeafInsert::Retry => {
                        self.release_everything(ctx);
                        continue;
                    }
                }
            }

            let mut results: Vec<Option<Search>> = vec![None; height + 1];
            self.traverse_non_leaf(ctx, key, height, &mut results);

            if !self.begin_insert_one_level(ctx, key, &mut results) {
                self.release_everything(ctx);
                return false;
            }

            for level in 0..height {
                let entry = match results[level] {
                    Some(entry) => entry,
                    None => break,
                };
                let right = self.split_one_level(ctx, key, entry);
                self.insert_one_level(ctx, key, &mut results, right, level + 1);
            }

            self.release_everything(ctx);
            return true;
        }
    }

    fn do_remove(&self, ctx: &ThreadContext, key: Key) -> bool {
        let results = self.traverse_leaf(ctx, key, true);
        let removed = self.remove_from_node(ctx, key, results);
        self.release_everything(ctx);
        removed
    }
}

impl<T: KeyHash> ConcurrentSet<T> for MultiwaySearchTree<T> {
    fn add(&self, ctx: &ThreadContext, value: T) -> bool {
        self.do_add(ctx, normal_key(value.hash()))
    }

    fn remove(&self, ctx: &ThreadContext, value: T) -> bool {
        self.do_remove(ctx, normal_key(value.hash()))
    }

    fn contains(&self, ctx: &ThreadContext, value: T) -> bool {
        self.do_contains(ctx, normal_key(value.hash()))
    }
}

impl<T> Drop for MultiwaySearchTree<T> {
    fn drop(&mut self) {
        let mut node_set: HashSet<*mut Node> = HashSet::new();
        let mut contents_set: HashSet<*mut Contents> = HashSet::new();
        let mut keys_set: HashSet<*mut Keys> = HashSet::new();
        let mut children_set: HashSet<*mut Children> = HashSet::new();
        let mut head_set: HashSet<*mut HeadNode> = HashSet::new();

        // Queued (retired) objects are freed as bare blocks and must not
        // be walked: their pointers may have been reused into live
        // structures. Trashed nodes were skipped as empty but may still
        // own their (empty) Contents, so they enter the walk instead.
        node_set.extend(self.nodes.take_all_queued());
        contents_set.extend(self.contents.take_all_queued());
        keys_set.extend(self.keys.take_all_queued());
        children_set.extend(self.children.take_all_queued());
        head_set.extend(self.heads.take_all_queued());

        let root = *self.root.get_mut();
        head_set.insert(root);

        // Walk what is still linked plus the trash lists. The sets
        // de-duplicate blocks shared between a retired Contents and its
        // replacement.
        // SAFETY: the tree is quiescent and exclusively owned in drop.
        let mut stack = vec![unsafe { &*root }.node];
        for lane in self.trash.iter_mut() {
            stack.append(lane.get_mut());
        }
        while let Some(node) = stack.pop() {
            if node.is_null() || !node_set.insert(node) {
                continue;
            }
            // SAFETY: as above.
            let contents = unsafe { &*node }.contents.load(Ordering::Relaxed);
            if contents.is_null() || !contents_set.insert(contents) {
                continue;
            }
            // SAFETY: as above.
            let c = unsafe { &*contents };
            if !c.items.is_null() {
                keys_set.insert(c.items);
            }
            if !c.children.is_null() && children_set.insert(c.children) {
                // SAFETY: as above.
                for &child in &unsafe { &*c.children }.slots {
                    stack.push(child);
                }
            }
            stack.push(c.link);
        }

        for p in node_set {
            if !p.is_null() {
                // SAFETY: deduplicated exclusive ownership.
                drop(unsafe { Box::from_raw(p) });
            }
        }
        for p in contents_set {
            if !p.is_null() {
                // SAFETY: as above.
                drop(unsafe { Box::from_raw(p) });
            }
        }
        for p in keys_set {
            if !p.is_null() {
                // SAFETY: as above.
                drop(unsafe { Box::from_raw(p) });
            }
        }
        for p in children_set {
            if !p.is_null() {
                // SAFETY: as above.
                drop(unsafe { Box::from_raw(p) });
            }
        }
        for p in head_set {
            if !p.is_null() {
                // SAFETY: as above.
                drop(unsafe { Box::from_raw(p) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::core::thread::ThreadRegistry;

    fn assert_leaf_level_sorted(tree: &MultiwaySearchTree<i32>) {
        // Descend along the leftmost children, then walk the links.
        // SAFETY: quiescent single-threaded walk.
        unsafe {
            let mut node = (*tree.root.load(Ordering::Relaxed)).node;
            loop {
                let contents = &*(*node).contents.load(Ordering::Relaxed);
                if contents.children.is_null() {
                    break;
                }
                node = (&(*contents.children).slots)[0];
            }

            let mut last: Option<Key> = None;
            while !node.is_null() {
                let contents = &*(*node).contents.load(Ordering::Relaxed);
                for &key in &(*contents.items).items {
                    if let Some(prev) = last {
                        assert_eq!(
                            compare(prev, key),
                            KeyOrdering::Less,
                            "leaf keys out of order"
                        );
                    }
                    last = Some(key);
                }
                node = contents.link;
            }
            assert_eq!(last.map(|k| k.flag), Some(KeyFlag::Inf));
        }
    }

    #[test]
    fn keeps_leaf_level_sorted_through_churn() {
        let registry = ThreadRegistry::new(1);
        let ctx = registry.register().unwrap();
        let tree: MultiwaySearchTree<i32> = MultiwaySearchTree::new(1);

        for i in 0..2000 {
            assert!(tree.add(&ctx, i * 7 % 2000));
        }
        assert_leaf_level_sorted(&tree);

        for i in 0..1000 {
            assert!(tree.remove(&ctx, i));
        }
        assert_leaf_level_sorted(&tree);

        for i in 0..2000 {
            assert_eq!(tree.contains(&ctx, i), i >= 1000, "key {i}");
        }
    }

    #[test]
    fn random_level_is_geometric_and_bounded() {
        let registry = ThreadRegistry::new(1);
        let ctx = registry.register().unwrap();
        let tree: MultiwaySearchTree<i32> = MultiwaySearchTree::new(1);

        let mut zero = 0usize;
        for _ in 0..10_000 {
            let level = tree.random_level(&ctx);
            assert!(level <= MAX_HEIGHT);
            if level == 0 {
                zero += 1;
            }
        }
        // Mean 1/32: expect roughly 97% zeros.
        assert!(zero > 9_000, "suspicious level distribution: {zero}");
    }
}
