// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! The tree container and the cross-layer `put`/`get` protocols.
//!
//! A Mass Tree is a tree of *layers*: each layer is a B+-tree over the
//! 8-byte slice of the key at a layer-specific offset, and a border entry
//! either terminates the key or links to the root of the next layer
//! (offset advanced by 8). Writers lock single nodes; readers descend
//! optimistically, validating version snapshots and chasing sibling links
//! when a split moved their range to the right.

use std::{
    marker::PhantomData,
    sync::atomic::{
        AtomicPtr,
        Ordering::{Acquire, Relaxed, Release},
    },
};

use thiserror::Error;
use tracing::trace;

use crate::{
    node::{
        slice_at, split_node, BorderNode, Entry, InsertOutcome, InteriorNode, NodeHeader, SlotHit,
        KEYLEN_LINK,
    },
    version::NodeVersion,
};

/// Largest accepted key length in bytes.
pub const MAX_KEY_LEN: usize = 1 << 16;

/// What a [`MassTree::put`] did.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PutResult {
    /// The key was not present; the value is now stored under it.
    Inserted,
    /// The key was already present; the tree is unchanged and the offered
    /// value was dropped.
    Existed,
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum MassTreeError {
    #[error("key of {0} bytes exceeds the maximum key length")]
    KeyTooLong(usize),
}

/// A concurrent, in-memory, ordered index from arbitrary-length byte-string
/// keys to values.
///
/// `put` and `get` are linearizable per key and may be called from any
/// number of threads in parallel. Keys are copied into the tree; values are
/// stored once and never overwritten or dropped before the tree itself is,
/// which is why `get` can hand out plain references.
pub struct MassTree<V> {
    root: AtomicPtr<NodeHeader>,
    _entries: PhantomData<Entry<V>>,
}

unsafe impl<V: Send + Sync> Send for MassTree<V> {}
unsafe impl<V: Send + Sync> Sync for MassTree<V> {}

impl<V> Default for MassTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> MassTree<V> {
    /// Creates an empty tree: a single border node marked as the layer-0
    /// root.
    pub fn new() -> Self {
        let root = BorderNode::<V>::alloc(true);
        Self {
            root: AtomicPtr::new(root as *mut NodeHeader),
            _entries: PhantomData,
        }
    }

    /// Inserts `value` under `key` unless the key is already present.
    pub fn put(&self, key: &[u8], value: V) -> Result<PutResult, MassTreeError> {
        if key.len() > MAX_KEY_LEN {
            return Err(MassTreeError::KeyTooLong(key.len()));
        }
        let entry = Box::into_raw(Box::new(Entry {
            key: Box::from(key),
            value,
        }));
        Ok(unsafe { self.put_entry(entry) })
    }

    /// Looks up `key`, returning a reference to its value.
    pub fn get(&self, key: &[u8]) -> Option<&V> {
        if key.len() > MAX_KEY_LEN {
            return None;
        }
        let mut layer_root = self.root.load(Acquire);
        let mut off = 0usize;
        unsafe {
            'layer: loop {
                let (mut n, mut v) = self.find_border(layer_root, key, off);
                let (slice, class) = slice_at(key, off);
                loop {
                    if v.is_deleted() {
                        debug_assert!(false, "deletion is a collaborator concern");
                        continue 'layer;
                    }
                    let border = &*n;
                    let perm = border.base.permutation();
                    // capture the slot pointer before validating: a writer
                    // may retag the slot right after the check, so nothing
                    // loaded later than the check may be trusted
                    let (hit, _) = border.locate(perm, slice, class);
                    let slot = match hit {
                        SlotHit::Miss => None,
                        SlotHit::Link { phys } | SlotHit::Data { phys } => {
                            Some(border.lv(phys))
                        }
                    };
                    if !v.same_modulo_lock(border.base.version()) {
                        // the node changed under us; take a fresh stable
                        // version and chase any splits to the right
                        v = border.base.stable_version();
                        let mut next = border.next();
                        while !v.is_deleted() && !next.is_null() && (*next).include_key(key, off) {
                            n = next;
                            v = (*n).base.stable_version();
                            next = (*n).next();
                        }
                        continue;
                    }
                    // the snapshot is consistent; the captured pointer is
                    // safe to follow now
                    match (hit, slot) {
                        (SlotHit::Miss, _) => {
                            trace!(key = %hex::encode(key), "lookup miss");
                            return None;
                        }
                        (SlotHit::Link { .. }, Some(link)) => {
                            layer_root = link as *mut NodeHeader;
                            off += 8;
                            continue 'layer;
                        }
                        (SlotHit::Data { .. }, Some(data)) => {
                            let entry = &*(data as *mut Entry<V>);
                            if class == 8 && entry.key[off + 8..] != key[off + 8..] {
                                trace!(key = %hex::encode(key), "lookup miss on suffix");
                                return None;
                            }
                            return Some(&entry.value);
                        }
                        _ => unreachable!("slot captured for every non-miss hit"),
                    }
                }
            }
        }
    }

    /// Descends one layer to the border node covering the key's slice at
    /// `off`, returning it along with the stable version observed on
    /// arrival.
    unsafe fn find_border(
        &self,
        layer_root: *mut NodeHeader,
        key: &[u8],
        off: usize,
    ) -> (*mut BorderNode<V>, NodeVersion) {
        'restart: loop {
            let mut n = layer_root;
            let mut v = (*n).stable_version();
            // the layer root may have been split away under us; climb back
            // up to whatever is the root now
            while !v.is_root() {
                let parent = (*n).parent();
                if parent.is_null() {
                    continue 'restart;
                }
                n = parent;
                v = (*n).stable_version();
            }
            loop {
                if v.is_border() {
                    return (n as *mut BorderNode<V>, v);
                }
                let mut off_copy = off;
                let child = (*(n as *mut InteriorNode)).locate_child(key, &mut off_copy);
                if child.is_null() {
                    continue 'restart;
                }
                let child_v = (*child).stable_version();
                if v.same_modulo_lock((*n).version()) {
                    // no structural or in-place change since our snapshot;
                    // the chosen child is trustworthy
                    n = child;
                    v = child_v;
                    continue;
                }
                let v2 = (*n).stable_version();
                if v2.vsplit() != v.vsplit() {
                    // this node split; its range may have moved anywhere
                    continue 'restart;
                }
                // an insert went in; re-pick the child from the same node
                v = v2;
            }
        }
    }

    /// Drives an owned entry down the layers until it lands.
    unsafe fn put_entry(&self, entry: *mut Entry<V>) -> PutResult {
        let mut layer_root = self.root.load(Acquire);
        let mut off = 0usize;
        loop {
            let key = &(&(*entry).key)[..];
            let (found, _) = self.find_border(layer_root, key, off);
            let mut n = found;
            (*n).base.lock();
            // a concurrent split may have carried our position to the
            // right between descent and lock; chase the chain
            loop {
                let next = (*n).next();
                if next.is_null() {
                    break;
                }
                (*next).base.lock();
                if !(*next).include_key(key, off) {
                    (*next).base.unlock();
                    break;
                }
                (*n).base.unlock();
                n = next;
            }
            match (*n).insert_entry(off, entry) {
                InsertOutcome::Inserted => {
                    (*n).base.unlock();
                    return PutResult::Inserted;
                }
                InsertOutcome::Existed => {
                    (*n).base.unlock();
                    drop(Box::from_raw(entry));
                    return PutResult::Existed;
                }
                InsertOutcome::AlreadyLinked(link) => {
                    (*n).base.unlock();
                    layer_root = link;
                    off += 8;
                }
                InsertOutcome::Collides { phys } => {
                    let conflict = (*n).lv(phys) as *mut Entry<V>;
                    let layer = build_conflict_layer(conflict, entry, off, n as *mut NodeHeader);
                    (*n).replace_at_index(phys, layer);
                    (*n).base.unlock();
                    return PutResult::Inserted;
                }
                InsertOutcome::Full => {
                    trace!(off, "splitting full border node");
                    let (n1, fence) = split_node::<V>(n as *mut NodeHeader);
                    let (slice, _) = slice_at(key, off);
                    let target = if slice < fence {
                        n
                    } else {
                        n1 as *mut BorderNode<V>
                    };
                    match (*target).insert_entry(off, entry) {
                        InsertOutcome::Inserted => {}
                        _ => unreachable!("re-insert into a freshly split node cannot fail"),
                    }
                    self.promote_split(n as *mut NodeHeader, fence, n1);
                    return PutResult::Inserted;
                }
            }
        }
    }

    /// Walks a finished split up the tree: inserts the fence into the
    /// parent, splitting full parents in turn, and grows a new root when
    /// the split reached the top of its layer. Consumes the locks on `n`
    /// and `n1`.
    unsafe fn promote_split(&self, mut n: *mut NodeHeader, mut fence: u64, mut n1: *mut NodeHeader) {
        loop {
            let p = (*n).locked_parent();
            if p.is_null() {
                // layer-0 root split
                trace!("growing a new layer-0 root");
                let root = grow(n, fence, n1);
                self.root.store(root, Release);
                (*root).unlock();
                (*n).unlock();
                (*n1).unlock();
                return;
            }
            (*n1).set_parent(p);
            let pv = (*p).version();
            if pv.is_border() {
                // `n` was the root of a sub-layer hanging off a border
                // entry; grow the sub-layer and swap the link over
                let root = grow(n, fence, n1);
                (*root).set_parent(p);
                (*(p as *mut BorderNode<V>)).swap_link(n, root);
                (*root).unlock();
                (*n).unlock();
                (*n1).unlock();
                (*p).unlock();
                return;
            }
            match (*(p as *mut InteriorNode)).insert_fence(fence, n1) {
                InsertOutcome::Inserted => {
                    (*n).unlock();
                    (*n1).unlock();
                    (*p).unlock();
                    return;
                }
                InsertOutcome::Full => {
                    // raise the split bit before releasing `n` so every
                    // descent through `p` stalls until the fence is up
                    (*p).set_version((*p).version().splitting());
                    (*n).unlock();
                    let (p1, fence1) = split_node::<V>(p);
                    if fence < fence1 {
                        match (*(p as *mut InteriorNode)).insert_fence(fence, n1) {
                            InsertOutcome::Inserted => {}
                            _ => unreachable!("re-insert into a freshly split node cannot fail"),
                        }
                    } else {
                        (*n1).set_parent(p1);
                        match (*(p1 as *mut InteriorNode)).insert_fence(fence, n1) {
                            InsertOutcome::Inserted => {}
                            _ => unreachable!("re-insert into a freshly split node cannot fail"),
                        }
                    }
                    (*n1).unlock();
                    n = p;
                    fence = fence1;
                    n1 = p1;
                }
                _ => unreachable!("fence insertion cannot observe border outcomes"),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn layer0_root(&self) -> *mut NodeHeader {
        self.root.load(Acquire)
    }
}

impl<V> Drop for MassTree<V> {
    fn drop(&mut self) {
        // &mut self: no concurrent visitors remain
        unsafe { free_node::<V>(self.root.load(Relaxed)) }
    }
}

/// Builds a new interior root over a freshly split pair. The new root is
/// returned locked and already carries the root bit; `n` and `n1` have
/// theirs cleared and their parents pointed at it. The caller publishes
/// the root (tree cell or border link) before unlocking anything.
unsafe fn grow(n: *mut NodeHeader, fence: u64, n1: *mut NodeHeader) -> *mut NodeHeader {
    let root = InteriorNode::alloc();
    (*root)
        .base
        .set_version(NodeVersion::new_interior().locked().rooted());
    (*root).set_child(0, n);
    match (*root).insert_fence(fence, n1) {
        InsertOutcome::Inserted => {}
        _ => unreachable!("a fresh root cannot reject its first fence"),
    }
    let root = root as *mut NodeHeader;
    (*n).set_parent(root);
    (*n1).set_parent(root);
    (*n).set_version((*n).version().unrooted());
    (*n1).set_version((*n1).version().unrooted());
    root
}

/// Builds the chain of deeper layers for two entries whose slices collide
/// at `off`: one fresh single-LINK border root per further shared slice,
/// then both entries side by side at the first layer where they diverge.
/// Returns the chain's root with its parent already set to `owner`.
unsafe fn build_conflict_layer<V>(
    a: *mut Entry<V>,
    b: *mut Entry<V>,
    mut off: usize,
    owner: *mut NodeHeader,
) -> *mut NodeHeader {
    off += 8;
    let top = BorderNode::<V>::alloc(true);
    (*top).base.set_parent(owner);
    (*top).base.lock();
    let mut cur = top;
    loop {
        let (slice_a, class_a) = slice_at(&(*a).key, off);
        let (slice_b, class_b) = slice_at(&(*b).key, off);
        if slice_a == slice_b && class_a == 8 && class_b == 8 {
            trace!(off, "conflicting keys share another slice; descending");
            let deeper = BorderNode::<V>::alloc(true);
            (*deeper).base.set_parent(cur as *mut NodeHeader);
            (*deeper).base.lock();
            (*cur).insert_link(slice_a, deeper as *mut NodeHeader);
            (*cur).base.unlock();
            cur = deeper;
            off += 8;
        } else {
            assert!(
                (slice_a, class_a) != (slice_b, class_b),
                "distinct keys must diverge within their length"
            );
            for entry in [a, b] {
                match (*cur).insert_entry(off, entry) {
                    InsertOutcome::Inserted => {}
                    _ => unreachable!("diverged entries cannot clash in a fresh node"),
                }
            }
            (*cur).base.unlock();
            return top as *mut NodeHeader;
        }
    }
}

/// Frees a node, its reachable entries and sub-layers. Single-threaded
/// teardown only.
unsafe fn free_node<V>(n: *mut NodeHeader) {
    if (*n).version().is_border() {
        let border = Box::from_raw(n as *mut BorderNode<V>);
        for phys in border.base.permutation().entries() {
            if border.keylen(phys) == KEYLEN_LINK {
                free_node::<V>(border.lv(phys) as *mut NodeHeader);
            } else {
                drop(Box::from_raw(border.lv(phys) as *mut Entry<V>));
            }
        }
    } else {
        let interior = Box::from_raw(n as *mut InteriorNode);
        free_node::<V>(interior.child(0));
        for phys in interior.base.permutation().entries() {
            free_node::<V>(interior.child(phys + 1));
        }
    }
}
