// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Node layouts and single-node operations of the Mass Tree.
//!
//! Every node starts with a [`NodeHeader`] (version word, permutation word,
//! fifteen 8-byte key slices, parent pointer); [`InteriorNode`] adds sixteen
//! child pointers and [`BorderNode`] adds per-entry tags, value slots and
//! the sibling chain. The header-prefix layout (`#[repr(C)]`) is what lets
//! the tree pass one `*mut NodeHeader` around and downcast after checking
//! the version's border bit.
//!
//! All racily read fields are word-sized atomics. A reader may load any of
//! them at any time and will see stale but never torn values; it must not
//! *dereference* an entry or link pointer until its version validation
//! succeeds (or while it holds the node lock). Node pointers themselves may
//! always be dereferenced for version reads, because nodes are only freed
//! at tree teardown.

use std::{
    cmp::Ordering::{Equal, Greater, Less},
    fmt,
    marker::PhantomData,
    ptr::null_mut,
    sync::atomic::{
        AtomicPtr, AtomicU32, AtomicU64, AtomicU8,
        Ordering::{Acquire, Relaxed, Release},
    },
};

use byteorder::{BigEndian, ByteOrder};
use crossbeam_utils::Backoff;

use crate::{
    permutation::{Permutation, MAX_KEYS},
    version::NodeVersion,
};

/// Tag in a border `keylen` slot marking the entry as a link to the root of
/// the next layer.
pub(crate) const KEYLEN_LINK: u8 = 0xff;

/// The search class of a `keylen` tag: the number of key bytes occupying
/// the slice, with LINK entries classed together with full slices since
/// both stand for "eight bytes and more to come".
#[inline]
pub(crate) fn class_of(keylen: u8) -> u8 {
    if keylen == KEYLEN_LINK {
        8
    } else {
        keylen
    }
}

/// Extracts the 8-byte slice of `key` at `offset`, zero-padded, along with
/// its class (the number of key bytes present, capped at 8). Big-endian so
/// that unsigned slice comparison agrees with lexicographic byte order.
pub(crate) fn slice_at(key: &[u8], offset: usize) -> (u64, u8) {
    debug_assert!(offset <= key.len());
    let rest = &key[offset..];
    if rest.len() >= 8 {
        (BigEndian::read_u64(&rest[..8]), 8)
    } else {
        let mut buf = [0u8; 8];
        buf[..rest.len()].copy_from_slice(rest);
        (BigEndian::read_u64(&buf), rest.len() as u8)
    }
}

/// An owned key/value record referenced from a border slot. Entries are
/// immutable once linked in and live until the tree is dropped; promotion
/// to a deeper layer moves the pointer, never the record.
pub(crate) struct Entry<V> {
    pub(crate) key: Box<[u8]>,
    pub(crate) value: V,
}

/// Outcome of inserting into a node, per the tagged-result design: the
/// caller descends on `AlreadyLinked`, promotes on `Collides`, splits on
/// `Full`, and reports `Existed` to the user.
pub(crate) enum InsertOutcome {
    Inserted,
    AlreadyLinked(*mut NodeHeader),
    Existed,
    Collides { phys: usize },
    Full,
}

/// Result of probing a border node for one `(slice, class)` pair. Holds
/// physical slot indices only; the caller decides when the pointers behind
/// them are safe to follow.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum SlotHit {
    Miss,
    Link { phys: usize },
    Data { phys: usize },
}

/// The common node prefix shared by both variants.
#[repr(C)]
pub(crate) struct NodeHeader {
    version: AtomicU32,
    permutation: AtomicU64,
    keyslice: [AtomicU64; MAX_KEYS],
    parent: AtomicPtr<NodeHeader>,
}

impl NodeHeader {
    fn new(version: NodeVersion) -> Self {
        Self {
            version: AtomicU32::new(version.raw()),
            permutation: AtomicU64::new(Permutation::EMPTY.raw()),
            keyslice: std::array::from_fn(|_| AtomicU64::new(0)),
            parent: AtomicPtr::new(null_mut()),
        }
    }

    pub(crate) fn version(&self) -> NodeVersion {
        NodeVersion::from_raw(self.version.load(Acquire))
    }

    /// Overwrites the version word. Only the lock holder may call this.
    pub(crate) fn set_version(&self, version: NodeVersion) {
        self.version.store(version.raw(), Release);
    }

    pub(crate) fn permutation(&self) -> Permutation {
        Permutation::from_raw(self.permutation.load(Acquire))
    }

    /// Publishes a new logical ordering; the release pairs with the
    /// acquire in [`Self::permutation`] so slot writes become visible
    /// before the count that exposes them.
    pub(crate) fn set_permutation(&self, permutation: Permutation) {
        self.permutation.store(permutation.raw(), Release);
    }

    pub(crate) fn keyslice(&self, phys: usize) -> u64 {
        self.keyslice[phys].load(Relaxed)
    }

    pub(crate) fn set_keyslice(&self, phys: usize, slice: u64) {
        self.keyslice[phys].store(slice, Relaxed);
    }

    pub(crate) fn parent(&self) -> *mut NodeHeader {
        self.parent.load(Acquire)
    }

    pub(crate) fn set_parent(&self, parent: *mut NodeHeader) {
        self.parent.store(parent, Release);
    }

    /// Spins until a version with both dirty bits clear is observed.
    pub(crate) fn stable_version(&self) -> NodeVersion {
        let backoff = Backoff::new();
        loop {
            let v = self.version();
            if v.is_stable() {
                return v;
            }
            backoff.spin();
        }
    }

    /// Acquires the node spin lock.
    pub(crate) fn lock(&self) {
        let backoff = Backoff::new();
        loop {
            let v = self.version();
            if v.is_locked() {
                backoff.snooze();
                continue;
            }
            if self
                .version
                .compare_exchange_weak(v.raw(), v.locked().raw(), Acquire, Relaxed)
                .is_ok()
            {
                return;
            }
            backoff.spin();
        }
    }

    /// Releases the node lock, committing any dirty bit raised during the
    /// critical section into its counter. Both bits may have been raised
    /// when one critical section split and then re-inserted.
    pub(crate) fn unlock(&self) {
        let mut v = self.version();
        assert!(v.is_locked(), "unlock of an unlocked node");
        if v.is_inserting() {
            v = v.bump_vinsert().clear_inserting();
        }
        if v.is_splitting() {
            v = v.bump_vsplit().clear_splitting();
        }
        self.version.store(v.unlocked().raw(), Release);
    }

    /// Locks and returns the parent, retrying if it changes before the
    /// lock lands. Null means the node is its layer-0 root.
    pub(crate) fn locked_parent(&self) -> *mut NodeHeader {
        loop {
            let parent = self.parent();
            if parent.is_null() {
                return parent;
            }
            let p = unsafe { &*parent };
            p.lock();
            if self.parent() == parent {
                return parent;
            }
            p.unlock();
        }
    }
}

/// An internal node of one layer: fence slices routing to up to sixteen
/// children. `child[0]` is the leftmost child; the child right of the
/// fence in physical slot `p` sits in `child[p + 1]`, so the sorted view
/// of both arrays is recovered through the permutation.
#[repr(C)]
pub(crate) struct InteriorNode {
    pub(crate) base: NodeHeader,
    child: [AtomicPtr<NodeHeader>; MAX_KEYS + 1],
}

impl InteriorNode {
    pub(crate) fn alloc() -> *mut InteriorNode {
        Box::into_raw(Box::new(Self {
            base: NodeHeader::new(NodeVersion::new_interior()),
            child: std::array::from_fn(|_| AtomicPtr::new(null_mut())),
        }))
    }

    pub(crate) fn child(&self, i: usize) -> *mut NodeHeader {
        self.child[i].load(Acquire)
    }

    pub(crate) fn set_child(&self, i: usize, child: *mut NodeHeader) {
        self.child[i].store(child, Release);
    }

    /// Picks the child covering the key's slice at `offset` and advances
    /// `offset` past it. Race-tolerant: the caller revalidates against the
    /// version word before trusting the result.
    pub(crate) fn locate_child(&self, key: &[u8], offset: &mut usize) -> *mut NodeHeader {
        let (slice, _) = slice_at(key, *offset);
        *offset = (*offset + 8).min(key.len());

        let perm = self.base.permutation();
        let mut first = 0;
        let mut count = perm.count();
        while count > 0 {
            let half = count >> 1;
            let middle = first + half;
            if self.base.keyslice(perm.get(middle)) <= slice {
                first = middle + 1;
                count -= half + 1;
            } else {
                count = half;
            }
        }
        if first == 0 {
            self.child(0)
        } else {
            self.child(perm.get(first - 1) + 1)
        }
    }

    /// Inserts a fence and the child covering slices at and above it.
    /// Requires the node locked.
    pub(crate) fn insert_fence(&self, fence: u64, child: *mut NodeHeader) -> InsertOutcome {
        let v = self.base.version();
        debug_assert!(v.is_locked() && !v.is_border());

        let perm = self.base.permutation();
        let count = perm.count();
        let mut low = 0i32;
        let mut high = count as i32 - 1;
        while low <= high {
            let mid = (low + high) / 2;
            let slice = self.base.keyslice(perm.get(mid as usize));
            match slice.cmp(&fence) {
                Equal => unreachable!("duplicate fence {fence:#018x} in interior node"),
                Less => low = mid + 1,
                Greater => high = mid - 1,
            }
        }
        if count == MAX_KEYS {
            return InsertOutcome::Full;
        }

        self.base.set_version(v.inserting());
        self.base.set_keyslice(count, fence);
        self.set_child(count + 1, child);
        self.base.set_permutation(perm.inserted(low as usize, count));
        InsertOutcome::Inserted
    }
}

impl fmt::Debug for InteriorNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let perm = self.base.permutation();
        let mut list = f.debug_list();
        list.entry(&self.child(0));
        for phys in perm.entries() {
            list.entry(&hex::encode(self.base.keyslice(phys).to_be_bytes()));
            list.entry(&self.child(phys + 1));
        }
        list.finish()
    }
}

/// A leaf of one layer. Each live slot is either a data entry (owned
/// key/value record, tagged with the slice class) or a LINK to the root of
/// the next layer. Border nodes of one layer form a doubly linked chain in
/// key order.
#[repr(C)]
pub(crate) struct BorderNode<V> {
    pub(crate) base: NodeHeader,
    nremoved: AtomicU8,
    keylen: [AtomicU8; MAX_KEYS],
    lv: [AtomicPtr<()>; MAX_KEYS],
    prev: AtomicPtr<BorderNode<V>>,
    next: AtomicPtr<BorderNode<V>>,
    _entries: PhantomData<Entry<V>>,
}

impl<V> BorderNode<V> {
    pub(crate) fn alloc(root: bool) -> *mut BorderNode<V> {
        let mut version = NodeVersion::new_border();
        if root {
            version = version.rooted();
        }
        Box::into_raw(Box::new(Self {
            base: NodeHeader::new(version),
            nremoved: AtomicU8::new(0),
            keylen: std::array::from_fn(|_| AtomicU8::new(0)),
            lv: std::array::from_fn(|_| AtomicPtr::new(null_mut())),
            prev: AtomicPtr::new(null_mut()),
            next: AtomicPtr::new(null_mut()),
            _entries: PhantomData,
        }))
    }

    pub(crate) fn next(&self) -> *mut BorderNode<V> {
        self.next.load(Acquire)
    }

    pub(crate) fn prev(&self) -> *mut BorderNode<V> {
        self.prev.load(Acquire)
    }

    fn set_next(&self, next: *mut BorderNode<V>) {
        self.next.store(next, Release);
    }

    fn set_prev(&self, prev: *mut BorderNode<V>) {
        self.prev.store(prev, Release);
    }

    pub(crate) fn keylen(&self, phys: usize) -> u8 {
        self.keylen[phys].load(Acquire)
    }

    fn set_keylen(&self, phys: usize, keylen: u8) {
        self.keylen[phys].store(keylen, Release);
    }

    pub(crate) fn lv(&self, phys: usize) -> *mut () {
        self.lv[phys].load(Acquire)
    }

    fn set_lv(&self, phys: usize, lv: *mut ()) {
        self.lv[phys].store(lv, Release);
    }

    pub(crate) fn nremoved(&self) -> u8 {
        self.nremoved.load(Relaxed)
    }

    /// Binary-searches the logical view for `(slice, class)` and returns
    /// the hit plus the logical insertion position on a miss. Entries are
    /// unique and ordered by that pair, which is how keys of different
    /// residual lengths with equal padded slices coexist.
    pub(crate) fn locate(&self, perm: Permutation, slice: u64, class: u8) -> (SlotHit, usize) {
        let mut low = 0i32;
        let mut high = perm.count() as i32 - 1;
        while low <= high {
            let mid = (low + high) / 2;
            let phys = perm.get(mid as usize);
            let keylen = self.keylen(phys);
            match (self.base.keyslice(phys), class_of(keylen)).cmp(&(slice, class)) {
                Equal => {
                    let hit = if keylen == KEYLEN_LINK {
                        SlotHit::Link { phys }
                    } else {
                        SlotHit::Data { phys }
                    };
                    return (hit, mid as usize);
                }
                Less => low = mid + 1,
                Greater => high = mid - 1,
            }
        }
        (SlotHit::Miss, low as usize)
    }

    /// Inserts an owned entry at this layer. Requires the node locked; the
    /// entry is only consumed on `Inserted`.
    ///
    /// # Safety
    ///
    /// `entry` must point to a live record, as must the entry behind any
    /// colliding slot (guaranteed under the node lock).
    pub(crate) unsafe fn insert_entry(&self, off: usize, entry: *mut Entry<V>) -> InsertOutcome {
        let v = self.base.version();
        debug_assert!(v.is_locked() && v.is_border());

        let key = &(&(*entry).key)[..];
        let (slice, class) = slice_at(key, off);
        let perm = self.base.permutation();
        let (hit, pos) = self.locate(perm, slice, class);
        match hit {
            SlotHit::Link { phys } => {
                return InsertOutcome::AlreadyLinked(self.lv(phys) as *mut NodeHeader)
            }
            SlotHit::Data { phys } => {
                if class < 8 {
                    // a short final slice identifies the whole remaining key
                    return InsertOutcome::Existed;
                }
                let other = &*(self.lv(phys) as *mut Entry<V>);
                return if other.key[off + 8..] == key[off + 8..] {
                    InsertOutcome::Existed
                } else {
                    InsertOutcome::Collides { phys }
                };
            }
            SlotHit::Miss => {}
        }

        let count = perm.count();
        if count == MAX_KEYS {
            return InsertOutcome::Full;
        }
        self.base.set_version(v.inserting());
        self.base.set_keyslice(count, slice);
        self.set_keylen(count, class);
        self.set_lv(count, entry as *mut ());
        self.base.set_permutation(perm.inserted(pos, count));
        InsertOutcome::Inserted
    }

    /// Inserts a LINK to a next-layer root whose keys all share `slice`.
    /// Used while building a promotion chain, so the node is locked, fresh
    /// and cannot already hold the slice.
    pub(crate) fn insert_link(&self, slice: u64, child: *mut NodeHeader) {
        let v = self.base.version();
        debug_assert!(v.is_locked() && v.is_border());

        let perm = self.base.permutation();
        let count = perm.count();
        let (hit, pos) = self.locate(perm, slice, 8);
        debug_assert!(matches!(hit, SlotHit::Miss) && count < MAX_KEYS);

        self.base.set_version(v.inserting());
        self.base.set_keyslice(count, slice);
        self.set_keylen(count, KEYLEN_LINK);
        self.set_lv(count, child as *mut ());
        self.base.set_permutation(perm.inserted(pos, count));
    }

    /// Converts the data entry in slot `phys` into a LINK to `child`.
    /// Requires the node locked. The LINK tag is published before the
    /// pointer so a racy reader can never pair a data tag with a node
    /// pointer and dereference it as an entry.
    pub(crate) fn replace_at_index(&self, phys: usize, child: *mut NodeHeader) {
        let v = self.base.version();
        debug_assert!(v.is_locked());
        self.base.set_version(v.inserting());
        self.set_keylen(phys, KEYLEN_LINK);
        self.set_lv(phys, child as *mut ());
    }

    /// Redirects the LINK pointing at `old` (a sub-layer root that has
    /// grown) to `new`. Requires the node locked.
    pub(crate) fn swap_link(&self, old: *mut NodeHeader, new: *mut NodeHeader) {
        let v = self.base.version();
        debug_assert!(v.is_locked());
        let perm = self.base.permutation();
        for phys in perm.entries() {
            if self.keylen(phys) == KEYLEN_LINK && self.lv(phys) as *mut NodeHeader == old {
                self.base.set_version(v.inserting());
                self.set_lv(phys, new as *mut ());
                return;
            }
        }
        unreachable!("no link to the grown sub-layer root in its owning border node");
    }

    /// True when the key's slice at `off` is at least this node's smallest
    /// slice, i.e. a split may have carried the key's position into this
    /// node. Race-tolerant value comparison only.
    pub(crate) fn include_key(&self, key: &[u8], off: usize) -> bool {
        let perm = self.base.permutation();
        if perm.count() == 0 {
            return false;
        }
        let (slice, _) = slice_at(key, off);
        slice >= self.base.keyslice(perm.get(0))
    }
}

impl<V> fmt::Debug for BorderNode<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let perm = self.base.permutation();
        let mut map = f.debug_map();
        for phys in perm.entries() {
            let slice = hex::encode(self.base.keyslice(phys).to_be_bytes());
            let keylen = self.keylen(phys);
            if keylen == KEYLEN_LINK {
                map.entry(&slice, &format_args!("link -> {:p}", self.lv(phys)));
            } else {
                map.entry(&slice, &format_args!("data /{keylen}"));
            }
        }
        map.entry(&"nremoved", &self.nremoved());
        map.entry(&"prev", &self.prev());
        map.entry(&"next", &self.next());
        map.finish()
    }
}

/// Splits a full, locked node. The new right sibling comes back locked and
/// splitting (it inherits the version word), together with the fence slice
/// separating the halves.
///
/// # Safety
///
/// `n` must be a live, locked, full node of this tree.
pub(crate) unsafe fn split_node<V>(n: *mut NodeHeader) -> (*mut NodeHeader, u64) {
    let v = (*n).version();
    debug_assert!(v.is_locked());
    let v = v.splitting();
    (*n).set_version(v);

    if v.is_border() {
        let bn = n as *mut BorderNode<V>;
        let bn1 = BorderNode::<V>::alloc(false);
        (*bn1).base.set_version(v);
        (*bn1).base.set_parent((*n).parent());
        let fence = border_split(bn, bn1);
        (bn1 as *mut NodeHeader, fence)
    } else {
        let inner = n as *mut InteriorNode;
        let inner1 = InteriorNode::alloc();
        (*inner1).base.set_version(v);
        (*inner1).base.set_parent((*n).parent());
        let fence = interior_split(inner, inner1);
        (inner1 as *mut NodeHeader, fence)
    }
}

/// Moves the upper half of `bn`'s entries into `bn1` and splices `bn1`
/// into the sibling chain, publishing `next` last. Returns the fence.
///
/// The split index starts at the 7/8 point and slides to the nearest spot
/// where the neighbouring slices differ: entries sharing a slice (they
/// differ only in class, at most nine of them) must stay on one side
/// because fences and sibling walks compare slices alone.
unsafe fn border_split<V>(bn: *mut BorderNode<V>, bn1: *mut BorderNode<V>) -> u64 {
    let left = &*bn;
    let right = &*bn1;
    let perm = left.base.permutation();
    assert_eq!(perm.count(), MAX_KEYS, "splitting a node that is not full");

    let mut slices = [0u64; MAX_KEYS];
    let mut lens = [0u8; MAX_KEYS];
    let mut vals: [*mut (); MAX_KEYS] = [null_mut(); MAX_KEYS];
    for (i, phys) in perm.entries().enumerate() {
        slices[i] = left.base.keyslice(phys);
        lens[i] = left.keylen(phys);
        vals[i] = left.lv(phys);
    }

    let mut split = 7;
    if slices[split - 1] == slices[split] {
        let mut up = split;
        while up < MAX_KEYS && slices[up - 1] == slices[up] {
            up += 1;
        }
        let mut down = split;
        while down > 1 && slices[down - 1] == slices[down] {
            down -= 1;
        }
        split = if up < MAX_KEYS { up } else { down };
        assert!(slices[split - 1] != slices[split]);
    }

    for i in 0..split {
        left.base.set_keyslice(i, slices[i]);
        left.set_keylen(i, lens[i]);
        left.set_lv(i, vals[i]);
    }
    for i in split..MAX_KEYS {
        let j = i - split;
        right.base.set_keyslice(j, slices[i]);
        right.set_keylen(j, lens[i]);
        right.set_lv(j, vals[i]);
        if lens[i] == KEYLEN_LINK {
            // moved sub-layer roots hang off the new sibling now
            (*(vals[i] as *mut NodeHeader)).set_parent(bn1 as *mut NodeHeader);
        }
    }
    left.base.set_permutation(Permutation::identity(split));
    right.base.set_permutation(Permutation::identity(MAX_KEYS - split));

    let old_next = left.next();
    right.set_prev(bn);
    right.set_next(old_next);
    if !old_next.is_null() {
        (*old_next).set_prev(bn1);
    }
    left.set_next(bn1);

    slices[split]
}

/// Moves the upper half of `inner`'s fences and children into `inner1`,
/// lifting the middle fence out (it is returned, not stored). Moved
/// children are re-parented to the new sibling.
unsafe fn interior_split(inner: *mut InteriorNode, inner1: *mut InteriorNode) -> u64 {
    let left = &*inner;
    let right = &*inner1;
    let perm = left.base.permutation();
    assert_eq!(perm.count(), MAX_KEYS, "splitting a node that is not full");

    let mut slices = [0u64; MAX_KEYS];
    let mut kids: [*mut NodeHeader; MAX_KEYS] = [null_mut(); MAX_KEYS];
    for (i, phys) in perm.entries().enumerate() {
        slices[i] = left.base.keyslice(phys);
        kids[i] = left.child(phys + 1);
    }

    for i in 0..7 {
        left.base.set_keyslice(i, slices[i]);
        left.set_child(i + 1, kids[i]);
    }
    let fence = slices[7];
    right.set_child(0, kids[7]);
    for i in 8..MAX_KEYS {
        let j = i - 8;
        right.base.set_keyslice(j, slices[i]);
        right.set_child(j + 1, kids[i]);
    }
    for kid in &kids[7..] {
        (**kid).set_parent(inner1 as *mut NodeHeader);
    }
    left.base.set_permutation(Permutation::identity(7));
    right.base.set_permutation(Permutation::identity(7));

    fence
}
