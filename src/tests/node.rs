// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

use proptest::prelude::*;

use crate::{
    node::{
        class_of, slice_at, split_node, BorderNode, Entry, InsertOutcome, InteriorNode, SlotHit,
        KEYLEN_LINK,
    },
    permutation::{Permutation, MAX_KEYS},
    version::NodeVersion,
};

fn new_entry(key: &[u8], value: u32) -> *mut Entry<u32> {
    Box::into_raw(Box::new(Entry {
        key: Box::from(key),
        value,
    }))
}

/// Frees a border node along with its data entries. Links are the caller's
/// responsibility.
unsafe fn free_border(border: *mut BorderNode<u32>) {
    let b = Box::from_raw(border);
    for phys in b.base.permutation().entries() {
        if b.keylen(phys) != KEYLEN_LINK {
            drop(Box::from_raw(b.lv(phys) as *mut Entry<u32>));
        }
    }
}

#[test]
fn slice_extraction() {
    assert_eq!(slice_at(b"ABCDEFGH", 0), (0x4142434445464748, 8));
    assert_eq!(slice_at(b"ABCDEFGHIJ", 0), (0x4142434445464748, 8));
    assert_eq!(slice_at(b"ABCDEFGHIJ", 8), (0x494a000000000000, 2));
    assert_eq!(slice_at(b"AB", 0), (0x4142000000000000, 2));
    assert_eq!(slice_at(b"", 0), (0, 0));
    assert_eq!(slice_at(b"AB", 2), (0, 0));
}

#[test]
fn keylen_classes() {
    for len in 0..=8 {
        assert_eq!(class_of(len), len);
    }
    assert_eq!(class_of(KEYLEN_LINK), 8);
}

#[test]
fn permutation_tracks_logical_order() {
    // mimic a node: physical slots append-only, logical order via the word
    let mut perm = Permutation::EMPTY;
    let mut slots: Vec<u64> = Vec::new();
    for (value, pos) in [(50u64, 0), (10, 0), (90, 2), (30, 1), (70, 3)] {
        let phys = slots.len();
        slots.push(value);
        perm = perm.inserted(pos, phys);
    }
    assert_eq!(perm.count(), 5);
    let logical: Vec<u64> = perm.entries().map(|phys| slots[phys]).collect();
    assert_eq!(logical, vec![10, 30, 50, 70, 90]);
}

#[test]
fn permutation_identity_maps_straight_through() {
    let perm = Permutation::identity(9);
    assert_eq!(perm.count(), 9);
    for i in 0..9 {
        assert_eq!(perm.get(i), i);
    }
}

#[test]
fn permutation_full_append() {
    let mut perm = Permutation::EMPTY;
    for i in 0..MAX_KEYS {
        perm = perm.inserted(i, i);
    }
    assert_eq!(perm.count(), MAX_KEYS);
    assert_eq!(perm.get(14), 14);
}

proptest! {
    #[test]
    fn permutation_matches_vec_insertion(positions in proptest::collection::vec(0..15usize, 1..=15)) {
        let mut perm = Permutation::EMPTY;
        let mut logical: Vec<usize> = Vec::new();
        for (phys, pos) in positions.iter().enumerate() {
            let pos = *pos % (logical.len() + 1);
            logical.insert(pos, phys);
            perm = perm.inserted(pos, phys);
        }
        prop_assert_eq!(perm.count(), logical.len());
        let via_perm: Vec<usize> = perm.entries().collect();
        prop_assert_eq!(via_perm, logical);
    }
}

#[test]
fn version_word_round_trips() {
    let v = NodeVersion::new_border().rooted();
    assert!(v.is_border() && v.is_root() && v.is_stable());
    assert!(!v.is_locked() && !v.is_deleted());
    let v = v.locked().inserting();
    assert!(v.is_locked() && v.is_inserting() && !v.is_stable());
    let v = v.clear_inserting().unlocked().unrooted();
    assert!(v.is_stable() && !v.is_root() && v.is_border());
}

#[test]
fn version_counters_wrap_within_their_fields() {
    let mut v = NodeVersion::new_border();
    for _ in 0..255 {
        v = v.bump_vinsert();
    }
    assert_eq!(v.vinsert(), 255);
    assert_eq!(v.vsplit(), 0);
    v = v.bump_vinsert();
    assert_eq!(v.vinsert(), 0);
    assert_eq!(v.vsplit(), 0);
    assert!(v.is_border());
}

#[test]
fn lock_commits_dirty_bits_into_counters() {
    unsafe {
        let n = BorderNode::<u32>::alloc(true);
        let base = &(*n).base;
        base.lock();
        assert!(base.version().is_locked());
        base.set_version(base.version().inserting());
        base.unlock();
        let v = base.version();
        assert!(!v.is_locked() && v.is_stable());
        assert_eq!(v.vinsert(), 1);
        assert_eq!(v.vsplit(), 0);

        // a critical section that split and then re-inserted commits both
        base.lock();
        base.set_version(base.version().inserting().splitting());
        base.unlock();
        let v = base.version();
        assert!(v.is_stable());
        assert_eq!(v.vinsert(), 2);
        assert_eq!(v.vsplit(), 1);
        free_border(n);
    }
}

#[test]
fn border_insert_and_lookup_outcomes() {
    unsafe {
        let n = BorderNode::<u32>::alloc(true);
        let border = &*n;
        border.base.lock();

        assert!(matches!(
            border.insert_entry(0, new_entry(b"apple", 1)),
            InsertOutcome::Inserted
        ));
        assert!(matches!(
            border.insert_entry(0, new_entry(b"banana", 2)),
            InsertOutcome::Inserted
        ));

        // the exact key again
        let dup = new_entry(b"apple", 3);
        assert!(matches!(border.insert_entry(0, dup), InsertOutcome::Existed));
        drop(Box::from_raw(dup));

        let perm = border.base.permutation();
        let (apple, _) = slice_at(b"apple", 0);
        assert!(matches!(
            border.locate(perm, apple, 5),
            (SlotHit::Data { .. }, _)
        ));
        let (missing, _) = slice_at(b"cherry", 0);
        assert!(matches!(border.locate(perm, missing, 6), (SlotHit::Miss, _)));

        border.base.unlock();
        free_border(n);
    }
}

#[test]
fn shared_slice_with_suffixes_collides() {
    unsafe {
        let n = BorderNode::<u32>::alloc(true);
        let border = &*n;
        border.base.lock();

        assert!(matches!(
            border.insert_entry(0, new_entry(b"prefix00suffixA", 1)),
            InsertOutcome::Inserted
        ));
        let clashing = new_entry(b"prefix00suffixB", 2);
        let phys = match border.insert_entry(0, clashing) {
            InsertOutcome::Collides { phys } => phys,
            _ => panic!("equal slices with differing suffixes must collide"),
        };

        // after promotion the slot becomes a link and further inserts of
        // that slice are told to descend
        let displaced = border.lv(phys) as *mut Entry<u32>;
        let deeper = BorderNode::<u32>::alloc(true);
        border.replace_at_index(phys, deeper as *mut _);
        match border.insert_entry(0, clashing) {
            InsertOutcome::AlreadyLinked(link) => assert_eq!(link, deeper as *mut _),
            _ => panic!("links must redirect inserts of their slice"),
        }

        drop(Box::from_raw(displaced));
        drop(Box::from_raw(clashing));
        drop(Box::from_raw(deeper));
        border.base.unlock();
        free_border(n);
    }
}

#[test]
fn prefix_keys_coexist_in_one_node() {
    unsafe {
        let n = BorderNode::<u32>::alloc(true);
        let border = &*n;
        border.base.lock();

        // same padded slice, different residual lengths
        assert!(matches!(
            border.insert_entry(0, new_entry(b"ab", 1)),
            InsertOutcome::Inserted
        ));
        assert!(matches!(
            border.insert_entry(0, new_entry(b"ab\0", 2)),
            InsertOutcome::Inserted
        ));

        let perm = border.base.permutation();
        assert_eq!(perm.count(), 2);
        let (slice, _) = slice_at(b"ab", 0);
        assert!(matches!(
            border.locate(perm, slice, 2),
            (SlotHit::Data { .. }, _)
        ));
        assert!(matches!(
            border.locate(perm, slice, 3),
            (SlotHit::Data { .. }, _)
        ));
        // shorter keys sort before longer ones of the same slice
        assert_eq!(class_of(border.keylen(perm.get(0))), 2);
        assert_eq!(class_of(border.keylen(perm.get(1))), 3);

        border.base.unlock();
        free_border(n);
    }
}

#[test]
fn border_insert_reports_full() {
    unsafe {
        let n = BorderNode::<u32>::alloc(true);
        let border = &*n;
        border.base.lock();
        for i in 0..MAX_KEYS as u8 {
            let key = [b'k', i];
            assert!(matches!(
                border.insert_entry(0, new_entry(&key, i as u32)),
                InsertOutcome::Inserted
            ));
        }
        let overflow = new_entry(b"zz", 99);
        assert!(matches!(border.insert_entry(0, overflow), InsertOutcome::Full));
        drop(Box::from_raw(overflow));
        border.base.unlock();
        free_border(n);
    }
}

#[test]
fn interior_routes_fences_inserted_out_of_order() {
    unsafe {
        let inner = InteriorNode::alloc();
        let interior = &*inner;
        interior.base.lock();

        let children: Vec<*mut BorderNode<u32>> =
            (0..4).map(|_| BorderNode::<u32>::alloc(false)).collect();
        interior.set_child(0, children[0] as *mut _);
        for (fence, child) in [(10u64, 1usize), (30, 3), (20, 2)] {
            assert!(matches!(
                interior.insert_fence(fence << 32, children[child] as *mut _),
                InsertOutcome::Inserted
            ));
        }

        for (probe, expect) in [(5u64, 0usize), (10, 1), (15, 1), (20, 2), (25, 2), (30, 3), (99, 3)] {
            let key = (probe << 32).to_be_bytes();
            let mut off = 0;
            let got = interior.locate_child(&key, &mut off);
            assert_eq!(got, children[expect] as *mut _, "probe {probe}");
            assert_eq!(off, 8);
        }

        interior.base.unlock();
        for child in children {
            drop(Box::from_raw(child));
        }
        drop(Box::from_raw(inner));
    }
}

#[test]
fn border_split_halves_and_splices() {
    unsafe {
        let n = BorderNode::<u32>::alloc(true);
        let border = &*n;
        border.base.lock();
        for i in 0..MAX_KEYS as u8 {
            let key = [i + 1];
            assert!(matches!(
                border.insert_entry(0, new_entry(&key, i as u32)),
                InsertOutcome::Inserted
            ));
        }

        let (right, fence) = split_node::<u32>(n as *mut _);
        // lower seven stay, upper eight move; the fence is the eighth key
        assert_eq!(fence, slice_at(&[8u8], 0).0);
        assert_eq!(border.base.permutation().count(), 7);
        assert_eq!((*right).permutation().count(), 8);
        assert!((*right).version().is_locked() && (*right).version().is_splitting());

        let right = right as *mut BorderNode<u32>;
        assert_eq!(border.next(), right);
        assert_eq!((*right).prev(), n);
        assert!((*right).next().is_null());

        border.base.unlock();
        (*right).base.unlock();
        assert_eq!(border.base.version().vsplit(), 1);
        free_border(n);
        free_border(right);
    }
}

#[test]
fn border_split_keeps_slice_families_together() {
    unsafe {
        let n = BorderNode::<u32>::alloc(true);
        let border = &*n;
        border.base.lock();
        // nine keys sharing slice 0 (zero-byte runs of lengths 0..=8)...
        for len in 0..=8usize {
            let key = vec![0u8; len];
            assert!(matches!(
                border.insert_entry(0, new_entry(&key, len as u32)),
                InsertOutcome::Inserted
            ));
        }
        // ...and six keys with distinct larger slices
        for c in [b'a', b'b', b'c', b'd', b'e', b'f'] {
            assert!(matches!(
                border.insert_entry(0, new_entry(&[c], c as u32)),
                InsertOutcome::Inserted
            ));
        }

        let (right, fence) = split_node::<u32>(n as *mut _);
        // the split point slides past the family: the whole slice-0 run
        // stays left and the fence is the first lettered slice
        assert_eq!(fence, slice_at(b"a", 0).0);
        assert_eq!(border.base.permutation().count(), 9);
        assert_eq!((*right).permutation().count(), 6);

        border.base.unlock();
        (*right).unlock();
        free_border(n);
        free_border(right as *mut BorderNode<u32>);
    }
}

#[test]
fn include_key_compares_against_smallest_slice() {
    unsafe {
        let n = BorderNode::<u32>::alloc(true);
        let border = &*n;
        border.base.lock();
        assert!(!border.include_key(b"anything", 0));
        assert!(matches!(
            border.insert_entry(0, new_entry(b"mm", 1)),
            InsertOutcome::Inserted
        ));
        border.base.unlock();

        assert!(border.include_key(b"mm", 0));
        assert!(border.include_key(b"zz", 0));
        assert!(!border.include_key(b"aa", 0));
        free_border(n);
    }
}
