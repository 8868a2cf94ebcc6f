// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! A concurrent, in-memory Mass Tree: a B+-tree of tries mapping
//! arbitrary-length byte-string keys to values.
//!
//! The index is organized as a tree of *layers*. Each layer is a B+-tree
//! keyed by the 8-byte slice of the user key at a layer-specific offset;
//! when distinct keys share a full slice, the colliding border entry is
//! promoted into a link to a deeper layer that continues the comparison 8
//! bytes further in. Point lookups and inserts run concurrently from any
//! number of threads: readers validate optimistic version snapshots instead
//! of taking locks, and writers lock individual nodes only.
//!
//! ```
//! use masstree::{MassTree, PutResult};
//!
//! let tree = MassTree::new();
//! assert_eq!(tree.put(b"hello", 1)?, PutResult::Inserted);
//! assert_eq!(tree.put(b"hello", 2)?, PutResult::Existed);
//! assert_eq!(tree.get(b"hello"), Some(&1));
//! assert_eq!(tree.get(b"world"), None);
//! # Ok::<(), masstree::MassTreeError>(())
//! ```
//!
//! Range scans, deletion and persistence are out of scope; entries live
//! until the tree is dropped.

mod node;
mod permutation;
mod tree;
mod version;

#[cfg(test)]
mod tests;

pub use tree::{MassTree, MassTreeError, PutResult, MAX_KEY_LEN};
