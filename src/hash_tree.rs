//! Merkle trees over an ordered list of digests, validated incrementally.
//!
//! # Terminology
//!
//! A tree over `n` leaves is stored as a flat array indexed as a complete binary tree:
//! the root is index 0 and the children of index `i` are `2i+1` and `2i+2`. The leaf
//! row is padded to the next power of two with deterministic "empty leaf" digests so a
//! partial list still yields a deterministic root. Leaves are domain-separated from
//! internal nodes, and empty leaves from real ones, so no valid subtree can be
//! reinterpreted as another.
//!
//! A [HashTree] is built from a complete leaf list and knows every node. An
//! [IncompleteHashTree] starts with only the padding known (plus a pinned root, if
//! any) and is filled in from proofs supplied by untrusted servers: each slot is
//! write-once, and a newly supplied leaf is only kept once recomputing parents links
//! it to a previously-trusted node. A recomputed parent that disagrees with a stored
//! value is the corruption signal, never a silent overwrite.

use commonware_cryptography::Hasher;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Errors that can occur when validating hashes against a tree.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// A recomputed digest disagrees with a previously-stored value.
    #[error("hash mismatch")]
    BadHash,

    /// A supplied leaf cannot be linked to any trusted node yet.
    #[error("not enough hashes to validate leaf")]
    NotEnoughHashes,

    /// A node or leaf index is outside the tree.
    #[error("index out of range: {0}")]
    OutOfRange(usize),
}

const LEAF_TAG: &[u8] = &[0u8];
const NODE_TAG: &[u8] = &[1u8];
const EMPTY_LEAF_TAG: &[u8] = &[2u8];

/// Compute the digest of a real leaf.
pub fn leaf_digest<H: Hasher>(hasher: &mut H, data: &[u8]) -> H::Digest {
    hasher.update(LEAF_TAG);
    hasher.update(data);
    hasher.finalize()
}

/// Compute the digest of an internal node from its children.
pub fn node_digest<H: Hasher>(hasher: &mut H, left: &H::Digest, right: &H::Digest) -> H::Digest {
    hasher.update(NODE_TAG);
    hasher.update(left.as_ref());
    hasher.update(right.as_ref());
    hasher.finalize()
}

/// Compute the digest of the padding leaf at `leafnum`.
///
/// Including the leaf number makes every padding leaf distinct, so padded trees of
/// different widths never share subtrees.
pub fn empty_leaf_digest<H: Hasher>(hasher: &mut H, leafnum: usize) -> H::Digest {
    hasher.update(EMPTY_LEAF_TAG);
    hasher.update(&(leafnum as u64).to_be_bytes());
    hasher.finalize()
}

/// The sibling of a non-root node.
fn sibling(i: usize) -> usize {
    if i % 2 == 1 {
        i + 1
    } else {
        i - 1
    }
}

/// The parent of a non-root node.
fn parent(i: usize) -> usize {
    (i - 1) / 2
}

/// Number of leaf slots (including padding) for `n` real leaves.
fn span(n: usize) -> usize {
    n.next_power_of_two()
}

/// A fully-known merkle tree.
///
/// Nodes are stored root-first: index 0 is the root and the leaf row occupies the
/// last `span` slots.
#[derive(Clone, Debug)]
pub struct HashTree<H: Hasher> {
    nodes: Vec<H::Digest>,
    num_leaves: usize,
}

impl<H: Hasher> HashTree<H> {
    /// Build a complete tree over `leaves`.
    ///
    /// Panics if `leaves` is empty.
    pub fn new(hasher: &mut H, leaves: Vec<H::Digest>) -> Self {
        assert!(!leaves.is_empty(), "tree must have at least one leaf");
        let num_leaves = leaves.len();
        let span = span(num_leaves);

        // Pad the leaf row, then derive each level bottom-up.
        let mut row = leaves;
        for leafnum in num_leaves..span {
            row.push(empty_leaf_digest(hasher, leafnum));
        }
        let mut rows = Vec::new();
        let mut current = row;
        while current.len() > 1 {
            let mut above = Vec::with_capacity(current.len() / 2);
            for pair in current.chunks(2) {
                above.push(node_digest(hasher, &pair[0], &pair[1]));
            }
            rows.push(current);
            current = above;
        }
        rows.push(current);

        // Root-first flattening matches the array indexing.
        let nodes = rows.into_iter().rev().flatten().collect();
        Self { nodes, num_leaves }
    }

    /// The number of real (non-padding) leaves.
    pub fn num_leaves(&self) -> usize {
        self.num_leaves
    }

    /// The root digest.
    pub fn root(&self) -> H::Digest {
        self.nodes[0].clone()
    }

    /// The array index of leaf `leafnum`.
    pub fn leaf_index(&self, leafnum: usize) -> usize {
        span(self.num_leaves) - 1 + leafnum
    }

    /// The digest stored at array index `i`.
    pub fn node(&self, i: usize) -> Result<H::Digest, Error> {
        self.nodes.get(i).cloned().ok_or(Error::OutOfRange(i))
    }

    /// The sibling indices needed to recompute the root from node `i`.
    pub fn needed_for(&self, i: usize) -> Result<Vec<usize>, Error> {
        needed_for(self.nodes.len(), i)
    }
}

/// The sibling indices on the path from node `i` to the root of a tree with `size`
/// nodes, ordered leaf-adjacent first.
fn needed_for(size: usize, i: usize) -> Result<Vec<usize>, Error> {
    if i >= size {
        return Err(Error::OutOfRange(i));
    }
    let mut chain = Vec::new();
    let mut i = i;
    while i > 0 {
        chain.push(sibling(i));
        i = parent(i);
    }
    Ok(chain)
}

/// A merkle tree filled in lazily from untrusted proofs.
///
/// Every known slot is trusted: padding digests are derived locally, the root may be
/// pinned from a capability, and everything else is only stored after a supplied leaf
/// chains up to an already-trusted node. Slots are write-once; a conflicting write is
/// [Error::BadHash].
#[derive(Clone, Debug)]
pub struct IncompleteHashTree<H: Hasher> {
    nodes: Vec<Option<H::Digest>>,
    num_leaves: usize,
}

impl<H: Hasher> IncompleteHashTree<H> {
    /// Create a tree over `num_leaves` leaves with only the padding known.
    ///
    /// Panics if `num_leaves` is zero.
    pub fn new(hasher: &mut H, num_leaves: usize) -> Self {
        assert!(num_leaves > 0, "tree must have at least one leaf");
        let span = span(num_leaves);
        let size = 2 * span - 1;
        let first_leaf = span - 1;
        let mut nodes: Vec<Option<H::Digest>> = vec![None; size];
        for leafnum in num_leaves..span {
            nodes[first_leaf + leafnum] = Some(empty_leaf_digest(hasher, leafnum));
        }

        // Derive any internal nodes that depend only on padding.
        for p in (0..first_leaf).rev() {
            if nodes[p].is_none() {
                if let (Some(l), Some(r)) = (&nodes[2 * p + 1], &nodes[2 * p + 2]) {
                    nodes[p] = Some(node_digest(hasher, l, r));
                }
            }
        }
        Self { nodes, num_leaves }
    }

    /// The number of real (non-padding) leaves.
    pub fn num_leaves(&self) -> usize {
        self.num_leaves
    }

    /// The array index of leaf `leafnum`.
    pub fn leaf_index(&self, leafnum: usize) -> usize {
        span(self.num_leaves) - 1 + leafnum
    }

    /// Pin the root to a trusted digest (typically from a capability).
    ///
    /// Fails with [Error::BadHash] if a different root is already known.
    pub fn set_root(&mut self, root: H::Digest) -> Result<(), Error> {
        match &self.nodes[0] {
            Some(existing) if *existing != root => Err(Error::BadHash),
            Some(_) => Ok(()),
            None => {
                self.nodes[0] = Some(root);
                Ok(())
            }
        }
    }

    /// The root digest, if known.
    pub fn root(&self) -> Option<H::Digest> {
        self.nodes[0].clone()
    }

    /// The digest stored at array index `i`, if known.
    pub fn node(&self, i: usize) -> Option<H::Digest> {
        self.nodes.get(i).cloned().flatten()
    }

    /// The digest of leaf `leafnum`, if known.
    pub fn leaf(&self, leafnum: usize) -> Option<H::Digest> {
        self.node(self.leaf_index(leafnum))
    }

    /// The sibling indices needed to recompute the root from node `i`.
    pub fn needed_for(&self, i: usize) -> Result<Vec<usize>, Error> {
        needed_for(self.nodes.len(), i)
    }

    /// The indices that must still be fetched to validate leaf `leafnum`: the unknown
    /// subset of its proof chain, plus the root if unknown, plus (optionally) the leaf
    /// itself. Returned in ascending order.
    pub fn needed_hashes(&self, leafnum: usize, include_leaf: bool) -> Result<Vec<usize>, Error> {
        if leafnum >= self.num_leaves {
            return Err(Error::OutOfRange(leafnum));
        }
        let leaf = self.leaf_index(leafnum);
        let mut wanted: Vec<usize> = needed_for(self.nodes.len(), leaf)?;
        wanted.push(0);
        if include_leaf {
            wanted.push(leaf);
        }
        let mut wanted: Vec<usize> = wanted
            .into_iter()
            .filter(|&i| self.nodes[i].is_none())
            .collect();
        wanted.sort_unstable();
        wanted.dedup();
        Ok(wanted)
    }

    /// Write unknown slots from `hashes` (keyed by array index) and `leaves` (keyed by
    /// leaf number), then validate each newly-introduced leaf by recomputing parents
    /// until a previously-trusted node is reached.
    ///
    /// Fails with [Error::NotEnoughHashes] if a new leaf cannot reach a trusted node,
    /// and [Error::BadHash] if any recomputed or supplied digest disagrees with a
    /// stored one. On failure every slot written by this call is rolled back. Supplied
    /// hashes that no leaf chain certifies are discarded, never stored as trusted.
    pub fn set_hashes(
        &mut self,
        hasher: &mut H,
        hashes: BTreeMap<usize, H::Digest>,
        leaves: BTreeMap<usize, H::Digest>,
    ) -> Result<(), Error> {
        let size = self.nodes.len();
        let first_leaf = span(self.num_leaves) - 1;

        // Merge both maps into one indexed by array position, rejecting bad indices
        // and internal conflicts before any slot is written.
        let mut merged: BTreeMap<usize, H::Digest> = BTreeMap::new();
        for (&i, d) in &hashes {
            if i >= size {
                return Err(Error::OutOfRange(i));
            }
            merged.insert(i, d.clone());
        }
        let mut leaf_indices = Vec::with_capacity(leaves.len());
        for (&leafnum, d) in &leaves {
            if leafnum >= self.num_leaves {
                return Err(Error::OutOfRange(leafnum));
            }
            let i = first_leaf + leafnum;
            if let Some(existing) = merged.get(&i) {
                if existing != d {
                    return Err(Error::BadHash);
                }
            }
            merged.insert(i, d.clone());
            leaf_indices.push(i);
        }

        let mut added = Vec::new();
        let mut provisional = HashSet::new();
        let result = self.absorb(hasher, merged, &leaf_indices, &mut added, &mut provisional);
        match result {
            Ok(()) => {
                // Whatever no chain certified is dropped.
                for i in added {
                    if provisional.contains(&i) {
                        self.nodes[i] = None;
                    }
                }
                Ok(())
            }
            Err(err) => {
                for i in added {
                    self.nodes[i] = None;
                }
                Err(err)
            }
        }
    }

    fn absorb(
        &mut self,
        hasher: &mut H,
        merged: BTreeMap<usize, H::Digest>,
        leaf_indices: &[usize],
        added: &mut Vec<usize>,
        provisional: &mut HashSet<usize>,
    ) -> Result<(), Error> {
        // Write-once: a conflicting value for a known slot is corruption, a matching
        // value is a no-op.
        for (i, d) in merged {
            match &self.nodes[i] {
                Some(existing) if *existing != d => return Err(Error::BadHash),
                Some(_) => {}
                None => {
                    self.nodes[i] = Some(d);
                    added.push(i);
                    provisional.insert(i);
                }
            }
        }

        // Climb from each new leaf, recomputing parents, until an already-trusted
        // node confirms the chain. A trusted parent certifies both children, so the
        // whole visited path (siblings included) graduates to trusted.
        for &leaf in leaf_indices {
            if !provisional.contains(&leaf) {
                // Already trusted; the write-once check above compared it.
                continue;
            }
            let mut path = vec![leaf];
            let mut i = leaf;
            loop {
                if i == 0 {
                    // A provisional root has no anchor.
                    return Err(Error::NotEnoughHashes);
                }
                let p = parent(i);
                let (Some(l), Some(r)) = (self.nodes[2 * p + 1].clone(), self.nodes[2 * p + 2].clone())
                else {
                    return Err(Error::NotEnoughHashes);
                };
                let derived = node_digest(hasher, &l, &r);
                match &self.nodes[p] {
                    Some(existing) => {
                        if *existing != derived {
                            return Err(Error::BadHash);
                        }
                    }
                    None => {
                        self.nodes[p] = Some(derived);
                        added.push(p);
                        provisional.insert(p);
                    }
                }
                path.push(sibling(i));
                path.push(p);
                if !provisional.contains(&p) {
                    break;
                }
                i = p;
            }
            for i in path {
                provisional.remove(&i);
            }
        }
        Ok(())
    }
}
