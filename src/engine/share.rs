use crate::{
    hash_tree::{self, leaf_digest, IncompleteHashTree},
    Geometry, StorageServer,
};
use bytes::Bytes;
use commonware_cryptography::Hasher;
use std::collections::BTreeMap;
use std::time::Duration;

/// Outcome of offering a server-reported geometry to [CommonState::adopt].
#[derive(Debug, PartialEq, Eq)]
pub(super) enum Adoption {
    /// The geometry became (or confirmed) the authoritative one.
    Adopted,

    /// An authoritative geometry was already known and matches.
    Unchanged,

    /// An authoritative geometry was already known and disagrees.
    Conflicting(Geometry),
}

/// State shared by every share of one file: the geometry and the share hash tree
/// pinned to the capability's root.
pub(super) struct CommonState<H: Hasher> {
    geometry: Geometry,
    authoritative: bool,
    share_tree: IncompleteHashTree<H>,
}

impl<H: Hasher> CommonState<H> {
    pub fn new(
        hasher: &mut H,
        root_hash: H::Digest,
        total_shares: u16,
        guessed: Geometry,
    ) -> Self {
        let mut share_tree = IncompleteHashTree::new(hasher, total_shares as usize);
        // A fresh tree has an unknown root, so pinning cannot conflict.
        let _ = share_tree.set_root(root_hash);
        Self {
            geometry: guessed,
            authoritative: false,
            share_tree,
        }
    }

    /// The current geometry (guessed until [CommonState::authoritative]).
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Whether a server-reported geometry has been adopted.
    pub fn authoritative(&self) -> bool {
        self.authoritative
    }

    /// Offer a server-reported geometry. The first report wins for the remainder of
    /// the download; later disagreeing reports mark their source untrustworthy.
    pub fn adopt(&mut self, geometry: Geometry) -> Adoption {
        if self.authoritative {
            if geometry == self.geometry {
                return Adoption::Unchanged;
            }
            return Adoption::Conflicting(self.geometry);
        }
        self.geometry = geometry;
        self.authoritative = true;
        Adoption::Adopted
    }

    /// The share-tree indices that must be fetched alongside a block from `shnum`,
    /// including the share root leaf itself if unknown.
    pub fn needed_share_hashes(&self, shnum: u16) -> Result<Vec<usize>, hash_tree::Error> {
        self.share_tree.needed_hashes(shnum as usize, true)
    }

    /// The validated root of `shnum`'s block tree, if known.
    pub fn share_root(&self, shnum: u16) -> Option<H::Digest> {
        self.share_tree.leaf(shnum as usize)
    }

    /// Validate a share proof fetched from a server and return `shnum`'s share root.
    ///
    /// The server returns `(index, digest)` pairs covering the wanted indices; the
    /// pair at the leaf index is the claimed share root, everything else is chain.
    pub fn absorb_share_proof(
        &mut self,
        hasher: &mut H,
        shnum: u16,
        pairs: Vec<(usize, H::Digest)>,
    ) -> Result<H::Digest, hash_tree::Error> {
        let leaf_index = self.share_tree.leaf_index(shnum as usize);
        let mut proof = BTreeMap::new();
        let mut leaves = BTreeMap::new();
        for (i, d) in pairs {
            if i == leaf_index {
                leaves.insert(shnum as usize, d);
            } else {
                proof.insert(i, d);
            }
        }
        self.share_tree.set_hashes(hasher, proof, leaves)?;
        self.share_tree
            .leaf(shnum as usize)
            .ok_or(hash_tree::Error::NotEnoughHashes)
    }
}

/// One (server, share-number) binding: the handle used to fetch this share's blocks
/// and the block hash tree they are validated against.
pub(super) struct Share<H: Hasher, S: StorageServer<Digest = H::Digest>> {
    /// The server holding this share.
    pub server: S,

    /// The share number.
    pub shnum: u16,

    /// Most recently observed round-trip time to the server.
    pub rtt: Duration,

    block_tree: Option<IncompleteHashTree<H>>,
}

impl<H: Hasher, S: StorageServer<Digest = H::Digest>> Share<H, S> {
    pub fn new(server: S, shnum: u16, rtt: Duration) -> Self {
        Self {
            server,
            shnum,
            rtt,
            block_tree: None,
        }
    }

    /// Create the block tree once the segment count is authoritative.
    pub fn ensure_tree(&mut self, hasher: &mut H, num_segments: u64) {
        if self.block_tree.is_none() {
            self.block_tree = Some(IncompleteHashTree::new(hasher, num_segments as usize));
        }
    }

    /// The block-tree indices that must be fetched alongside block `segnum`.
    ///
    /// The root is excluded: it is this share's leaf of the share tree and arrives
    /// via the share proof instead.
    pub fn needed_block_hashes(&self, segnum: u64) -> Result<Vec<usize>, hash_tree::Error> {
        let Some(tree) = &self.block_tree else {
            return Err(hash_tree::Error::NotEnoughHashes);
        };
        let mut wanted = tree.needed_hashes(segnum as usize, false)?;
        wanted.retain(|&i| i != 0);
        Ok(wanted)
    }

    /// Validate block `segnum` against this share's tree, anchored at the share root
    /// proven by the share tree. Any failure means the share served corrupt data.
    pub fn validate_block(
        &mut self,
        hasher: &mut H,
        share_root: H::Digest,
        segnum: u64,
        proof: Vec<(usize, H::Digest)>,
        block: &Bytes,
    ) -> Result<(), hash_tree::Error> {
        let Some(tree) = &mut self.block_tree else {
            return Err(hash_tree::Error::NotEnoughHashes);
        };
        tree.set_root(share_root)?;
        let proof: BTreeMap<usize, H::Digest> = proof.into_iter().collect();
        let mut leaves = BTreeMap::new();
        leaves.insert(segnum as usize, leaf_digest(hasher, block));
        tree.set_hashes(hasher, proof, leaves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hash_tree::HashTree, StorageIndex};
    use commonware_cryptography::{Hasher as _, Sha256};

    /// A server handle that is never called; share-level validation is pure.
    #[derive(Clone)]
    struct Null;

    impl StorageServer for Null {
        type Id = String;
        type Digest = <Sha256 as commonware_cryptography::Hasher>::Digest;
        type Error = std::io::Error;

        fn id(&self) -> String {
            "null".into()
        }

        async fn enumerate(&mut self, _: &StorageIndex) -> Result<Vec<u16>, Self::Error> {
            unimplemented!()
        }

        async fn geometry(&mut self, _: &StorageIndex, _: u16) -> Result<Geometry, Self::Error> {
            unimplemented!()
        }

        async fn share_proof(
            &mut self,
            _: &StorageIndex,
            _: Vec<usize>,
        ) -> Result<Vec<(usize, Self::Digest)>, Self::Error> {
            unimplemented!()
        }

        async fn block_proof(
            &mut self,
            _: &StorageIndex,
            _: u16,
            _: Vec<usize>,
        ) -> Result<Vec<(usize, Self::Digest)>, Self::Error> {
            unimplemented!()
        }

        async fn block(&mut self, _: &StorageIndex, _: u16, _: u64) -> Result<Bytes, Self::Error> {
            unimplemented!()
        }
    }

    #[test]
    fn test_adopt_first_report_wins() {
        let mut hasher = Sha256::new();
        let root = leaf_digest(&mut hasher, b"root");
        let guessed = Geometry {
            segment_size: 4,
            num_segments: 3,
        };
        let mut common = CommonState::<Sha256>::new(&mut hasher, root, 10, guessed);
        assert!(!common.authoritative());
        assert_eq!(common.geometry(), guessed);

        let real = Geometry {
            segment_size: 6,
            num_segments: 2,
        };
        assert_eq!(common.adopt(real), Adoption::Adopted);
        assert!(common.authoritative());
        assert_eq!(common.geometry(), real);
        assert_eq!(common.adopt(real), Adoption::Unchanged);
        assert_eq!(common.adopt(guessed), Adoption::Conflicting(real));
        assert_eq!(common.geometry(), real);
    }

    #[test]
    fn test_share_proof_round_trip() {
        let mut hasher = Sha256::new();

        // Build the "real" trees the way an uploader would.
        let blocks: Vec<Bytes> = (0..4u8).map(|i| Bytes::from(vec![i; 8])).collect();
        let block_leaves: Vec<_> = blocks.iter().map(|b| leaf_digest(&mut hasher, b)).collect();
        let block_tree = HashTree::<Sha256>::new(&mut hasher, block_leaves);
        let total_shares = 6u16;
        let share_roots: Vec<_> = (0..total_shares)
            .map(|i| {
                if i == 2 {
                    block_tree.root()
                } else {
                    leaf_digest(&mut hasher, format!("other-{i}").as_bytes())
                }
            })
            .collect();
        let share_tree = HashTree::<Sha256>::new(&mut hasher, share_roots);

        let guessed = Geometry {
            segment_size: 8,
            num_segments: 4,
        };
        let mut common =
            CommonState::<Sha256>::new(&mut hasher, share_tree.root(), total_shares, guessed);

        // Prove share 2's root, then a block against it.
        let wanted = common.needed_share_hashes(2).unwrap();
        let pairs: Vec<_> = wanted
            .into_iter()
            .map(|i| (i, share_tree.node(i).unwrap()))
            .collect();
        let share_root = common.absorb_share_proof(&mut hasher, 2, pairs).unwrap();
        assert_eq!(share_root, block_tree.root());

        let mut share = Share::<Sha256, Null>::new(Null, 2, Duration::ZERO);
        share.ensure_tree(&mut hasher, 4);
        let wanted = share.needed_block_hashes(1).unwrap();
        let proof: Vec<_> = wanted
            .into_iter()
            .map(|i| (i, block_tree.node(i).unwrap()))
            .collect();
        share
            .validate_block(&mut hasher, share_root, 1, proof, &blocks[1])
            .unwrap();

        // A tampered block fails.
        let wanted = share.needed_block_hashes(2).unwrap();
        let proof: Vec<_> = wanted
            .into_iter()
            .map(|i| (i, block_tree.node(i).unwrap()))
            .collect();
        let tampered = Bytes::from_static(b"not the block");
        assert!(share
            .validate_block(&mut hasher, share_root, 2, proof, &tampered)
            .is_err());
    }
}
