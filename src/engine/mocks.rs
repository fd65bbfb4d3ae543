//! Test doubles: an in-memory storage grid and the trees an uploader would build.
//!
//! The "erasure coding" here is a stand-in: every share carries the whole segment
//! behind a two-byte share-number prefix, and [Codec] checks the block count and
//! strips the prefix. That is enough to exercise discovery, scheduling, validation,
//! and reassembly without a real code.

use super::Config;
use crate::{
    hash_tree::{leaf_digest, HashTree},
    Geometry, StorageIndex, StorageServer,
};
use bytes::{BufMut, Bytes, BytesMut};
use commonware_cryptography::{sha256, Hasher as _, Sha256};
use commonware_runtime::Clock;
use futures::{channel::mpsc, future, SinkExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the mock grid.
#[derive(Error, Debug)]
pub enum Error {
    #[error("server failure")]
    Server,

    #[error("unknown share: {0}")]
    UnknownShare(u16),

    #[error("wrong number of blocks: {0}")]
    WrongBlockCount(usize),

    #[error("block carries the wrong share number")]
    WrongShare,
}

/// One share's blocks and the tree committing them.
#[derive(Clone)]
struct EncodedShare {
    blocks: Vec<Bytes>,
    tree: HashTree<Sha256>,
}

/// A file prepared for the mock grid: per-share blocks, per-share block trees, and
/// the share tree whose root is the capability's trust anchor.
pub struct Encoded {
    pub geometry: Geometry,
    pub file_size: u64,
    pub needed_shares: u16,
    pub total_shares: u16,
    pub share_tree: HashTree<Sha256>,
    shares: Vec<EncodedShare>,
}

/// Prepare a file the way an uploader would.
pub fn encode(needed_shares: u16, total_shares: u16, segment_size: u64, data: &[u8]) -> Encoded {
    assert!(needed_shares > 0 && needed_shares <= total_shares);
    assert!(segment_size > 0);
    let mut hasher = Sha256::new();
    let mut segments: Vec<&[u8]> = data.chunks(segment_size as usize).collect();
    if segments.is_empty() {
        segments.push(&[]);
    }
    let mut shares = Vec::with_capacity(total_shares as usize);
    for shnum in 0..total_shares {
        let blocks: Vec<Bytes> = segments
            .iter()
            .map(|segment| {
                let mut block = BytesMut::with_capacity(2 + segment.len());
                block.put_u16(shnum);
                block.put_slice(segment);
                block.freeze()
            })
            .collect();
        let leaves = blocks.iter().map(|b| leaf_digest(&mut hasher, b)).collect();
        let tree = HashTree::new(&mut hasher, leaves);
        shares.push(EncodedShare { blocks, tree });
    }
    let roots = shares.iter().map(|s| s.tree.root()).collect();
    let share_tree = HashTree::new(&mut hasher, roots);
    Encoded {
        geometry: Geometry {
            segment_size,
            num_segments: segments.len() as u64,
        },
        file_size: data.len() as u64,
        needed_shares,
        total_shares,
        share_tree,
        shares,
    }
}

impl Encoded {
    /// A capability for this file. `segment_size_guess` need not match the real
    /// segment size; the engine must recover from a wrong guess.
    pub fn config(
        &self,
        storage_index: StorageIndex,
        segment_size_guess: u64,
    ) -> Config<sha256::Digest> {
        Config {
            storage_index,
            needed_shares: self.needed_shares,
            total_shares: self.total_shares,
            file_size: self.file_size,
            segment_size: segment_size_guess,
            root_hash: self.share_tree.root(),
            max_queries: 10,
            overdue_timeout: Duration::from_secs(2),
            mailbox_size: 16,
        }
    }
}

struct Inner {
    shares: BTreeMap<u16, EncodedShare>,
    share_tree: Option<HashTree<Sha256>>,
    geometry: Option<Geometry>,
    latency: Duration,
    fail_enumerate: bool,
    fail_blocks: bool,
    unresponsive: bool,
    corrupt: HashSet<(u16, u64)>,
    block_calls: u64,
}

/// A storage server holding some of a file's shares, with dials for the failure
/// modes the engine must survive.
#[derive(Clone)]
pub struct Server<E: Clock> {
    context: E,
    id: String,
    inner: Arc<Mutex<Inner>>,
}

impl<E: Clock> Server<E> {
    pub fn new(context: E, id: &str) -> Self {
        Self {
            context,
            id: id.to_string(),
            inner: Arc::new(Mutex::new(Inner {
                shares: BTreeMap::new(),
                share_tree: None,
                geometry: None,
                latency: Duration::ZERO,
                fail_enumerate: false,
                fail_blocks: false,
                unresponsive: false,
                corrupt: HashSet::new(),
                block_calls: 0,
            })),
        }
    }

    /// Store the given share numbers of an encoded file.
    pub fn put(&self, encoded: &Encoded, shnums: &[u16]) {
        let mut inner = self.inner.lock().unwrap();
        inner.share_tree = Some(encoded.share_tree.clone());
        inner.geometry = Some(encoded.geometry);
        for &shnum in shnums {
            inner
                .shares
                .insert(shnum, encoded.shares[shnum as usize].clone());
        }
    }

    /// Delay every response by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().unwrap().latency = latency;
    }

    /// Fail discovery queries.
    pub fn fail_enumerate(&self) {
        self.inner.lock().unwrap().fail_enumerate = true;
    }

    /// Fail every share operation.
    pub fn fail_blocks(&self) {
        self.inner.lock().unwrap().fail_blocks = true;
    }

    /// Answer discovery but never resolve any share operation.
    pub fn unresponsive(&self) {
        self.inner.lock().unwrap().unresponsive = true;
    }

    /// Serve a tampered copy of one block.
    pub fn corrupt(&self, shnum: u16, segnum: u64) {
        self.inner.lock().unwrap().corrupt.insert((shnum, segnum));
    }

    /// How many block fetches this server has served (or failed).
    pub fn block_calls(&self) -> u64 {
        self.inner.lock().unwrap().block_calls
    }

    /// Latency, then (for share operations) an unresolvable pend if unresponsive.
    async fn delay(&self) {
        let (latency, unresponsive) = {
            let inner = self.inner.lock().unwrap();
            (inner.latency, inner.unresponsive)
        };
        self.context.sleep(latency).await;
        if unresponsive {
            future::pending::<()>().await;
        }
    }
}

impl<E: Clock> StorageServer for Server<E> {
    type Id = String;
    type Digest = sha256::Digest;
    type Error = Error;

    fn id(&self) -> String {
        self.id.clone()
    }

    async fn enumerate(&mut self, _: &StorageIndex) -> Result<Vec<u16>, Error> {
        let latency = self.inner.lock().unwrap().latency;
        self.context.sleep(latency).await;
        let inner = self.inner.lock().unwrap();
        if inner.fail_enumerate {
            return Err(Error::Server);
        }
        Ok(inner.shares.keys().copied().collect())
    }

    async fn geometry(&mut self, _: &StorageIndex, shnum: u16) -> Result<Geometry, Error> {
        self.delay().await;
        let inner = self.inner.lock().unwrap();
        if inner.fail_blocks {
            return Err(Error::Server);
        }
        inner.geometry.ok_or(Error::UnknownShare(shnum))
    }

    async fn share_proof(
        &mut self,
        _: &StorageIndex,
        wanted: Vec<usize>,
    ) -> Result<Vec<(usize, Self::Digest)>, Error> {
        self.delay().await;
        let inner = self.inner.lock().unwrap();
        if inner.fail_blocks {
            return Err(Error::Server);
        }
        let tree = inner.share_tree.as_ref().ok_or(Error::Server)?;
        Ok(wanted
            .into_iter()
            .map(|i| (i, tree.node(i).expect("unknown share tree index")))
            .collect())
    }

    async fn block_proof(
        &mut self,
        _: &StorageIndex,
        shnum: u16,
        wanted: Vec<usize>,
    ) -> Result<Vec<(usize, Self::Digest)>, Error> {
        self.delay().await;
        let inner = self.inner.lock().unwrap();
        if inner.fail_blocks {
            return Err(Error::Server);
        }
        let share = inner.shares.get(&shnum).ok_or(Error::UnknownShare(shnum))?;
        Ok(wanted
            .into_iter()
            .map(|i| (i, share.tree.node(i).expect("unknown block tree index")))
            .collect())
    }

    async fn block(&mut self, _: &StorageIndex, shnum: u16, segnum: u64) -> Result<Bytes, Error> {
        self.delay().await;
        let mut inner = self.inner.lock().unwrap();
        inner.block_calls += 1;
        if inner.fail_blocks {
            return Err(Error::Server);
        }
        let share = inner.shares.get(&shnum).ok_or(Error::UnknownShare(shnum))?;
        let block = share
            .blocks
            .get(segnum as usize)
            .ok_or(Error::UnknownShare(shnum))?
            .clone();
        if inner.corrupt.contains(&(shnum, segnum)) {
            let mut tampered = block.to_vec();
            tampered[0] ^= 0xff;
            return Ok(Bytes::from(tampered));
        }
        Ok(block)
    }
}

/// Decodes the mock striping: exactly `needed` blocks, each the whole segment
/// behind a share-number prefix.
#[derive(Clone)]
pub struct Codec {
    needed: u16,
}

impl Codec {
    pub fn new(needed: u16) -> Self {
        Self { needed }
    }
}

impl crate::Codec for Codec {
    type Error = Error;

    fn decode(&mut self, blocks: BTreeMap<u16, Bytes>) -> Result<Bytes, Error> {
        if blocks.len() != self.needed as usize {
            return Err(Error::WrongBlockCount(blocks.len()));
        }
        let (shnum, block) = blocks.iter().next().ok_or(Error::WrongBlockCount(0))?;
        if block.len() < 2 || u16::from_be_bytes([block[0], block[1]]) != *shnum {
            return Err(Error::WrongShare);
        }
        Ok(block.slice(2..))
    }
}

/// A consumer that forwards every delivered chunk to a channel.
#[derive(Clone)]
pub struct Consumer {
    sender: mpsc::UnboundedSender<Bytes>,
}

impl Consumer {
    /// Returns the consumer and the receiver its chunks arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (sender, receiver) = mpsc::unbounded();
        (Self { sender }, receiver)
    }
}

impl crate::Consumer for Consumer {
    async fn deliver(&mut self, data: Bytes) {
        let _ = self.sender.send(data).await;
    }
}
