//! Retrieve erasure-coded files scattered across unreliable storage servers.
//!
//! An immutable file is striped into fixed-size segments, each segment is erasure-coded
//! into `total_shares` blocks, and the blocks for a given share number are scattered
//! across storage servers alongside merkle hash trees that commit every byte to a single
//! `root_hash` known to the reader. [engine::Engine] locates shares, schedules block
//! fetches across servers of varying health, validates everything it receives against
//! the root, and reassembles the requested byte ranges into a verified stream.
//!
//! # Status
//!
//! `commonware-retriever` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

#![doc(
    html_logo_url = "https://commonware.xyz/imgs/rustdoc_logo.svg",
    html_favicon_url = "https://commonware.xyz/favicon.ico"
)]

use bytes::Bytes;
use commonware_cryptography::Digest;
use commonware_utils::hex;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::hash::Hash;
use thiserror::Error;

pub mod engine;
pub mod hash_tree;

pub use engine::{Config, Engine, Mailbox};

/// Identifies a file on the storage grid.
///
/// Servers index their share stores by this value; it carries no secret material.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageIndex(pub [u8; 16]);

impl AsRef<[u8]> for StorageIndex {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for StorageIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.0))
    }
}

impl Display for StorageIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.0))
    }
}

/// The segmentation of a file, as reported by storage servers.
///
/// Until the first server response is validated, the engine works from a guessed
/// geometry derived from the reader's capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// Size of every segment except (possibly) the last.
    pub segment_size: u64,

    /// Number of segments in the file.
    pub num_segments: u64,
}

/// Identifies a storage server.
pub trait ServerId:
    Clone + Eq + Ord + Hash + Debug + Display + AsRef<[u8]> + Send + Sync + 'static
{
}

impl<T: Clone + Eq + Ord + Hash + Debug + Display + AsRef<[u8]> + Send + Sync + 'static> ServerId
    for T
{
}

/// A handle to one storage server.
///
/// Each method is a single remote operation; hash values travel as `(index, digest)`
/// pairs addressed by position in the relevant [hash_tree]. Implementations map their
/// transport however they like, but any returned error marks the server (or share)
/// dead for the remainder of the download.
pub trait StorageServer: Clone + Send + Sync + 'static {
    /// Uniquely identifies this server (used for permuted ordering and diversity limits).
    type Id: ServerId;

    /// Digest type committed by the file's hash trees.
    type Digest: Digest;

    /// Error returned by any remote operation.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Returns this server's identity.
    fn id(&self) -> Self::Id;

    /// Returns the share numbers this server holds for a file.
    fn enumerate(
        &mut self,
        storage_index: &StorageIndex,
    ) -> impl Future<Output = Result<Vec<u16>, Self::Error>> + Send;

    /// Returns the file's segmentation as recorded alongside a share.
    fn geometry(
        &mut self,
        storage_index: &StorageIndex,
        shnum: u16,
    ) -> impl Future<Output = Result<Geometry, Self::Error>> + Send;

    /// Returns the requested nodes of the file's share hash tree.
    fn share_proof(
        &mut self,
        storage_index: &StorageIndex,
        wanted: Vec<usize>,
    ) -> impl Future<Output = Result<Vec<(usize, Self::Digest)>, Self::Error>> + Send;

    /// Returns the requested nodes of a share's block hash tree.
    fn block_proof(
        &mut self,
        storage_index: &StorageIndex,
        shnum: u16,
        wanted: Vec<usize>,
    ) -> impl Future<Output = Result<Vec<(usize, Self::Digest)>, Self::Error>> + Send;

    /// Returns one block of a share.
    fn block(
        &mut self,
        storage_index: &StorageIndex,
        shnum: u16,
        segnum: u64,
    ) -> impl Future<Output = Result<Bytes, Self::Error>> + Send;
}

/// Decodes `needed_shares` validated blocks back into a segment.
///
/// Decoding is pure: the same blocks always produce the same segment. The returned
/// bytes may include erasure padding past the true end of the last segment; the
/// engine trims to the file size.
pub trait Codec: Clone + Send + 'static {
    /// Error returned when the blocks cannot be decoded.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Decode a segment from exactly `needed_shares` blocks, keyed by share number.
    fn decode(&mut self, blocks: BTreeMap<u16, Bytes>) -> Result<Bytes, Self::Error>;
}

/// Receives the bytes of a read, in order.
pub trait Consumer: Send + 'static {
    /// Deliver the next chunk of the requested range.
    fn deliver(&mut self, data: Bytes) -> impl Future<Output = ()> + Send;
}

/// Why a share stopped contributing to a download.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShareFailure {
    /// The share served data that failed hash validation.
    Corrupt,

    /// The share's server returned an error.
    Dead,
}

impl Display for ShareFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Corrupt => write!(f, "corrupt"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// Errors that can terminate a read.
#[derive(Error, Debug)]
pub enum Error {
    /// No usable share was ever located.
    #[error("no shares found")]
    NoShares,

    /// Shares were located but fewer than `needed_shares` blocks could be validated.
    #[error(
        "ran out of shares: complete={complete} pending={pending} overdue={overdue} unused={unused} last failure={last_failure:?}"
    )]
    NotEnoughShares {
        /// Blocks validated for the failing segment.
        complete: usize,

        /// Requests still outstanding when exhaustion was declared.
        pending: usize,

        /// Requests that had been outstanding past the overdue threshold.
        overdue: usize,

        /// Known shares that were never activated.
        unused: usize,

        /// The most recent share failure, if any.
        last_failure: Option<ShareFailure>,
    },

    /// A segment past the end of the file was requested.
    #[error("bad segment number: {segnum} >= {num_segments}")]
    BadSegmentNumber {
        /// The requested segment.
        segnum: u64,

        /// The authoritative segment count.
        num_segments: u64,
    },

    /// Servers reported irreconcilable file geometries.
    #[error("inconsistent geometry: {0:?} != {1:?}")]
    InconsistentGeometry(Geometry, Geometry),

    /// The validated blocks could not be decoded into a segment.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The read was stopped before completion.
    #[error("stopped")]
    Stopped,
}
