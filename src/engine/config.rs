use crate::StorageIndex;
use commonware_cryptography::Digest;
use std::time::Duration;

/// Configuration for an [crate::Engine], derived from a read capability.
#[derive(Clone, Debug)]
pub struct Config<D: Digest> {
    /// Identifies the file on the storage grid.
    pub storage_index: StorageIndex,

    /// Number of blocks required to decode a segment (`k`).
    pub needed_shares: u16,

    /// Number of shares produced at upload (`N`).
    pub total_shares: u16,

    /// Exact size of the file in bytes.
    pub file_size: u64,

    /// Segment size hint from the capability. Treated as a guess until a server
    /// reports the authoritative geometry.
    pub segment_size: u64,

    /// Root of the share hash tree; the sole trust anchor for all retrieved bytes.
    pub root_hash: D,

    /// Maximum concurrent share-discovery queries.
    pub max_queries: usize,

    /// How long a block request may be outstanding before it is considered overdue
    /// and an alternative is tried.
    pub overdue_timeout: Duration,

    /// Size of the engine's mailbox.
    pub mailbox_size: usize,
}

impl<D: Digest> Config<D> {
    /// Panics if the configuration is internally inconsistent.
    pub(super) fn assert(&self) {
        assert!(self.needed_shares > 0, "needed_shares must be positive");
        assert!(
            self.needed_shares <= self.total_shares,
            "needed_shares must not exceed total_shares"
        );
        assert!(
            self.total_shares <= 256,
            "total_shares must not exceed 256"
        );
        assert!(self.segment_size > 0, "segment_size must be positive");
        assert!(self.max_queries > 0, "max_queries must be positive");
    }

    /// The guessed number of segments, before any server reports the real geometry.
    pub(super) fn guessed_segments(&self) -> u64 {
        self.file_size.div_ceil(self.segment_size).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_cryptography::{sha256, Hasher as _, Sha256};
    use std::time::Duration;

    fn config(needed_shares: u16, total_shares: u16) -> Config<sha256::Digest> {
        let mut hasher = Sha256::new();
        hasher.update(b"root");
        Config {
            storage_index: StorageIndex([0u8; 16]),
            needed_shares,
            total_shares,
            file_size: 10,
            segment_size: 4,
            root_hash: hasher.finalize(),
            max_queries: 10,
            overdue_timeout: Duration::from_secs(1),
            mailbox_size: 4,
        }
    }

    #[test]
    fn test_assert_accepts_limits() {
        config(1, 1).assert();
        config(256, 256).assert();
    }

    #[test]
    #[should_panic(expected = "total_shares must not exceed 256")]
    fn test_assert_rejects_excess_total() {
        config(1, 257).assert();
    }

    #[test]
    #[should_panic(expected = "needed_shares must not exceed total_shares")]
    fn test_assert_rejects_inverted_threshold() {
        config(3, 2).assert();
    }
}
