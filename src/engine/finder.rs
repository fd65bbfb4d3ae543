use super::fetcher::ShareId;
use crate::{StorageIndex, StorageServer};
use commonware_cryptography::Hasher;
use std::collections::VecDeque;

/// Domain separator for the server permutation.
const PERMUTE_TAG: &[u8] = b"retriever-permute";

/// What discovery wants done next. [ShareFinder::step] is called until it returns
/// [FinderStep::Wait].
pub(super) enum FinderStep<S> {
    /// Ask this server which shares it holds.
    Query(S),

    /// Hand a discovered share to the consumer.
    Deliver(ShareId),

    /// Every server has answered (or failed); no further shares will ever arrive.
    NoMoreShares,

    /// Nothing to do until a query resolves or the consumer gets hungry.
    Wait,
}

/// Walks the file's permuted server list, keeping a bounded number of discovery
/// queries in flight, and hands out discovered shares one at a time as the consumer
/// asks for them.
///
/// The permutation is keyed by storage index the same way placement is, so retrieval
/// visits servers in the order upload preferred them.
pub(super) struct ShareFinder<S: StorageServer> {
    servers: VecDeque<S>,
    inflight: usize,
    cap: usize,
    hungry: bool,
    undelivered: VecDeque<ShareId>,
    finished: bool,
}

impl<S: StorageServer> ShareFinder<S> {
    pub fn new<H: Hasher<Digest = S::Digest>>(
        hasher: &mut H,
        storage_index: &StorageIndex,
        servers: Vec<S>,
        cap: usize,
    ) -> Self {
        let mut keyed: Vec<(H::Digest, S)> = servers
            .into_iter()
            .map(|s| {
                hasher.update(PERMUTE_TAG);
                hasher.update(storage_index.as_ref());
                hasher.update(s.id().as_ref());
                (hasher.finalize(), s)
            })
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            servers: keyed.into_iter().map(|(_, s)| s).collect(),
            inflight: 0,
            cap: cap.max(1),
            hungry: false,
            undelivered: VecDeque::new(),
            finished: false,
        }
    }

    /// The consumer wants at least one more share. Idempotent.
    pub fn hungry(&mut self) {
        if !self.finished {
            self.hungry = true;
        }
    }

    /// The consumer no longer wants shares (its fetch ended).
    pub fn satiate(&mut self) {
        self.hungry = false;
    }

    /// Whether a share is still queued for delivery.
    pub fn is_undelivered(&self, share: ShareId) -> bool {
        self.undelivered.contains(&share)
    }

    /// A discovery query resolved (successfully or not).
    pub fn on_query_done(&mut self) {
        self.inflight -= 1;
    }

    /// Record shares created from a query response, pending delivery.
    pub fn enqueue(&mut self, shares: impl IntoIterator<Item = ShareId>) {
        self.undelivered.extend(shares);
    }

    /// Advance discovery by one action.
    pub fn step(&mut self) -> FinderStep<S> {
        if !self.hungry {
            return FinderStep::Wait;
        }
        if let Some(id) = self.undelivered.pop_front() {
            self.hungry = false;
            return FinderStep::Deliver(id);
        }
        if self.inflight < self.cap {
            if let Some(server) = self.servers.pop_front() {
                self.inflight += 1;
                return FinderStep::Query(server);
            }
        }
        if self.inflight > 0 {
            return FinderStep::Wait;
        }
        if !self.finished {
            self.finished = true;
            self.hungry = false;
            return FinderStep::NoMoreShares;
        }
        FinderStep::Wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Geometry;
    use bytes::Bytes;
    use commonware_cryptography::{Hasher as _, Sha256};

    #[derive(Clone)]
    struct Named(String);

    impl StorageServer for Named {
        type Id = String;
        type Digest = <Sha256 as commonware_cryptography::Hasher>::Digest;
        type Error = std::io::Error;

        fn id(&self) -> String {
            self.0.clone()
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

    fn servers(n: usize) -> Vec<Named> {
        (0..n).map(|i| Named(format!("server-{i}"))).collect()
    }

    fn query_order(storage_index: StorageIndex, cap: usize) -> Vec<String> {
        let mut hasher = Sha256::new();
        let mut finder = ShareFinder::new(&mut hasher, &storage_index, servers(6), cap);
        let mut order = Vec::new();
        loop {
            finder.hungry();
            match finder.step() {
                FinderStep::Query(s) => {
                    order.push(s.id());
                    finder.on_query_done();
                }
                FinderStep::NoMoreShares => break,
                FinderStep::Wait | FinderStep::Deliver(_) => unreachable!(),
            }
        }
        order
    }

    #[test]
    fn test_permutation_deterministic_per_file() {
        let a = query_order(StorageIndex([1u8; 16]), 10);
        let b = query_order(StorageIndex([1u8; 16]), 10);
        assert_eq!(a, b);

        // A different file visits servers in a different order.
        let c = query_order(StorageIndex([2u8; 16]), 10);
        assert_ne!(a, c);

        // The permutation covers every server exactly once.
        let mut sorted = a.clone();
        sorted.sort();
        let mut expected: Vec<String> = servers(6).iter().map(|s| s.id()).collect();
        expected.sort();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn test_query_cap_respected() {
        let mut hasher = Sha256::new();
        let mut finder = ShareFinder::new(&mut hasher, &StorageIndex([3u8; 16]), servers(6), 2);
        finder.hungry();
        assert!(matches!(finder.step(), FinderStep::Query(_)));
        assert!(matches!(finder.step(), FinderStep::Query(_)));
        assert!(matches!(finder.step(), FinderStep::Wait));

        // A resolved query frees a slot.
        finder.on_query_done();
        assert!(matches!(finder.step(), FinderStep::Query(_)));
        assert!(matches!(finder.step(), FinderStep::Wait));
    }

    #[test]
    fn test_delivers_one_share_per_hungry() {
        let mut hasher = Sha256::new();
        let mut finder = ShareFinder::new(&mut hasher, &StorageIndex([4u8; 16]), servers(1), 10);
        finder.hungry();
        assert!(matches!(finder.step(), FinderStep::Query(_)));
        finder.on_query_done();
        finder.enqueue([7, 8]);
        assert!(matches!(finder.step(), FinderStep::Deliver(7)));

        // Hunger was satisfied; the second share waits for another ask.
        assert!(matches!(finder.step(), FinderStep::Wait));
        finder.hungry();
        assert!(matches!(finder.step(), FinderStep::Deliver(8)));
    }

    #[test]
    fn test_no_more_shares_is_terminal_and_one_shot() {
        let mut hasher = Sha256::new();
        let mut finder = ShareFinder::new(&mut hasher, &StorageIndex([5u8; 16]), servers(2), 10);
        finder.hungry();
        assert!(matches!(finder.step(), FinderStep::Query(_)));
        assert!(matches!(finder.step(), FinderStep::Query(_)));
        assert!(matches!(finder.step(), FinderStep::Wait));
        finder.on_query_done();
        finder.on_query_done();
        assert!(matches!(finder.step(), FinderStep::NoMoreShares));
        finder.hungry();
        assert!(matches!(finder.step(), FinderStep::Wait));
    }
}
