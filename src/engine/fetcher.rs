use crate::{Error, ShareFailure};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::mem::take;
use std::time::Duration;

/// Identifies a share within one engine.
pub(super) type ShareId = u64;

/// A share available to fetch blocks from, as seen by the scheduler.
#[derive(Clone, Debug)]
pub(super) struct Candidate<P> {
    /// The share's id in the engine's share table.
    pub share: ShareId,

    /// The share number.
    pub shnum: u16,

    /// The server holding the share.
    pub server: P,

    /// Most recently observed round-trip time to the server.
    pub rtt: Duration,
}

/// What the scheduler wants done next. [SegmentFetcher::step] is called until it
/// returns [Step::Wait], [Step::Done], or [Step::Fail].
pub(super) enum Step<P> {
    /// Issue a block request on this share.
    Start(Candidate<P>),

    /// Ask discovery for more shares.
    Hungry,

    /// Nothing to do until an outstanding request resolves.
    Wait,

    /// Enough blocks are validated; outstanding requests should be cancelled.
    Done {
        blocks: BTreeMap<u16, Bytes>,
        cancel: Vec<ShareId>,
    },

    /// The segment cannot be fetched.
    Fail(Error),
}

/// Schedules block requests for one segment until `needed` distinct share numbers
/// have validated blocks.
///
/// Candidates are tried in ascending order of observed round-trip time (then share
/// number, then server, for determinism). A per-server cap starts at `initial_cap`
/// and is raised only when every remaining candidate is blocked by it, trading
/// server diversity for progress.
pub(super) struct SegmentFetcher<P: Clone + Eq + Ord + Hash> {
    segnum: u64,
    needed: usize,
    unused: Vec<Candidate<P>>,
    active: HashMap<ShareId, Candidate<P>>,
    overdue: HashMap<ShareId, Candidate<P>>,
    complete: BTreeMap<u16, Bytes>,
    per_server: HashMap<P, usize>,
    cap: usize,
    exhausted: bool,
    seen_any: bool,
    asked: bool,
    want_more: bool,
    last_failure: Option<ShareFailure>,
}

impl<P: Clone + Eq + Ord + Hash> SegmentFetcher<P> {
    pub fn new(segnum: u64, needed: usize, initial_cap: usize) -> Self {
        Self {
            segnum,
            needed,
            unused: Vec::new(),
            active: HashMap::new(),
            overdue: HashMap::new(),
            complete: BTreeMap::new(),
            per_server: HashMap::new(),
            cap: initial_cap.max(1),
            exhausted: false,
            seen_any: false,
            asked: false,
            want_more: false,
            last_failure: None,
        }
    }

    /// The segment being fetched.
    pub fn segnum(&self) -> u64 {
        self.segnum
    }

    /// The per-server cap after any raises.
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Offer newly discovered (or initially known) shares.
    pub fn add_candidates(&mut self, candidates: Vec<Candidate<P>>) {
        if candidates.is_empty() {
            return;
        }
        self.seen_any = true;
        self.asked = false;
        self.unused.extend(candidates);
        self.unused
            .sort_by(|a, b| (a.rtt, a.shnum, &a.server).cmp(&(b.rtt, b.shnum, &b.server)));
    }

    /// Discovery is finished: no further candidates will ever arrive.
    pub fn no_more_shares(&mut self) {
        self.exhausted = true;
    }

    /// A block was fetched and validated. Returns false if the block was redundant
    /// (another share already completed this share number).
    pub fn on_complete(&mut self, share: ShareId, bytes: Bytes) -> bool {
        let Some(candidate) = self.active.remove(&share).or_else(|| self.overdue.remove(&share))
        else {
            return false;
        };
        if self.complete.contains_key(&candidate.shnum) {
            return false;
        }
        self.complete.insert(candidate.shnum, bytes);
        true
    }

    /// An outstanding request has been slow for too long. The request stays live but
    /// no longer counts toward the activation threshold.
    pub fn on_overdue(&mut self, share: ShareId) {
        if let Some(candidate) = self.active.remove(&share) {
            self.overdue.insert(share, candidate);
        }
    }

    /// An outstanding request failed terminally.
    pub fn on_failure(&mut self, share: ShareId, failure: ShareFailure) {
        if self
            .active
            .remove(&share)
            .or_else(|| self.overdue.remove(&share))
            .is_some()
        {
            self.last_failure = Some(failure);
        }
    }

    /// Drop all unstarted candidates held by a server that turned out to be dead.
    pub fn remove_server(&mut self, server: &P) {
        self.unused.retain(|c| &c.server != server);
    }

    fn shnum_busy(&self, shnum: u16) -> bool {
        self.complete.contains_key(&shnum) || self.active.values().any(|c| c.shnum == shnum)
    }

    fn eligible(&self, candidate: &Candidate<P>) -> bool {
        !self.shnum_busy(candidate.shnum)
            && self
                .per_server
                .get(&candidate.server)
                .copied()
                .unwrap_or(0)
                < self.cap
    }

    /// Advance the schedule by one action.
    pub fn step(&mut self) -> Step<P> {
        if self.complete.len() >= self.needed {
            let cancel = self.active.keys().chain(self.overdue.keys()).copied().collect();
            return Step::Done {
                blocks: take(&mut self.complete),
                cancel,
            };
        }
        if self.want_more && !self.exhausted {
            self.want_more = false;
            self.asked = true;
            return Step::Hungry;
        }
        if self.complete.len() + self.active.len() >= self.needed {
            return Step::Wait;
        }
        loop {
            if let Some(pos) = self.unused.iter().position(|c| self.eligible(c)) {
                let candidate = self.unused.remove(pos);
                *self
                    .per_server
                    .entry(candidate.server.clone())
                    .or_default() += 1;
                self.active.insert(candidate.share, candidate.clone());
                return Step::Start(candidate);
            }
            // If idle candidates exist but every one is blocked by the diversity
            // cap, progress beats diversity.
            if self.unused.iter().any(|c| !self.shnum_busy(c.shnum)) {
                self.cap += 1;
                self.want_more = true;
                continue;
            }
            break;
        }
        if self.exhausted {
            if self.complete.len() + self.active.len() + self.overdue.len() < self.needed {
                let err = if self.seen_any {
                    Error::NotEnoughShares {
                        complete: self.complete.len(),
                        pending: self.active.len(),
                        overdue: self.overdue.len(),
                        unused: self.unused.len(),
                        last_failure: self.last_failure,
                    }
                } else {
                    Error::NoShares
                };
                return Step::Fail(err);
            }
            return Step::Wait;
        }
        if !self.asked {
            self.asked = true;
            return Step::Hungry;
        }
        Step::Wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(share: ShareId, shnum: u16, server: &str, rtt_ms: u64) -> Candidate<String> {
        Candidate {
            share,
            shnum,
            server: server.to_string(),
            rtt: Duration::from_millis(rtt_ms),
        }
    }

    /// Step until the fetcher has nothing more to start, returning the started
    /// candidates and whether it asked for more shares.
    fn drain(fetcher: &mut SegmentFetcher<String>) -> (Vec<Candidate<String>>, bool) {
        let mut started = Vec::new();
        let mut hungry = false;
        loop {
            match fetcher.step() {
                Step::Start(c) => started.push(c),
                Step::Hungry => hungry = true,
                Step::Wait => return (started, hungry),
                Step::Done { .. } => panic!("unexpected done"),
                Step::Fail(err) => panic!("unexpected failure: {err}"),
            }
        }
    }

    #[test]
    fn test_exactly_needed_requests() {
        let mut fetcher = SegmentFetcher::new(0, 3, 1);
        fetcher.add_candidates(vec![
            candidate(0, 0, "a", 10),
            candidate(1, 1, "b", 20),
            candidate(2, 2, "c", 30),
            candidate(3, 3, "d", 40),
        ]);
        let (started, _) = drain(&mut fetcher);
        assert_eq!(started.len(), 3);

        // Fastest three, in rtt order.
        let shnums: Vec<u16> = started.iter().map(|c| c.shnum).collect();
        assert_eq!(shnums, vec![0, 1, 2]);

        for c in &started {
            assert!(fetcher.on_complete(c.share, Bytes::from_static(b"x")));
        }
        match fetcher.step() {
            Step::Done { blocks, cancel } => {
                assert_eq!(blocks.len(), 3);
                assert!(cancel.is_empty());
            }
            _ => panic!("expected done"),
        }
    }

    #[test]
    fn test_corrupt_share_costs_one_extra_request() {
        let mut fetcher = SegmentFetcher::new(0, 3, 1);
        fetcher.add_candidates(vec![
            candidate(0, 0, "a", 10),
            candidate(1, 1, "b", 20),
            candidate(2, 2, "c", 30),
            candidate(3, 3, "d", 40),
        ]);
        let (started, _) = drain(&mut fetcher);
        assert_eq!(started.len(), 3);

        fetcher.on_failure(0, ShareFailure::Corrupt);
        let (replacement, _) = drain(&mut fetcher);
        assert_eq!(replacement.len(), 1);
        assert_eq!(replacement[0].shnum, 3);

        fetcher.on_complete(1, Bytes::from_static(b"x"));
        fetcher.on_complete(2, Bytes::from_static(b"x"));
        fetcher.on_complete(3, Bytes::from_static(b"x"));
        match fetcher.step() {
            Step::Done { blocks, .. } => {
                assert_eq!(blocks.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3])
            }
            _ => panic!("expected done"),
        }
    }

    #[test]
    fn test_diversity_one_request_per_server() {
        // Five servers holding two shares each: the initial cap of one share per
        // server spreads the three requests across three distinct servers.
        let mut fetcher = SegmentFetcher::new(0, 3, 1);
        let mut candidates = Vec::new();
        for (i, server) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            candidates.push(candidate(2 * i as u64, 2 * i as u16, server, 10));
            candidates.push(candidate(2 * i as u64 + 1, 2 * i as u16 + 1, server, 10));
        }
        fetcher.add_candidates(candidates);
        let (started, _) = drain(&mut fetcher);
        assert_eq!(started.len(), 3);
        let mut servers: Vec<String> = started.iter().map(|c| c.server.clone()).collect();
        servers.dedup();
        assert_eq!(servers.len(), 3);
        assert_eq!(fetcher.cap(), 1);
    }

    #[test]
    fn test_cap_raised_when_one_server_has_everything() {
        let mut fetcher = SegmentFetcher::new(0, 3, 1);
        fetcher.add_candidates(
            (0..10u16)
                .map(|shnum| candidate(shnum as u64, shnum, "only", 10))
                .collect(),
        );
        let (started, hungry) = drain(&mut fetcher);
        assert_eq!(started.len(), 3);
        assert!(started.iter().all(|c| c.server == "only"));
        assert_eq!(fetcher.cap(), 3);

        // Diversity pressure also asks discovery for alternatives.
        assert!(hungry);
    }

    #[test]
    fn test_no_shares() {
        let mut fetcher: SegmentFetcher<String> = SegmentFetcher::new(0, 3, 1);
        match fetcher.step() {
            Step::Hungry => {}
            _ => panic!("expected hungry"),
        }
        fetcher.no_more_shares();
        match fetcher.step() {
            Step::Fail(Error::NoShares) => {}
            _ => panic!("expected no shares"),
        }
    }

    #[test]
    fn test_not_enough_shares() {
        let mut fetcher = SegmentFetcher::new(0, 3, 1);
        fetcher.add_candidates(vec![candidate(0, 0, "a", 10), candidate(1, 1, "b", 20)]);
        let (started, hungry) = drain(&mut fetcher);
        assert_eq!(started.len(), 2);
        assert!(hungry);

        fetcher.on_complete(0, Bytes::from_static(b"x"));
        fetcher.on_failure(1, ShareFailure::Dead);
        fetcher.no_more_shares();
        match fetcher.step() {
            Step::Fail(Error::NotEnoughShares {
                complete,
                pending,
                overdue,
                unused,
                last_failure,
            }) => {
                assert_eq!(complete, 1);
                assert_eq!(pending, 0);
                assert_eq!(overdue, 0);
                assert_eq!(unused, 0);
                assert_eq!(last_failure, Some(ShareFailure::Dead));
            }
            _ => panic!("expected not enough shares"),
        }
    }

    #[test]
    fn test_overdue_triggers_failover_but_may_still_complete() {
        let mut fetcher = SegmentFetcher::new(0, 2, 1);
        fetcher.add_candidates(vec![
            candidate(0, 0, "slow", 10),
            candidate(1, 1, "b", 20),
            candidate(2, 2, "c", 30),
        ]);
        let (started, _) = drain(&mut fetcher);
        assert_eq!(started.len(), 2);

        // The slow request stops counting, so a replacement starts.
        fetcher.on_overdue(0);
        let (replacement, _) = drain(&mut fetcher);
        assert_eq!(replacement.len(), 1);
        assert_eq!(replacement[0].shnum, 2);

        // The overdue request resolving still counts.
        fetcher.on_complete(1, Bytes::from_static(b"x"));
        fetcher.on_complete(0, Bytes::from_static(b"y"));
        match fetcher.step() {
            Step::Done { blocks, cancel } => {
                assert_eq!(blocks.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
                assert_eq!(cancel, vec![2]);
            }
            _ => panic!("expected done"),
        }
    }

    #[test]
    fn test_redundant_and_unknown_completions_ignored() {
        let mut fetcher = SegmentFetcher::new(0, 2, 1);
        fetcher.add_candidates(vec![
            candidate(0, 0, "a", 10),
            candidate(1, 0, "b", 20),
            candidate(2, 1, "c", 30),
        ]);
        let (started, _) = drain(&mut fetcher);
        assert_eq!(started.len(), 2);

        // A completion for a request that was never started cannot mutate anything.
        assert!(!fetcher.on_complete(99, Bytes::from_static(b"x")));

        // Share 0 goes overdue; share 1 (same shnum) is started as a fallback and
        // both eventually complete. Only the first counts.
        fetcher.on_overdue(0);
        let (fallback, _) = drain(&mut fetcher);
        assert_eq!(fallback.len(), 1);
        assert_eq!(fallback[0].shnum, 0);
        assert!(fetcher.on_complete(0, Bytes::from_static(b"first")));
        assert!(!fetcher.on_complete(1, Bytes::from_static(b"second")));

        assert!(fetcher.on_complete(2, Bytes::from_static(b"x")));
        match fetcher.step() {
            Step::Done { blocks, .. } => {
                assert_eq!(blocks.get(&0), Some(&Bytes::from_static(b"first")));
            }
            _ => panic!("expected done"),
        }
    }

    #[test]
    fn test_dead_server_candidates_pruned() {
        let mut fetcher = SegmentFetcher::new(0, 2, 1);
        fetcher.add_candidates(vec![
            candidate(0, 0, "a", 10),
            candidate(1, 1, "dead", 20),
            candidate(2, 2, "dead", 30),
            candidate(3, 3, "b", 40),
        ]);
        let (started, _) = drain(&mut fetcher);
        assert_eq!(started.len(), 2);

        fetcher.on_failure(1, ShareFailure::Dead);
        fetcher.remove_server(&"dead".to_string());
        let (replacement, _) = drain(&mut fetcher);
        assert_eq!(replacement.len(), 1);
        assert_eq!(replacement[0].shnum, 3);
    }
}
