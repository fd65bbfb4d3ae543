use super::{
    config::Config,
    fetcher::{Candidate, SegmentFetcher, ShareId, Step},
    finder::{FinderStep, ShareFinder},
    ingress::{Mailbox, Message},
    metrics::Metrics,
    segmentation::{Apply, ReadState},
    share::{Adoption, CommonState, Share},
};
use crate::{hash_tree, Codec, Consumer, Error, Geometry, ShareFailure, StorageServer};
use bytes::Bytes;
use commonware_cryptography::Hasher;
use commonware_macros::select;
use commonware_runtime::{Clock, Handle, Metrics as RuntimeMetrics, Spawner};
use futures::{
    channel::{mpsc, oneshot},
    future::{self, BoxFuture, Either},
    stream::FuturesUnordered,
    StreamExt,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Everything a server returns for one block request.
struct Payload<D> {
    share_proof: Vec<(usize, D)>,
    block_proof: Vec<(usize, D)>,
    block: Bytes,
}

/// A resolved async operation, delivered to the engine's event loop.
enum Event<S: StorageServer> {
    /// A discovery query resolved.
    Discovered {
        server: S,
        rtt: Duration,
        result: Result<Vec<u16>, S::Error>,
    },

    /// A geometry request resolved.
    Geometry {
        request: u64,
        share: ShareId,
        result: Result<Geometry, S::Error>,
    },

    /// A block request resolved.
    Block {
        request: u64,
        share: ShareId,
        segnum: u64,
        started: SystemTime,
        result: Result<Payload<S::Digest>, S::Error>,
    },

    /// A request outlived the overdue threshold. `rest` resolves to the eventual
    /// [Event::Block] or [Event::Geometry] if the server ever answers.
    Overdue {
        request: u64,
        share: ShareId,
        rest: BoxFuture<'static, Event<S>>,
    },
}

/// In-flight request futures, resolved in completion order.
struct EventPool<S: StorageServer> {
    futures: FuturesUnordered<BoxFuture<'static, Event<S>>>,
}

impl<S: StorageServer> EventPool<S> {
    fn new() -> Self {
        Self {
            futures: FuturesUnordered::new(),
        }
    }

    fn push(&mut self, fut: BoxFuture<'static, Event<S>>) {
        self.futures.push(fut);
    }

    /// Resolves once any pushed future completes; pends forever while empty.
    async fn next_completed(&mut self) -> Event<S> {
        loop {
            if self.futures.is_empty() {
                future::pending::<()>().await;
            }
            if let Some(event) = self.futures.next().await {
                return event;
            }
        }
    }
}

/// Per-segment fetch in progress.
struct FetchState<P: Clone + Eq + Ord + Hash> {
    fetcher: SegmentFetcher<P>,
    /// Outstanding request id per share.
    requests: HashMap<ShareId, u64>,
    /// The geometry in force when the fetch started (possibly still a guess).
    geometry: Geometry,
}

/// A read admitted but not yet started.
struct PendingRead<Con: Consumer> {
    offset: u64,
    remaining: u64,
    consumer: Con,
    done: oneshot::Sender<Result<(), Error>>,
}

/// Retrieves verified byte ranges of one erasure-coded file.
///
/// All download state lives in this single task: discovery, per-segment block
/// scheduling, hash validation, decode, and delivery. Remote I/O runs as futures in
/// an event pool; every tree mutation and scheduling decision happens synchronously
/// on event receipt, so no two validations ever race.
pub struct Engine<E, H, S, Cd, Con>
where
    E: Clock + Spawner + RuntimeMetrics,
    H: Hasher,
    S: StorageServer<Digest = H::Digest>,
    Cd: Codec,
    Con: Consumer,
{
    context: E,
    config: Config<H::Digest>,
    hasher: H,
    codec: Cd,
    mailbox: mpsc::Receiver<Message<Con>>,

    common: CommonState<H>,
    finder: ShareFinder<S>,
    shares: BTreeMap<ShareId, Share<H, S>>,
    next_share: ShareId,
    next_request: u64,
    cancelled: HashSet<u64>,
    exhausted: bool,
    fetch: Option<FetchState<S::Id>>,
    initial_cap: usize,

    current: Option<ReadState<Con>>,
    queue: VecDeque<PendingRead<Con>>,
    paused: bool,

    metrics: Metrics,
}

impl<E, H, S, Cd, Con> Engine<E, H, S, Cd, Con>
where
    E: Clock + Spawner + RuntimeMetrics,
    H: Hasher,
    S: StorageServer<Digest = H::Digest>,
    Cd: Codec,
    Con: Consumer,
{
    /// Create the engine for one file, given the servers to search and the codec to
    /// decode its segments with.
    pub fn new(
        context: E,
        config: Config<H::Digest>,
        servers: Vec<S>,
        codec: Cd,
    ) -> (Self, Mailbox<Con>) {
        config.assert();
        let (sender, receiver) = mpsc::channel(config.mailbox_size);
        let mut hasher = H::new();
        let guessed = Geometry {
            segment_size: config.segment_size,
            num_segments: config.guessed_segments(),
        };
        let common = CommonState::new(
            &mut hasher,
            config.root_hash.clone(),
            config.total_shares,
            guessed,
        );
        let finder = ShareFinder::new(&mut hasher, &config.storage_index, servers, config.max_queries);
        let metrics = Metrics::init(&context);
        (
            Self {
                context,
                config,
                hasher,
                codec,
                mailbox: receiver,
                common,
                finder,
                shares: BTreeMap::new(),
                next_share: 0,
                next_request: 0,
                cancelled: HashSet::new(),
                exhausted: false,
                fetch: None,
                initial_cap: 1,
                current: None,
                queue: VecDeque::new(),
                paused: false,
                metrics,
            },
            Mailbox::new(sender),
        )
    }

    /// Start the engine.
    pub fn start(mut self) -> Handle<()> {
        let context = self.context.clone();
        context.spawn(move |context| async move {
            self.context = context;
            self.run().await;
        })
    }

    async fn run(mut self) {
        let mut pool = EventPool::new();
        let mut shutdown = self.context.stopped();
        loop {
            select! {
                _ = &mut shutdown => {
                    debug!("context stopped, shutting down");
                    return;
                },
                message = self.mailbox.next() => {
                    let Some(message) = message else {
                        debug!("mailbox closed, shutting down");
                        return;
                    };
                    self.handle_message(&mut pool, message).await;
                },
                event = pool.next_completed() => {
                    self.handle_event(&mut pool, event).await;
                },
            }
        }
    }

    async fn handle_message(&mut self, pool: &mut EventPool<S>, message: Message<Con>) {
        match message {
            Message::Read {
                offset,
                length,
                consumer,
                done,
            } => {
                let end = offset
                    .checked_add(length)
                    .unwrap_or(u64::MAX)
                    .min(self.config.file_size);
                let remaining = end.saturating_sub(offset);
                if remaining == 0 {
                    let _ = done.send(Ok(()));
                    self.metrics.reads.inc();
                } else {
                    self.queue.push_back(PendingRead {
                        offset,
                        remaining,
                        consumer,
                        done,
                    });
                }
            }
            Message::Pause => {
                self.paused = true;
            }
            Message::Resume => {
                self.paused = false;
            }
            Message::Stop => {
                self.stop_reads();
            }
        }
        self.advance(pool).await;
    }

    async fn handle_event(&mut self, pool: &mut EventPool<S>, event: Event<S>) {
        match event {
            Event::Discovered {
                server,
                rtt,
                result,
            } => {
                self.metrics.queries_active.dec();
                self.finder.on_query_done();
                match result {
                    Ok(shnums) => {
                        let shnums: BTreeSet<u16> = shnums.into_iter().collect();
                        debug!(server = %server.id(), shares = shnums.len(), "discovered shares");
                        let mut ids = Vec::with_capacity(shnums.len());
                        for shnum in shnums {
                            if shnum >= self.config.total_shares {
                                warn!(server = %server.id(), shnum, "ignoring impossible share number");
                                continue;
                            }
                            let id = self.next_share;
                            self.next_share += 1;
                            self.shares.insert(id, Share::new(server.clone(), shnum, rtt));
                            ids.push(id);
                        }
                        self.metrics.shares_located.inc_by(ids.len() as u64);
                        self.finder.enqueue(ids);
                    }
                    Err(err) => {
                        // A failed query means this server has none of the file's
                        // shares; discovery continues elsewhere.
                        warn!(server = %server.id(), ?err, "discovery query failed");
                        self.metrics.query_failures.inc();
                    }
                }
            }
            Event::Overdue {
                request,
                share,
                rest,
            } => {
                if self.cancelled.remove(&request) {
                    // Dropping `rest` is the cancellation: the eventual resolution
                    // is never delivered.
                    return;
                }
                debug!(share, "request overdue");
                self.metrics.blocks_overdue.inc();
                if let Some(fetch) = &mut self.fetch {
                    fetch.fetcher.on_overdue(share);
                }
                pool.push(rest);
            }
            Event::Geometry {
                request,
                share,
                result,
            } => {
                if self.cancelled.remove(&request) {
                    return;
                }
                match result {
                    Ok(geometry) => {
                        match self.common.adopt(geometry) {
                            Adoption::Adopted => {
                                debug!(?geometry, "adopted geometry");
                                self.check_segment_bounds().await;
                            }
                            Adoption::Unchanged => {}
                            Adoption::Conflicting(current) => {
                                warn!(share, ?geometry, ?current, "conflicting geometry");
                                self.metrics.requests_active.dec();
                                if let Some(fetch) = &mut self.fetch {
                                    fetch.requests.remove(&share);
                                }
                                self.share_failed(share, ShareFailure::Dead);
                                self.advance(pool).await;
                                return;
                            }
                        }
                        // Adopting may have aborted the fetch this request belongs to.
                        if self.cancelled.remove(&request) {
                            self.advance(pool).await;
                            return;
                        }
                        self.push_block_request(pool, request, share);
                    }
                    Err(err) => {
                        warn!(share, ?err, "geometry request failed");
                        self.metrics.requests_active.dec();
                        self.metrics.blocks_dead.inc();
                        if let Some(fetch) = &mut self.fetch {
                            fetch.requests.remove(&share);
                        }
                        if let Some(sh) = self.shares.get(&share) {
                            let server = sh.server.id();
                            self.server_dead(&server);
                        }
                    }
                }
            }
            Event::Block {
                request,
                share,
                segnum,
                started,
                result,
            } => {
                if self.cancelled.remove(&request) {
                    return;
                }
                self.metrics.requests_active.dec();
                if let Some(fetch) = &mut self.fetch {
                    fetch.requests.remove(&share);
                }
                if !self.shares.contains_key(&share) {
                    return;
                }
                match result {
                    Ok(payload) => match self.validate_block(share, segnum, payload) {
                        Ok(block) => {
                            let now = self.context.current();
                            if let Some(sh) = self.shares.get_mut(&share) {
                                sh.rtt = now.duration_since(started).unwrap_or_default();
                            }
                            if let Some(fetch) = &mut self.fetch {
                                if fetch.fetcher.on_complete(share, block) {
                                    self.metrics.blocks_complete.inc();
                                }
                            }
                        }
                        Err(err) => {
                            warn!(share, segnum, ?err, "block failed validation");
                            self.share_failed(share, ShareFailure::Corrupt);
                        }
                    },
                    Err(err) => {
                        warn!(share, segnum, ?err, "block request failed");
                        self.metrics.blocks_dead.inc();
                        if let Some(sh) = self.shares.get(&share) {
                            let server = sh.server.id();
                            self.server_dead(&server);
                        }
                    }
                }
            }
        }
        self.advance(pool).await;
    }

    /// Validate a block payload: share proof into the share tree, then the block
    /// against the proven share root.
    fn validate_block(
        &mut self,
        share: ShareId,
        segnum: u64,
        payload: Payload<H::Digest>,
    ) -> Result<Bytes, hash_tree::Error> {
        let Some(sh) = self.shares.get_mut(&share) else {
            return Err(hash_tree::Error::NotEnoughHashes);
        };
        let shnum = sh.shnum;
        let root = if payload.share_proof.is_empty() {
            self.common
                .share_root(shnum)
                .ok_or(hash_tree::Error::NotEnoughHashes)?
        } else {
            self.common
                .absorb_share_proof(&mut self.hasher, shnum, payload.share_proof)?
        };
        sh.ensure_tree(&mut self.hasher, self.common.geometry().num_segments);
        sh.validate_block(&mut self.hasher, root, segnum, payload.block_proof, &payload.block)?;
        Ok(payload.block)
    }

    /// Drive discovery, fetching, and delivery until nothing can progress without
    /// another event.
    async fn advance(&mut self, pool: &mut EventPool<S>) {
        loop {
            if self.current.is_none() {
                if let Some(read) = self.queue.pop_front() {
                    self.current = Some(ReadState::new(
                        read.consumer,
                        read.done,
                        read.offset,
                        read.remaining,
                    ));
                }
            }
            let mut progressed = self.drive_finder(pool);
            progressed |= self.drive_fetch(pool).await;
            if !progressed {
                return;
            }
        }
    }

    fn drive_finder(&mut self, pool: &mut EventPool<S>) -> bool {
        let mut progressed = false;
        loop {
            match self.finder.step() {
                FinderStep::Query(server) => {
                    progressed = true;
                    self.push_discovery(pool, server);
                }
                FinderStep::Deliver(share) => {
                    progressed = true;
                    // The share may have died between discovery and delivery. Its
                    // delivery consumed the hunger, so re-assert it: the fetcher is
                    // still owed a candidate (or a terminal no-more-shares).
                    let Some(sh) = self.shares.get(&share) else {
                        self.finder.hungry();
                        continue;
                    };
                    let candidate = Candidate {
                        share,
                        shnum: sh.shnum,
                        server: sh.server.id(),
                        rtt: sh.rtt,
                    };
                    if let Some(fetch) = &mut self.fetch {
                        fetch.fetcher.add_candidates(vec![candidate]);
                    }
                }
                FinderStep::NoMoreShares => {
                    progressed = true;
                    debug!("no more shares will be found");
                    self.exhausted = true;
                    if let Some(fetch) = &mut self.fetch {
                        fetch.fetcher.no_more_shares();
                    }
                }
                FinderStep::Wait => return progressed,
            }
        }
    }

    async fn drive_fetch(&mut self, pool: &mut EventPool<S>) -> bool {
        let mut progressed = self.ensure_fetch();
        loop {
            let Some(fetch) = &mut self.fetch else {
                return progressed;
            };
            match fetch.fetcher.step() {
                Step::Start(candidate) => {
                    progressed = true;
                    self.start_request(pool, candidate);
                }
                Step::Hungry => {
                    progressed = true;
                    self.finder.hungry();
                }
                Step::Wait => return progressed,
                Step::Done { blocks, cancel } => {
                    progressed = true;
                    self.complete_segment(blocks, cancel).await;
                    return progressed;
                }
                Step::Fail(err) => {
                    progressed = true;
                    self.fetch_failed(err).await;
                    return progressed;
                }
            }
        }
    }

    /// Begin fetching the next segment of the current read, if one is due.
    fn ensure_fetch(&mut self) -> bool {
        if self.fetch.is_some() || self.paused {
            return false;
        }
        let Some(read) = &self.current else {
            return false;
        };
        let geometry = self.common.geometry();
        let segnum = read.next_segnum(geometry);
        let mut fetcher = SegmentFetcher::new(
            segnum,
            self.config.needed_shares as usize,
            self.initial_cap,
        );
        let seed: Vec<Candidate<S::Id>> = self
            .shares
            .iter()
            .filter(|(id, _)| !self.finder.is_undelivered(**id))
            .map(|(id, sh)| Candidate {
                share: *id,
                shnum: sh.shnum,
                server: sh.server.id(),
                rtt: sh.rtt,
            })
            .collect();
        fetcher.add_candidates(seed);
        if self.exhausted {
            fetcher.no_more_shares();
        }
        self.fetch = Some(FetchState {
            fetcher,
            requests: HashMap::new(),
            geometry,
        });
        true
    }

    fn start_request(&mut self, pool: &mut EventPool<S>, candidate: Candidate<S::Id>) {
        if !self.shares.contains_key(&candidate.share) {
            if let Some(fetch) = &mut self.fetch {
                fetch.fetcher.on_failure(candidate.share, ShareFailure::Dead);
            }
            return;
        }
        let request = self.next_request;
        self.next_request += 1;
        if let Some(fetch) = &mut self.fetch {
            fetch.requests.insert(candidate.share, request);
        }
        self.metrics.requests_active.inc();
        if self.common.authoritative() {
            self.push_block_request(pool, request, candidate.share);
        } else {
            self.push_geometry_request(pool, request, candidate.share);
        }
    }

    fn push_discovery(&mut self, pool: &mut EventPool<S>, mut server: S) {
        let storage_index = self.config.storage_index;
        let clock = self.context.clone();
        self.metrics.queries.inc();
        self.metrics.queries_active.inc();
        pool.push(Box::pin(async move {
            let started = clock.current();
            let result = server.enumerate(&storage_index).await;
            let rtt = clock.current().duration_since(started).unwrap_or_default();
            Event::Discovered {
                server,
                rtt,
                result,
            }
        }));
    }

    fn push_geometry_request(&mut self, pool: &mut EventPool<S>, request: u64, share: ShareId) {
        let Some(sh) = self.shares.get(&share) else {
            return;
        };
        let mut server = sh.server.clone();
        let shnum = sh.shnum;
        let storage_index = self.config.storage_index;
        let fut: BoxFuture<'static, Event<S>> = Box::pin(async move {
            let result = server.geometry(&storage_index, shnum).await;
            Event::Geometry {
                request,
                share,
                result,
            }
        });
        self.push_with_overdue(pool, request, share, fut);
    }

    fn push_block_request(&mut self, pool: &mut EventPool<S>, request: u64, share: ShareId) {
        let Some(fetch) = &self.fetch else {
            return;
        };
        let segnum = fetch.fetcher.segnum();
        let Some(sh) = self.shares.get_mut(&share) else {
            return;
        };
        sh.ensure_tree(&mut self.hasher, self.common.geometry().num_segments);
        let share_wanted = self
            .common
            .needed_share_hashes(sh.shnum)
            .unwrap_or_default();
        let block_wanted = sh.needed_block_hashes(segnum).unwrap_or_default();
        let mut server = sh.server.clone();
        let shnum = sh.shnum;
        let storage_index = self.config.storage_index;
        let clock = self.context.clone();
        let fut: BoxFuture<'static, Event<S>> = Box::pin(async move {
            let started = clock.current();
            let result: Result<Payload<S::Digest>, S::Error> = async {
                let share_proof = if share_wanted.is_empty() {
                    Vec::new()
                } else {
                    server.share_proof(&storage_index, share_wanted).await?
                };
                let block_proof = if block_wanted.is_empty() {
                    Vec::new()
                } else {
                    server.block_proof(&storage_index, shnum, block_wanted).await?
                };
                let block = server.block(&storage_index, shnum, segnum).await?;
                Ok(Payload {
                    share_proof,
                    block_proof,
                    block,
                })
            }
            .await;
            Event::Block {
                request,
                share,
                segnum,
                started,
                result,
            }
        });
        self.push_with_overdue(pool, request, share, fut);
    }

    /// Wrap a request future so that outliving the overdue threshold surfaces an
    /// [Event::Overdue] carrying the still-pending remainder.
    fn push_with_overdue(
        &self,
        pool: &mut EventPool<S>,
        request: u64,
        share: ShareId,
        fut: BoxFuture<'static, Event<S>>,
    ) {
        let timeout = self.config.overdue_timeout;
        let clock = self.context.clone();
        pool.push(Box::pin(async move {
            let sleep = Box::pin(clock.sleep(timeout));
            match future::select(fut, sleep).await {
                Either::Left((event, _)) => event,
                Either::Right((_, rest)) => Event::Overdue {
                    request,
                    share,
                    rest,
                },
            }
        }));
    }

    /// A share failed terminally; it never contributes to this download again.
    fn share_failed(&mut self, share: ShareId, failure: ShareFailure) {
        if let Some(fetch) = &mut self.fetch {
            fetch.fetcher.on_failure(share, failure);
            if let Some(request) = fetch.requests.remove(&share) {
                self.cancelled.insert(request);
                self.metrics.requests_active.dec();
            }
        }
        self.shares.remove(&share);
        if failure == ShareFailure::Corrupt {
            self.metrics.blocks_corrupt.inc();
        }
    }

    /// A server failed a request; every share it holds dies with it.
    fn server_dead(&mut self, server: &S::Id) {
        let ids: Vec<ShareId> = self
            .shares
            .iter()
            .filter(|(_, sh)| &sh.server.id() == server)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.share_failed(id, ShareFailure::Dead);
        }
        if let Some(fetch) = &mut self.fetch {
            fetch.fetcher.remove_server(server);
        }
    }

    /// The authoritative geometry just arrived; a fetch started under the guess may
    /// be aiming past the end of the file.
    async fn check_segment_bounds(&mut self) {
        let num_segments = self.common.geometry().num_segments;
        let Some(fetch) = &self.fetch else {
            return;
        };
        let segnum = fetch.fetcher.segnum();
        if segnum < num_segments {
            return;
        }
        self.metrics.bad_segments.inc();
        self.fetch_failed(Error::BadSegmentNumber {
            segnum,
            num_segments,
        })
        .await;
    }

    /// Cancel every outstanding request of the current fetch and drop it.
    fn abort_fetch(&mut self) {
        if let Some(fetch) = self.fetch.take() {
            for (_, request) in fetch.requests {
                self.cancelled.insert(request);
                self.metrics.requests_active.dec();
            }
        }
        self.finder.satiate();
    }

    async fn fetch_failed(&mut self, err: Error) {
        self.abort_fetch();
        if let (Error::BadSegmentNumber { .. }, Some(read)) = (&err, &mut self.current) {
            if read.retry_once() {
                debug!(?err, "retrying read under authoritative geometry");
                return;
            }
        }
        self.fail_read(err);
    }

    fn fail_read(&mut self, err: Error) {
        self.abort_fetch();
        if let Some(read) = self.current.take() {
            debug!(%err, "read failed");
            let _ = read.done.send(Err(err));
            self.metrics.read_failures.inc();
        }
    }

    fn stop_reads(&mut self) {
        self.abort_fetch();
        if let Some(read) = self.current.take() {
            let _ = read.done.send(Err(Error::Stopped));
            self.metrics.read_failures.inc();
        }
        for read in self.queue.drain(..) {
            let _ = read.done.send(Err(Error::Stopped));
            self.metrics.read_failures.inc();
        }
    }

    async fn complete_segment(&mut self, blocks: BTreeMap<u16, Bytes>, cancel: Vec<ShareId>) {
        let Some(fetch) = self.fetch.take() else {
            return;
        };
        for share in cancel {
            if let Some(request) = fetch.requests.get(&share) {
                self.cancelled.insert(*request);
                self.metrics.requests_active.dec();
            }
        }
        self.finder.satiate();
        self.initial_cap = self.initial_cap.max(fetch.fetcher.cap());
        self.metrics.segments.inc();

        let segnum = fetch.fetcher.segnum();
        let segment = match self.codec.decode(blocks) {
            Ok(segment) => segment,
            Err(err) => {
                self.fail_read(Error::Decode(err.to_string()));
                return;
            }
        };

        // Trim erasure padding to the file's true extent.
        let geometry = self.common.geometry();
        let seg_start = segnum * geometry.segment_size;
        let seg_end = (seg_start + geometry.segment_size).min(self.config.file_size);
        let expected = (seg_end.saturating_sub(seg_start)) as usize;
        if segment.len() < expected {
            self.fail_read(Error::Decode(format!(
                "segment {segnum} shorter than expected: {} < {expected}",
                segment.len()
            )));
            return;
        }
        let segment = segment.slice(0..expected);

        let Some(read) = &mut self.current else {
            return;
        };
        match read.apply(seg_start, &segment) {
            Apply::Deliver { data, finished } => {
                read.consumer.deliver(data).await;
                if finished {
                    if let Some(read) = self.current.take() {
                        let _ = read.done.send(Ok(()));
                        self.metrics.reads.inc();
                    }
                }
            }
            Apply::Mismatch => {
                if read.retry_once() {
                    debug!(segnum, "segment missed the window, refetching under authoritative geometry");
                } else {
                    let current = self.common.geometry();
                    self.fail_read(Error::InconsistentGeometry(fetch.geometry, current));
                }
            }
        }
    }
}
