use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for the engine.
pub(super) struct Metrics {
    /// Number of discovery queries sent
    pub queries: Counter,
    /// Current number of discovery queries in flight
    pub queries_active: Gauge,
    /// Number of discovery queries that failed
    pub query_failures: Counter,
    /// Number of shares located
    pub shares_located: Counter,
    /// Current number of block requests in flight
    pub requests_active: Gauge,
    /// Number of blocks fetched and validated
    pub blocks_complete: Counter,
    /// Number of blocks that failed validation
    pub blocks_corrupt: Counter,
    /// Number of block requests that failed at the server
    pub blocks_dead: Counter,
    /// Number of block requests that went overdue
    pub blocks_overdue: Counter,
    /// Number of fetches aborted for a segment number past the end of the file
    pub bad_segments: Counter,
    /// Number of segments decoded
    pub segments: Counter,
    /// Number of reads completed
    pub reads: Counter,
    /// Number of reads failed
    pub read_failures: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Self {
            queries: Counter::default(),
            queries_active: Gauge::default(),
            query_failures: Counter::default(),
            shares_located: Counter::default(),
            requests_active: Gauge::default(),
            blocks_complete: Counter::default(),
            blocks_corrupt: Counter::default(),
            blocks_dead: Counter::default(),
            blocks_overdue: Counter::default(),
            bad_segments: Counter::default(),
            segments: Counter::default(),
            reads: Counter::default(),
            read_failures: Counter::default(),
        };
        context.register(
            "queries",
            "Number of discovery queries sent",
            metrics.queries.clone(),
        );
        context.register(
            "queries_active",
            "Current number of discovery queries in flight",
            metrics.queries_active.clone(),
        );
        context.register(
            "query_failures",
            "Number of discovery queries that failed",
            metrics.query_failures.clone(),
        );
        context.register(
            "shares_located",
            "Number of shares located",
            metrics.shares_located.clone(),
        );
        context.register(
            "requests_active",
            "Current number of block requests in flight",
            metrics.requests_active.clone(),
        );
        context.register(
            "blocks_complete",
            "Number of blocks fetched and validated",
            metrics.blocks_complete.clone(),
        );
        context.register(
            "blocks_corrupt",
            "Number of blocks that failed validation",
            metrics.blocks_corrupt.clone(),
        );
        context.register(
            "blocks_dead",
            "Number of block requests that failed at the server",
            metrics.blocks_dead.clone(),
        );
        context.register(
            "blocks_overdue",
            "Number of block requests that went overdue",
            metrics.blocks_overdue.clone(),
        );
        context.register(
            "bad_segments",
            "Number of fetches aborted for a segment number past the end of the file",
            metrics.bad_segments.clone(),
        );
        context.register(
            "segments",
            "Number of segments decoded",
            metrics.segments.clone(),
        );
        context.register("reads", "Number of reads completed", metrics.reads.clone());
        context.register(
            "read_failures",
            "Number of reads failed",
            metrics.read_failures.clone(),
        );
        metrics
    }
}
