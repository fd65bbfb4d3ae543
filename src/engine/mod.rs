//! Locate, validate, and reassemble the shares of one erasure-coded file.
//!
//! The engine is a single actor owning all download state. A [Mailbox] accepts
//! byte-range reads (plus pause/resume/stop); discovery walks a per-file permuted
//! server list; a per-segment scheduler races block requests across servers by
//! observed latency; every hash and block is validated against the capability's
//! root before decode; and decoded bytes are delivered to the read's consumer in
//! order.
//!
//! Failure handling is graded: a server error kills every share it holds, a
//! validation failure kills only the offending share, and a slow request is merely
//! marked overdue so a spare can be activated while the original stays live. A
//! read fails only once discovery is exhausted and fewer than `needed_shares`
//! blocks can still arrive.

mod actor;
mod config;
mod fetcher;
mod finder;
mod ingress;
mod metrics;
mod segmentation;
mod share;

pub use actor::Engine;
pub use config::Config;
pub use ingress::Mailbox;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
