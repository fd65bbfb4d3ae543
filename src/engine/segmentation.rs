use crate::{Consumer, Error, Geometry};
use bytes::Bytes;
use futures::channel::oneshot;

/// Outcome of offering a fetched segment to a read.
#[derive(Debug)]
pub(super) enum Apply {
    /// These bytes belong to the window; deliver them to the consumer.
    Deliver {
        data: Bytes,
        finished: bool,
    },

    /// The segment does not begin the remaining window: the segment size used when
    /// the fetch started was a wrong guess.
    Mismatch,
}

/// One (offset, length) read in progress: the window of file bytes still owed to the
/// consumer.
///
/// The first segment of a read may be fetched under a guessed segment size; the
/// guess can be wrong exactly once, after which the authoritative geometry is known
/// and every computed segment number and overlap is exact.
pub(super) struct ReadState<Con: Consumer> {
    pub consumer: Con,
    pub done: oneshot::Sender<Result<(), Error>>,
    offset: u64,
    remaining: u64,
    retried: bool,
}

impl<Con: Consumer> ReadState<Con> {
    pub fn new(
        consumer: Con,
        done: oneshot::Sender<Result<(), Error>>,
        offset: u64,
        remaining: u64,
    ) -> Self {
        Self {
            consumer,
            done,
            offset,
            remaining,
            retried: false,
        }
    }

    /// Bytes still owed.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// The segment holding the next byte owed, under the given geometry.
    pub fn next_segnum(&self, geometry: Geometry) -> u64 {
        self.offset / geometry.segment_size
    }

    /// Whether one retry (wrong guessed segment size, or a guessed segment number
    /// past the end of the file) is still allowed. The first call consumes it.
    pub fn retry_once(&mut self) -> bool {
        if self.retried {
            return false;
        }
        self.retried = true;
        true
    }

    /// Offer the segment starting at file offset `seg_start`. On overlap, advances
    /// the window past the delivered bytes.
    pub fn apply(&mut self, seg_start: u64, segment: &Bytes) -> Apply {
        let seg_end = seg_start + segment.len() as u64;
        if self.offset < seg_start || self.offset >= seg_end {
            return Apply::Mismatch;
        }
        let lo = (self.offset - seg_start) as usize;
        let hi = (seg_end.min(self.offset + self.remaining) - seg_start) as usize;
        let data = segment.slice(lo..hi);
        let len = (hi - lo) as u64;
        self.offset += len;
        self.remaining -= len;
        Apply::Deliver {
            data,
            finished: self.remaining == 0,
        }
    }
}
