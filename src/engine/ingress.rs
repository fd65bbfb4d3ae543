use crate::{Consumer, Error};
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};

/// Messages sent to the engine.
pub(super) enum Message<Con: Consumer> {
    /// Read `length` bytes starting at `offset`, delivering them to `consumer`.
    Read {
        offset: u64,
        length: u64,
        consumer: Con,
        done: oneshot::Sender<Result<(), Error>>,
    },

    /// Suspend segment fetching.
    Pause,

    /// Resume segment fetching.
    Resume,

    /// Abort the in-progress read (and any queued reads) with [Error::Stopped].
    Stop,
}

/// A handle to send requests to an [crate::Engine].
#[derive(Clone)]
pub struct Mailbox<Con: Consumer> {
    sender: mpsc::Sender<Message<Con>>,
}

impl<Con: Consumer> Mailbox<Con> {
    pub(super) fn new(sender: mpsc::Sender<Message<Con>>) -> Self {
        Self { sender }
    }

    /// Read a byte range of the file, delivering verified bytes to `consumer` in
    /// order. Ranges extending past the end of the file are truncated.
    ///
    /// The returned receiver resolves once every requested byte has been delivered
    /// (or the read failed). If the engine has shut down, the receiver is cancelled.
    pub async fn read(
        &mut self,
        offset: u64,
        length: u64,
        consumer: Con,
    ) -> oneshot::Receiver<Result<(), Error>> {
        let (done, receiver) = oneshot::channel();
        let _ = self
            .sender
            .send(Message::Read {
                offset,
                length,
                consumer,
                done,
            })
            .await;
        receiver
    }

    /// Stop issuing new segment fetches until [Mailbox::resume].
    pub async fn pause(&mut self) {
        let _ = self.sender.send(Message::Pause).await;
    }

    /// Resume segment fetching where it left off.
    pub async fn resume(&mut self) {
        let _ = self.sender.send(Message::Resume).await;
    }

    /// Abort the in-progress read (and any queued reads) with [Error::Stopped].
    pub async fn stop(&mut self) {
        let _ = self.sender.send(Message::Stop).await;
    }
}
