//! Record streams produced by scans and queries.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use aerospike_core::{Error, Record, Result, ResultCode};

/// A stream of records fed by background scan or query tasks.
///
/// Records arrive in server order per node; there is no ordering across
/// nodes. A failure is delivered as an `Err` item and ends the stream.
/// Dropping the recordset or calling [`Recordset::close`] stops the
/// producers at their next record boundary.
#[derive(Debug)]
pub struct Recordset {
    receiver: mpsc::Receiver<Result<Record>>,
    cancel: CancellationToken,
    task_id: u64,
}

impl Recordset {
    /// Creates a recordset and the sender its producers write to.
    ///
    /// `terminated` is the code producers fail with once the consumer
    /// has closed the stream.
    pub(crate) fn channel(capacity: usize, task_id: u64, terminated: ResultCode) -> (Self, RecordSender) {
        let (tx, receiver) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        let sender = RecordSender {
            tx,
            cancel: cancel.clone(),
            terminated,
        };
        (
            Self {
                receiver,
                cancel,
                task_id,
            },
            sender,
        )
    }

    /// Id sent to the server with the scan or query.
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    /// Waits for the next record; `None` once every producer has finished.
    pub async fn next_record(&mut self) -> Option<Result<Record>> {
        self.receiver.recv().await
    }

    /// Stops the producers. Records already queued can still be read.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// True once [`Recordset::close`] was called or the recordset dropped.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for Recordset {
    type Item = Result<Record>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Recordset {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Producer half of a [`Recordset`].
#[derive(Debug, Clone)]
pub(crate) struct RecordSender {
    tx: mpsc::Sender<Result<Record>>,
    cancel: CancellationToken,
    terminated: ResultCode,
}

impl RecordSender {
    /// Queues a record, waiting for room. Fails once the consumer closed.
    pub(crate) async fn send(&self, record: Record) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(self.terminated_error());
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(self.terminated_error()),
            sent = self.tx.send(Ok(record)) => sent.map_err(|_| self.terminated_error()),
        }
    }

    /// Delivers the error that ended the producers, unless the consumer
    /// is gone or caused it by closing.
    pub(crate) async fn fail(&self, error: Error) {
        if self.cancel.is_cancelled() {
            return;
        }
        tracing::debug!(error = %error, "record stream failed");
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.tx.send(Err(error)) => {}
        }
    }

    /// True once the consumer closed or dropped the recordset.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Error producers return once cancelled.
    pub(crate) fn terminated_error(&self) -> Error {
        Error::client(self.terminated, "recordset closed by consumer")
    }
}
