//! Back-pressured fragment relay between a session and its consumer.
//!
//! The producer half ([`RelaySender`]) awaits channel capacity before every
//! append, so a slow consumer throttles the upstream reader instead of growing
//! a buffer. The consumer half ([`RelayStream`]) yields UTF-8 byte chunks and
//! tells a normal close (end of stream) apart from a failure (one `Err` item).

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;

use crate::errors::{RelayError, SessionFailure};
use crate::extractor::ChatDelta;

/// Destination for the fragments of one session.
///
/// Exactly one of `close` or `fail` terminates a sink; implementations reject
/// any call made after that with `RelayError::Terminated`.
#[async_trait::async_trait]
pub trait FragmentSink: Send + Sync {
    /// Delivers one fragment, waiting until the consumer can accept it.
    async fn append(&mut self, fragment: ChatDelta) -> Result<(), RelayError>;

    /// Signals normal completion.
    async fn close(&mut self) -> Result<(), RelayError>;

    /// Signals that the session failed.
    async fn fail(&mut self, failure: SessionFailure) -> Result<(), RelayError>;

    /// Signals a failure without waiting for consumer capacity.
    ///
    /// Used on cancellation, where a consumer that stopped reading must not
    /// keep the session alive. Defaults to `fail`.
    async fn fail_now(&mut self, failure: SessionFailure) -> Result<(), RelayError> {
        self.fail(failure).await
    }

    /// Resolves once the consumer is gone. Never resolves by default.
    async fn consumer_gone(&self) {
        std::future::pending::<()>().await
    }
}

#[derive(Debug)]
enum RelayMessage {
    Fragment(Bytes),
    Closed,
    Failed(SessionFailure),
}

/// Creates a relay whose channel holds at most `capacity` undelivered messages.
pub fn channel(capacity: usize) -> (RelaySender, RelayStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        RelaySender {
            tx: Some(tx),
            terminated: false,
            delivered: 0,
        },
        RelayStream {
            rx,
            finished: false,
        },
    )
}

/// Producer half of a relay.
#[derive(Debug)]
pub struct RelaySender {
    // `None` once detached; the consumer then observes `Interrupted`.
    tx: Option<mpsc::Sender<RelayMessage>>,
    terminated: bool,
    delivered: u64,
}

impl RelaySender {
    /// True once `close` or `fail` was called, or the consumer went away.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Fragments accepted by the channel so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    async fn send_terminal(&mut self, message: RelayMessage) -> Result<(), RelayError> {
        if self.terminated {
            return Err(RelayError::Terminated);
        }
        self.terminated = true;
        let tx = self.tx.as_ref().ok_or(RelayError::ConsumerGone)?;
        tx.send(message).await.map_err(|_| RelayError::ConsumerGone)
    }
}

#[async_trait::async_trait]
impl FragmentSink for RelaySender {
    async fn append(&mut self, fragment: ChatDelta) -> Result<(), RelayError> {
        if self.terminated {
            return Err(RelayError::Terminated);
        }
        let tx = self.tx.as_ref().ok_or(RelayError::ConsumerGone)?;
        match tx.send(RelayMessage::Fragment(fragment.into_bytes())).await {
            Ok(()) => {
                self.delivered += 1;
                Ok(())
            }
            Err(_) => {
                self.terminated = true;
                Err(RelayError::ConsumerGone)
            }
        }
    }

    async fn close(&mut self) -> Result<(), RelayError> {
        self.send_terminal(RelayMessage::Closed).await
    }

    async fn fail(&mut self, failure: SessionFailure) -> Result<(), RelayError> {
        self.send_terminal(RelayMessage::Failed(failure)).await
    }

    async fn fail_now(&mut self, failure: SessionFailure) -> Result<(), RelayError> {
        if self.terminated {
            return Err(RelayError::Terminated);
        }
        self.terminated = true;
        let tx = self.tx.take().ok_or(RelayError::ConsumerGone)?;
        match tx.try_send(RelayMessage::Failed(failure)) {
            Ok(()) => Ok(()),
            // Full: dropping `tx` ends the stream with `Interrupted` after the
            // buffered fragments.
            Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RelayError::ConsumerGone),
        }
    }

    async fn consumer_gone(&self) {
        if let Some(tx) = &self.tx {
            tx.closed().await
        }
    }
}

/// Consumer half of a relay.
///
/// Yields `Ok(bytes)` per fragment in delivery order. After a normal close the
/// stream simply ends; after a failure it yields one `Err` and then ends. A
/// sender dropped without either surfaces as `SessionFailure::Interrupted`.
#[derive(Debug)]
pub struct RelayStream {
    rx: mpsc::Receiver<RelayMessage>,
    finished: bool,
}

impl RelayStream {
    /// Waits for the next fragment. `None` after the stream has terminated.
    pub async fn next_fragment(&mut self) -> Option<Result<Bytes, SessionFailure>> {
        futures::StreamExt::next(self).await
    }

    /// True once the terminal item has been observed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Stream for RelayStream {
    type Item = Result<Bytes, SessionFailure>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        let message = ready!(self.rx.poll_recv(cx));
        match message {
            Some(RelayMessage::Fragment(bytes)) => Poll::Ready(Some(Ok(bytes))),
            Some(RelayMessage::Closed) => {
                self.finished = true;
                self.rx.close();
                Poll::Ready(None)
            }
            Some(RelayMessage::Failed(failure)) => {
                self.finished = true;
                self.rx.close();
                Poll::Ready(Some(Err(failure)))
            }
            None => {
                self.finished = true;
                Poll::Ready(Some(Err(SessionFailure::Interrupted)))
            }
        }
    }
}
