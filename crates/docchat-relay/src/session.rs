use futures::{Stream, StreamExt as _};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::decoder::EventStreamDecoder;
use crate::errors::{RelayError, SessionFailure, TransitionError};
use crate::extractor::{ChatDelta, Extraction, extract};
use crate::relay::FragmentSink;

/// Lifecycle of one question/answer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Receiving bytes and emitting fragments.
    Open,
    /// The provider sent the end-of-stream sentinel.
    Complete,
    /// Decode, extraction or transport failure, or cancellation.
    Error,
    /// The upstream body ended without a sentinel. Treated as completion.
    ClosedByPeer,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }

    /// Moves to `next`. Terminal states accept no further transition.
    pub fn advance(&mut self, next: SessionState) -> Result<(), TransitionError> {
        if self.is_terminal() || next == SessionState::Open {
            return Err(TransitionError {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

/// Handle used to request cancellation of a running session.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    /// Requests cancellation.
    ///
    /// The session drops its upstream connection and ends in `Error` with
    /// `SessionFailure::Cancelled`.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiving side of an [`AbortHandle`].
#[derive(Debug)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self { rx }
    }

    /// Resolves once abort was requested. Pending forever if every handle was
    /// dropped without aborting.
    pub async fn requested(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Creates a linked abort handle and signal.
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx }, AbortSignal { rx })
}

/// Final report of a session.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SessionOutcome {
    pub session_id: uuid::Uuid,
    pub state: SessionState,
    /// Fragments accepted by the sink.
    pub fragments: u64,
    /// Concatenation of the delivered fragments.
    pub answer: String,
    /// Set when `state` is `Error`.
    pub failure: Option<SessionFailure>,
}

impl SessionOutcome {
    /// `Complete` and `ClosedByPeer` both count as success.
    pub fn is_success(&self) -> bool {
        matches!(
            self.state,
            SessionState::Complete | SessionState::ClosedByPeer
        )
    }

    /// Returns the answer text, or the failure for an `Error` session.
    pub fn into_result(self) -> Result<String, SessionFailure> {
        match self.failure {
            Some(failure) => Err(failure),
            None => Ok(self.answer),
        }
    }
}

enum Exit {
    Finished(SessionState, Option<SessionFailure>),
    Cancelled,
    ConsumerGone,
}

/// One read→decode→extract→emit pipeline.
///
/// Owns its decoder; `run` consumes the session so it terminates exactly once.
#[derive(Debug)]
pub struct StreamSession {
    id: uuid::Uuid,
    state: SessionState,
    decoder: EventStreamDecoder,
    fragments: u64,
    answer: String,
}

impl Default for StreamSession {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSession {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            state: SessionState::Open,
            decoder: EventStreamDecoder::new(),
            fragments: 0,
            answer: String::new(),
        }
    }

    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Pumps `bytes` into `sink` until a terminal state is reached.
    ///
    /// Suspends only while awaiting the next upstream chunk or sink capacity.
    /// `bytes` is dropped before the sink hears the terminal signal, which
    /// closes the upstream connection even when the sentinel arrived before
    /// the body ended. On cancellation the signal does not wait for capacity.
    pub async fn run<S, B, E, K>(
        mut self,
        bytes: S,
        sink: &mut K,
        mut abort: AbortSignal,
    ) -> SessionOutcome
    where
        S: Stream<Item = Result<B, E>> + Send,
        B: AsRef<[u8]>,
        E: std::fmt::Display,
        K: FragmentSink + ?Sized,
    {
        debug!(session_id = %self.id, "session opened");
        match self.pump(bytes, sink, &mut abort).await {
            Exit::Finished(state, failure) => self.terminate(sink, state, failure).await,
            Exit::Cancelled => self.cancel(sink).await,
            Exit::ConsumerGone => self.abandon(),
        }
    }

    async fn pump<S, B, E, K>(&mut self, bytes: S, sink: &mut K, abort: &mut AbortSignal) -> Exit
    where
        S: Stream<Item = Result<B, E>> + Send,
        B: AsRef<[u8]>,
        E: std::fmt::Display,
        K: FragmentSink + ?Sized,
    {
        futures::pin_mut!(bytes);

        loop {
            let next = tokio::select! {
                biased;
                _ = abort.requested() => return Exit::Cancelled,
                _ = sink.consumer_gone() => {
                    debug!(session_id = %self.id, "relay consumer disconnected");
                    return Exit::ConsumerGone;
                }
                next = bytes.next() => next,
            };

            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => {
                    let failure = SessionFailure::Transport {
                        message: err.to_string(),
                    };
                    return Exit::Finished(SessionState::Error, Some(failure));
                }
                None => {
                    if self.decoder.has_pending() {
                        warn!(session_id = %self.id, "upstream closed mid-event; discarding partial frame");
                    }
                    return Exit::Finished(SessionState::ClosedByPeer, None);
                }
            };

            for decoded in self.decoder.push(chunk.as_ref()) {
                let event = match decoded {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(session_id = %self.id, error = %err, "malformed event-stream framing");
                        return Exit::Finished(SessionState::Error, Some(SessionFailure::from(&err)));
                    }
                };
                match extract(&event) {
                    Ok(Extraction::Delta(delta)) => {
                        let delivered = tokio::select! {
                            biased;
                            _ = abort.requested() => return Exit::Cancelled,
                            result = self.deliver(sink, delta) => result,
                        };
                        match delivered {
                            Ok(()) => {}
                            Err(RelayError::ConsumerGone) => {
                                debug!(session_id = %self.id, "relay consumer disconnected");
                                return Exit::ConsumerGone;
                            }
                            Err(err) => {
                                warn!(session_id = %self.id, error = %err, "fragment sink rejected append");
                                return Exit::ConsumerGone;
                            }
                        }
                    }
                    Ok(Extraction::Skip) => {}
                    Ok(Extraction::Done) => return Exit::Finished(SessionState::Complete, None),
                    Err(err) => {
                        warn!(session_id = %self.id, error = %err, "completion chunk rejected");
                        return Exit::Finished(
                            SessionState::Error,
                            Some(SessionFailure::from(&err)),
                        );
                    }
                }
            }
        }
    }

    async fn deliver<K>(&mut self, sink: &mut K, delta: ChatDelta) -> Result<(), RelayError>
    where
        K: FragmentSink + ?Sized,
    {
        let text = delta.as_str().to_owned();
        sink.append(delta).await?;
        self.fragments += 1;
        self.answer.push_str(&text);
        Ok(())
    }

    async fn terminate<K>(
        mut self,
        sink: &mut K,
        state: SessionState,
        failure: Option<SessionFailure>,
    ) -> SessionOutcome
    where
        K: FragmentSink + ?Sized,
    {
        if let Err(err) = self.state.advance(state) {
            warn!(session_id = %self.id, error = %err, "ignoring transition");
        }
        let notified = match &failure {
            Some(failure) => sink.fail(failure.clone()).await,
            None => sink.close().await,
        };
        if let Err(err) = notified {
            debug!(session_id = %self.id, error = %err, "terminal signal not delivered");
        }
        debug!(session_id = %self.id, state = ?self.state, fragments = self.fragments, "session finished");
        self.outcome(failure)
    }

    async fn cancel<K>(mut self, sink: &mut K) -> SessionOutcome
    where
        K: FragmentSink + ?Sized,
    {
        if let Err(err) = self.state.advance(SessionState::Error) {
            warn!(session_id = %self.id, error = %err, "ignoring transition");
        }
        if let Err(err) = sink.fail_now(SessionFailure::Cancelled).await {
            debug!(session_id = %self.id, error = %err, "cancellation not delivered");
        }
        debug!(session_id = %self.id, fragments = self.fragments, "session cancelled");
        self.outcome(Some(SessionFailure::Cancelled))
    }

    // Consumer is gone; there is nobody left to notify.
    fn abandon(mut self) -> SessionOutcome {
        if let Err(err) = self.state.advance(SessionState::Error) {
            warn!(session_id = %self.id, error = %err, "ignoring transition");
        }
        self.outcome(Some(SessionFailure::Cancelled))
    }

    fn outcome(self, failure: Option<SessionFailure>) -> SessionOutcome {
        SessionOutcome {
            session_id: self.id,
            state: self.state,
            fragments: self.fragments,
            answer: self.answer,
            failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay;
    use bytes::Bytes;
    use futures::stream;
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Sink that records everything and refuses calls after termination.
    #[derive(Default)]
    struct RecordingSink {
        fragments: Vec<String>,
        closed: u32,
        failures: Vec<SessionFailure>,
        rejected: u32,
    }

    impl RecordingSink {
        fn terminated(&self) -> bool {
            self.closed > 0 || !self.failures.is_empty()
        }

        fn text(&self) -> String {
            self.fragments.concat()
        }
    }

    #[async_trait::async_trait]
    impl FragmentSink for RecordingSink {
        async fn append(&mut self, fragment: ChatDelta) -> Result<(), RelayError> {
            if self.terminated() {
                self.rejected += 1;
                return Err(RelayError::Terminated);
            }
            self.fragments.push(fragment.into_string());
            Ok(())
        }

        async fn close(&mut self) -> Result<(), RelayError> {
            if self.terminated() {
                self.rejected += 1;
                return Err(RelayError::Terminated);
            }
            self.closed += 1;
            Ok(())
        }

        async fn fail(&mut self, failure: SessionFailure) -> Result<(), RelayError> {
            if self.terminated() {
                self.rejected += 1;
                return Err(RelayError::Terminated);
            }
            self.failures.push(failure);
            Ok(())
        }
    }

    fn chunk_event(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"index": 0, "delta": {"content": content}}]})
        )
    }

    fn hello_world_wire() -> Vec<u8> {
        let mut wire = String::new();
        wire.push_str(": keep-alive\n\n");
        wire.push_str(&format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"index": 0, "delta": {"role": "assistant"}}]})
        ));
        for part in ["Hel", "lo ", "world"] {
            wire.push_str(&chunk_event(part));
        }
        wire.push_str("data: [DONE]\n\n");
        wire.into_bytes()
    }

    fn chunked(bytes: &[u8], size: usize) -> Vec<Result<Bytes, Infallible>> {
        bytes
            .chunks(size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect()
    }

    async fn run_chunks(chunks: Vec<Result<Bytes, Infallible>>) -> (SessionOutcome, RecordingSink) {
        let mut sink = RecordingSink::default();
        let outcome = StreamSession::new()
            .run(stream::iter(chunks), &mut sink, AbortSignal::never())
            .await;
        (outcome, sink)
    }

    #[tokio::test]
    async fn three_deltas_then_sentinel_yield_hello_world() {
        let (outcome, sink) = run_chunks(chunked(&hello_world_wire(), 4096)).await;
        assert_eq!(sink.fragments, vec!["Hel", "lo ", "world"]);
        assert_eq!(sink.text(), "Hello world");
        assert_eq!(sink.closed, 1);
        assert!(sink.failures.is_empty());
        assert_eq!(outcome.state, SessionState::Complete);
        assert_eq!(outcome.fragments, 3);
        assert_eq!(outcome.into_result(), Ok("Hello world".to_string()));
    }

    #[tokio::test]
    async fn output_is_invariant_to_chunk_boundaries() {
        let wire = hello_world_wire();
        let (_, reference) = run_chunks(chunked(&wire, wire.len())).await;
        for size in [1, 2, 3, 5, 7, 13, 64] {
            let (outcome, sink) = run_chunks(chunked(&wire, size)).await;
            assert_eq!(sink.fragments, reference.fragments, "chunk size {size}");
            assert_eq!(outcome.state, SessionState::Complete, "chunk size {size}");
        }

        // Ragged, non-uniform split.
        let mut ragged = Vec::new();
        let mut rest = &wire[..];
        for size in [1usize, 9, 2, 30, 4].iter().cycle() {
            if rest.is_empty() {
                break;
            }
            let take = (*size).min(rest.len());
            ragged.push(Ok(Bytes::copy_from_slice(&rest[..take])));
            rest = &rest[take..];
        }
        let (_, sink) = run_chunks(ragged).await;
        assert_eq!(sink.fragments, reference.fragments);
    }

    #[tokio::test]
    async fn sentinel_stops_processing_of_following_bytes() {
        let mut wire = String::new();
        wire.push_str(&chunk_event("only"));
        wire.push_str("data: [DONE]\n\n");
        wire.push_str(&chunk_event("ignored"));
        wire.push_str("not even valid\n");
        let chunks = vec![
            Ok(Bytes::from(wire)),
            Ok(Bytes::from(chunk_event("also ignored"))),
        ];
        let (outcome, sink) = run_chunks(chunks).await;
        assert_eq!(sink.fragments, vec!["only"]);
        assert_eq!(sink.closed, 1);
        assert_eq!(sink.rejected, 0);
        assert_eq!(outcome.state, SessionState::Complete);
    }

    #[tokio::test]
    async fn event_without_content_neither_emits_nor_terminates() {
        let mut wire = String::new();
        wire.push_str(&format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]})
        ));
        wire.push_str(&chunk_event("after"));
        wire.push_str("data: [DONE]\n\n");
        let (outcome, sink) = run_chunks(chunked(wire.as_bytes(), 16)).await;
        assert_eq!(sink.fragments, vec!["after"]);
        assert_eq!(outcome.state, SessionState::Complete);
    }

    #[tokio::test]
    async fn malformed_line_fails_after_preserving_earlier_fragments() {
        let mut wire = String::new();
        wire.push_str(&chunk_event("kept"));
        wire.push_str("this line has no separator\n\n");
        wire.push_str(&chunk_event("never"));
        let (outcome, sink) = run_chunks(chunked(wire.as_bytes(), 5)).await;
        assert_eq!(sink.fragments, vec!["kept"]);
        assert_eq!(sink.closed, 0);
        assert!(matches!(
            sink.failures.as_slice(),
            [SessionFailure::Decode { message }] if message.contains("missing ':'")
        ));
        assert_eq!(outcome.state, SessionState::Error);
        assert_eq!(outcome.answer, "kept");
    }

    #[tokio::test]
    async fn invalid_json_payload_fails_session() {
        let mut wire = chunk_event("one");
        wire.push_str("data: {\"choices\": [\n\n");
        let (outcome, sink) = run_chunks(chunked(wire.as_bytes(), 4096)).await;
        assert_eq!(sink.fragments, vec!["one"]);
        assert!(matches!(
            sink.failures.as_slice(),
            [SessionFailure::Extraction { .. }]
        ));
        assert_eq!(outcome.state, SessionState::Error);
    }

    #[tokio::test]
    async fn end_of_input_without_sentinel_is_closed_by_peer() {
        let mut wire = chunk_event("partial ");
        wire.push_str(&chunk_event("answer"));
        wire.push_str("data: {\"choices\":[{\"delta\":{\"content\":\"cut");
        let (outcome, sink) = run_chunks(chunked(wire.as_bytes(), 11)).await;
        assert_eq!(sink.text(), "partial answer");
        assert_eq!(sink.closed, 1);
        assert!(sink.failures.is_empty());
        assert_eq!(outcome.state, SessionState::ClosedByPeer);
        assert!(outcome.is_success());
        assert_eq!(outcome.failure, None);
    }

    #[tokio::test]
    async fn transport_error_fails_session() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from(chunk_event("a"))),
            Err("connection reset".to_string()),
            Ok(Bytes::from(chunk_event("b"))),
        ];
        let mut sink = RecordingSink::default();
        let outcome = StreamSession::new()
            .run(stream::iter(chunks), &mut sink, AbortSignal::never())
            .await;
        assert_eq!(sink.fragments, vec!["a"]);
        assert_eq!(
            sink.failures,
            vec![SessionFailure::Transport {
                message: "connection reset".into()
            }]
        );
        assert_eq!(outcome.state, SessionState::Error);
    }

    #[tokio::test]
    async fn sink_never_sees_duplicates_or_post_terminal_calls() {
        let mut wire = hello_world_wire();
        wire.extend_from_slice(b"data: [DONE]\n\n");
        wire.extend_from_slice(chunk_event("late").as_bytes());
        for size in [1, 6, 4096] {
            let (_, sink) = run_chunks(chunked(&wire, size)).await;
            assert_eq!(sink.fragments, vec!["Hel", "lo ", "world"]);
            assert_eq!(sink.closed, 1);
            assert_eq!(sink.rejected, 0);
        }
    }

    #[tokio::test]
    async fn abort_drops_idle_upstream_and_fails_with_cancelled() {
        let (handle, signal) = abort_pair();
        let first: Vec<Result<Bytes, Infallible>> = vec![Ok(Bytes::from(chunk_event("hi")))];
        let bytes = stream::iter(first).chain(stream::pending());
        let (mut tx, mut rx) = relay::channel(8);

        let task = tokio::spawn(async move {
            StreamSession::new().run(bytes, &mut tx, signal).await
        });

        assert_eq!(rx.next_fragment().await, Some(Ok(Bytes::from("hi"))));
        handle.abort();
        assert_eq!(
            rx.next_fragment().await,
            Some(Err(SessionFailure::Cancelled))
        );
        let outcome = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("session ends promptly")
            .expect("join");
        assert_eq!(outcome.state, SessionState::Error);
        assert_eq!(outcome.failure, Some(SessionFailure::Cancelled));
    }

    /// Upstream body that records when it is dropped.
    struct TrackedUpstream {
        inner: std::pin::Pin<Box<dyn Stream<Item = Result<Bytes, Infallible>> + Send>>,
        dropped: Arc<AtomicBool>,
    }

    impl Stream for TrackedUpstream {
        type Item = Result<Bytes, Infallible>;

        fn poll_next(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Option<Self::Item>> {
            self.inner.as_mut().poll_next(cx)
        }
    }

    impl Drop for TrackedUpstream {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn abort_with_stalled_consumer_drops_upstream_without_waiting() {
        let dropped = Arc::new(AtomicBool::new(false));
        let first: Vec<Result<Bytes, Infallible>> = vec![
            Ok(Bytes::from(chunk_event("first"))),
            Ok(Bytes::from(chunk_event("second"))),
        ];
        let bytes = TrackedUpstream {
            inner: Box::pin(stream::iter(first).chain(stream::pending())),
            dropped: dropped.clone(),
        };
        let (handle, signal) = abort_pair();
        let (mut tx, mut rx) = relay::channel(1);

        let task = tokio::spawn(async move {
            StreamSession::new().run(bytes, &mut tx, signal).await
        });

        // "first" fills the channel; "second" waits for capacity nobody frees.
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        let outcome = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("session ends despite the unread relay")
            .expect("join");
        assert!(dropped.load(Ordering::SeqCst), "upstream must be dropped");
        assert_eq!(outcome.state, SessionState::Error);
        assert_eq!(outcome.failure, Some(SessionFailure::Cancelled));
        assert_eq!(outcome.fragments, 1);

        assert_eq!(rx.next_fragment().await, Some(Ok(Bytes::from("first"))));
        assert_eq!(
            rx.next_fragment().await,
            Some(Err(SessionFailure::Interrupted))
        );
    }

    #[tokio::test]
    async fn upstream_is_dropped_before_completion_is_signalled() {
        let dropped = Arc::new(AtomicBool::new(false));
        let wire: Vec<Result<Bytes, Infallible>> = vec![Ok(Bytes::from(hello_world_wire()))];
        let bytes = TrackedUpstream {
            inner: Box::pin(stream::iter(wire).chain(stream::pending())),
            dropped: dropped.clone(),
        };
        let (mut tx, rx) = relay::channel(8);
        let outcome = StreamSession::new()
            .run(bytes, &mut tx, AbortSignal::never())
            .await;
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(outcome.state, SessionState::Complete);
        let items: Vec<_> = rx.collect().await;
        assert_eq!(items.len(), 3);
    }

    #[tokio::test]
    async fn consumer_disconnect_ends_session_promptly() {
        let bytes = stream::pending::<Result<Bytes, Infallible>>();
        let (mut tx, rx) = relay::channel(8);
        let task = tokio::spawn(async move {
            StreamSession::new()
                .run(bytes, &mut tx, AbortSignal::never())
                .await
        });
        drop(rx);
        let outcome = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("session ends promptly")
            .expect("join");
        assert_eq!(outcome.state, SessionState::Error);
        assert_eq!(outcome.failure, Some(SessionFailure::Cancelled));
    }

    #[test]
    fn terminal_states_reject_transitions() {
        let mut state = SessionState::Open;
        state.advance(SessionState::ClosedByPeer).expect("open -> closed");
        for next in [
            SessionState::Open,
            SessionState::Complete,
            SessionState::Error,
            SessionState::ClosedByPeer,
        ] {
            let err = state.advance(next).expect_err("terminal");
            assert_eq!(err.from, SessionState::ClosedByPeer);
        }
        assert_eq!(state, SessionState::ClosedByPeer);
        assert!(SessionState::Open.advance(SessionState::Open).is_err());
    }
}
