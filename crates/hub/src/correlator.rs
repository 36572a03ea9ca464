//! Correlation of dispatched questions with their answers.
//!
//! Every question gets a v4 UUID correlation id. An id is resolved at most
//! once: either with a single value (`send_answer_back`) or, on the first
//! streamed token (`send_answer_token`), with a [`ResponseStream`] that
//! receives the rest of the tokens through the [`StreamRelay`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use askhub_protocol::constants::is_end_token;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionId};
use crate::error::HubError;
use crate::stream_relay::{ResponseStream, StreamKey, StreamRelay};

/// An answer delivered for one correlation id.
pub enum Answer {
    Value(String),
    Stream(ResponseStream),
}

impl Answer {
    /// Resolves the answer to text, draining a stream if necessary.
    pub async fn into_text(self) -> String {
        match self {
            Answer::Value(text) => text,
            Answer::Stream(stream) => stream.collect_text().await,
        }
    }
}

impl fmt::Debug for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Answer::Value(text) => f.debug_tuple("Value").field(text).finish(),
            Answer::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

type Completion = oneshot::Sender<Result<Answer, HubError>>;

struct PendingRequest {
    requester: Option<ConnectionId>,
    target: String,
    target_conn: ConnectionId,
    created_at: Instant,
    completion: Completion,
}

#[derive(Default)]
struct Tables {
    pending: HashMap<String, PendingRequest>,
    /// Correlation ids currently streaming, with the producing connection.
    streaming: HashMap<String, ConnectionId>,
}

impl Tables {
    /// Removes the pending entry if `from` is the connection it was sent to.
    ///
    /// `Err` carries the target identity when someone else tries to answer.
    fn take_pending(
        &mut self,
        correlation_id: &str,
        from: ConnectionId,
    ) -> Result<Option<PendingRequest>, String> {
        match self.pending.get(correlation_id) {
            None => Ok(None),
            Some(request) if request.target_conn != from => Err(request.target.clone()),
            Some(_) => Ok(self.pending.remove(correlation_id)),
        }
    }
}

/// Table of in-flight questions.
pub struct RequestCorrelator {
    tables: Mutex<Tables>,
    relay: Arc<StreamRelay>,
}

impl RequestCorrelator {
    pub fn new(relay: Arc<StreamRelay>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            relay,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a question for `target` and returns its pending handle.
    ///
    /// `timeout` becomes the deadline enforced by [`PendingAnswer::wait`].
    pub fn begin(
        self: &Arc<Self>,
        target: &Connection,
        requester: Option<ConnectionId>,
        timeout: Option<Duration>,
    ) -> PendingAnswer {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let created_at = Instant::now();

        self.lock().pending.insert(
            correlation_id.clone(),
            PendingRequest {
                requester,
                target: target.identity().to_string(),
                target_conn: target.id(),
                created_at,
                completion: tx,
            },
        );
        debug!(
            correlation_id = %correlation_id,
            to = %target.identity(),
            requester = ?requester,
            "request pending"
        );

        PendingAnswer {
            correlation_id,
            deadline: timeout.map(|t| (created_at + t, t)),
            rx,
            correlator: Arc::clone(self),
        }
    }

    /// Resolves `correlation_id` with a single value sent by `from`.
    ///
    /// Only the connection the question was dispatched to may answer it;
    /// anyone else is told the id is unknown and the request stays pending.
    pub fn complete(
        &self,
        correlation_id: &str,
        from: ConnectionId,
        answer: String,
    ) -> Result<(), HubError> {
        let entry = self.lock().take_pending(correlation_id, from);
        let request = match entry {
            Ok(Some(request)) => request,
            Ok(None) => return Err(unknown(correlation_id)),
            Err(target) => {
                warn!(correlation_id, to = %target, "answer from a connection other than the target");
                return Err(unknown(correlation_id));
            }
        };
        debug!(
            correlation_id,
            to = %request.target,
            elapsed_ms = request.created_at.elapsed().as_millis() as u64,
            "answer received"
        );
        // The requester may have given up already; that is not an error here.
        let _ = request.completion.send(Ok(Answer::Value(answer)));
        Ok(())
    }

    /// Relays one token of a streamed answer sent by `from`.
    ///
    /// The first token resolves the pending request with a stream; later
    /// tokens are appended until one carries the end marker. Tokens from a
    /// connection other than the target are rejected like an unknown id.
    pub fn push_token(
        &self,
        correlation_id: &str,
        from: ConnectionId,
        token: &str,
    ) -> Result<(), HubError> {
        let key = StreamKey::Correlation(correlation_id.to_string());
        {
            let mut tables = self.lock();
            let started = match tables.take_pending(correlation_id, from) {
                Ok(started) => started,
                Err(target) => {
                    warn!(correlation_id, to = %target, "token from a connection other than the target");
                    return Err(unknown(correlation_id));
                }
            };
            if let Some(request) = started {
                // Subscribe before releasing the table so a concurrent token
                // finds the stream open.
                let stream = self.relay.listen(key.clone());
                tables
                    .streaming
                    .insert(correlation_id.to_string(), request.target_conn);
                debug!(correlation_id, to = %request.target, "streamed answer started");
                let _ = request.completion.send(Ok(Answer::Stream(stream)));
            } else if tables.streaming.get(correlation_id) != Some(&from) {
                return Err(unknown(correlation_id));
            }
            if is_end_token(token) {
                tables.streaming.remove(correlation_id);
            }
        }
        self.relay.push(&key, token);
        Ok(())
    }

    /// Fails every request whose target connection went away.
    ///
    /// Open answer streams from that connection are terminated as well.
    /// Returns the number of requests failed.
    pub fn fail_target(&self, target_conn: ConnectionId) -> usize {
        let (failed, streams) = {
            let mut tables = self.lock();
            let ids: Vec<String> = tables
                .pending
                .iter()
                .filter(|(_, r)| r.target_conn == target_conn)
                .map(|(id, _)| id.clone())
                .collect();
            let failed: Vec<PendingRequest> = ids
                .iter()
                .filter_map(|id| tables.pending.remove(id))
                .collect();

            let streams: Vec<String> = tables
                .streaming
                .iter()
                .filter(|(_, conn)| **conn == target_conn)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &streams {
                tables.streaming.remove(id);
            }
            (failed, streams)
        };

        let count = failed.len();
        for request in failed {
            warn!(to = %request.target, "target disconnected with request pending");
            let _ = request.completion.send(Err(HubError::NotConnected {
                identity: request.target,
            }));
        }
        for id in streams {
            self.relay.close(&StreamKey::Correlation(id));
        }
        count
    }

    /// Drops a pending request without resolving it.
    ///
    /// A late answer for the id is then reported as a duplicate completion.
    pub fn forget(&self, correlation_id: &str) -> bool {
        self.lock().pending.remove(correlation_id).is_some()
    }

    /// Drops `correlation_id` whether it is still pending or already
    /// streaming, ending its relay channel.
    ///
    /// Used when the requester stops draining an answer. A no-op for ids
    /// that already finished.
    pub fn abandon(&self, correlation_id: &str) -> bool {
        let (pending, streaming) = {
            let mut tables = self.lock();
            (
                tables.pending.remove(correlation_id).is_some(),
                tables.streaming.remove(correlation_id).is_some(),
            )
        };
        if streaming {
            debug!(correlation_id, "streamed answer abandoned");
            self.relay
                .close(&StreamKey::Correlation(correlation_id.to_string()));
        }
        pending || streaming
    }

    /// Returns `true` if `correlation_id` is mid-stream.
    pub fn is_streaming(&self, correlation_id: &str) -> bool {
        self.lock().streaming.contains_key(correlation_id)
    }

    /// Returns `true` if `correlation_id` still awaits its answer.
    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.lock().pending.contains_key(correlation_id)
    }

    /// Requester of a pending request, if it came from a connection.
    pub fn requester_of(&self, correlation_id: &str) -> Option<ConnectionId> {
        self.lock()
            .pending
            .get(correlation_id)
            .and_then(|r| r.requester)
    }

    /// Number of requests still awaiting an answer.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }
}

fn unknown(correlation_id: &str) -> HubError {
    HubError::DuplicateCompletion {
        correlation_id: correlation_id.to_string(),
    }
}

/// Sleeps until `deadline`, or forever when there is none.
pub(crate) async fn expiry(deadline: Option<(Instant, Duration)>) {
    match deadline {
        Some((at, _)) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Single-use handle for one outstanding question.
pub struct PendingAnswer {
    correlation_id: String,
    /// Absolute deadline plus the window it was derived from.
    deadline: Option<(Instant, Duration)>,
    rx: oneshot::Receiver<Result<Answer, HubError>>,
    correlator: Arc<RequestCorrelator>,
}

impl PendingAnswer {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Deadline fixed when the question was dispatched, with its window.
    ///
    /// It bounds the whole answer, including draining a stream.
    pub fn deadline(&self) -> Option<(Instant, Duration)> {
        self.deadline
    }

    /// Waits for the answer, the deadline, or `cancel`.
    ///
    /// On timeout or cancellation the request is forgotten, so a late
    /// answer is reported rather than delivered.
    pub async fn wait(self, cancel: &CancellationToken) -> Result<Answer, HubError> {
        let PendingAnswer {
            correlation_id,
            deadline,
            mut rx,
            correlator,
        } = self;

        let result = tokio::select! {
            res = &mut rx => match res {
                Ok(answer) => answer,
                // Completion dropped without a value: the table went away.
                Err(_) => Err(HubError::Cancelled),
            },
            _ = cancel.cancelled() => Err(HubError::Cancelled),
            () = expiry(deadline) => {
                let after = deadline.map(|(_, window)| window).unwrap_or_default();
                Err(HubError::timeout(format!("answer to {correlation_id}"), after))
            }
        };

        if matches!(result, Err(HubError::Cancelled | HubError::Timeout { .. })) {
            correlator.forget(&correlation_id);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use askhub_protocol::END_TOKEN;
    use futures_util::StreamExt;
    use tokio::sync::mpsc;

    use super::*;
    use crate::connection::{Role, Sender};

    fn target(identity: &str) -> Connection {
        let (tx, _rx) = mpsc::channel(8);
        Connection::new(identity, Role::Expert, Sender::new(tx))
    }

    fn correlator() -> Arc<RequestCorrelator> {
        Arc::new(RequestCorrelator::new(Arc::new(StreamRelay::new())))
    }

    #[tokio::test]
    async fn complete_resolves_once() {
        let correlator = correlator();
        let cancel = CancellationToken::new();
        let teams = target("Teams");
        let pending = correlator.begin(&teams, None, Some(Duration::from_secs(5)));
        let id = pending.correlation_id().to_string();

        correlator.complete(&id, teams.id(), "first".into()).unwrap();
        let err = correlator.complete(&id, teams.id(), "second".into()).unwrap_err();
        assert!(matches!(err, HubError::DuplicateCompletion { .. }));

        let answer = pending.wait(&cancel).await.unwrap();
        assert_eq!(answer.into_text().await, "first");
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn unknown_id_is_duplicate() {
        let correlator = correlator();
        assert!(matches!(
            correlator.complete("nope", ConnectionId::new(), "x".into()),
            Err(HubError::DuplicateCompletion { .. })
        ));
        assert!(matches!(
            correlator.push_token("nope", ConnectionId::new(), "x"),
            Err(HubError::DuplicateCompletion { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_requests_never_cross_deliver() {
        let correlator = correlator();
        let cancel = CancellationToken::new();
        let (teams, matches) = (target("Teams"), target("Matches"));
        let p1 = correlator.begin(&teams, None, Some(Duration::from_secs(5)));
        let p2 = correlator.begin(&matches, None, Some(Duration::from_secs(5)));
        let (id1, id2) = (p1.correlation_id().to_string(), p2.correlation_id().to_string());
        assert_ne!(id1, id2);

        // Each expert can only resolve its own question.
        assert!(correlator.complete(&id1, matches.id(), "wrong".into()).is_err());
        correlator.complete(&id2, matches.id(), "for two".into()).unwrap();
        correlator.complete(&id1, teams.id(), "for one".into()).unwrap();

        assert_eq!(p1.wait(&cancel).await.unwrap().into_text().await, "for one");
        assert_eq!(p2.wait(&cancel).await.unwrap().into_text().await, "for two");
    }

    #[tokio::test]
    async fn streamed_answer_resolves_with_stream() {
        let correlator = correlator();
        let cancel = CancellationToken::new();
        let teams = target("Teams");
        let pending = correlator.begin(&teams, None, Some(Duration::from_secs(5)));
        let id = pending.correlation_id().to_string();

        correlator.push_token(&id, teams.id(), "The ").unwrap();
        correlator.push_token(&id, teams.id(), "answer").unwrap();
        correlator.push_token(&id, teams.id(), END_TOKEN).unwrap();
        // Stream closed: further tokens are reported.
        assert!(correlator.push_token(&id, teams.id(), "late").is_err());

        match pending.wait(&cancel).await.unwrap() {
            Answer::Stream(stream) => {
                let tokens: Vec<String> = stream.collect().await;
                assert_eq!(tokens, vec!["The ", "answer", END_TOKEN]);
            }
            other => panic!("expected stream, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn value_after_stream_is_duplicate() {
        let correlator = correlator();
        let teams = target("Teams");
        let pending = correlator.begin(&teams, None, None);
        let id = pending.correlation_id().to_string();
        correlator.push_token(&id, teams.id(), "a").unwrap();
        assert!(correlator.complete(&id, teams.id(), "b".into()).is_err());
    }

    #[tokio::test]
    async fn wait_times_out_and_forgets() {
        tokio::time::pause();
        let correlator = correlator();
        let cancel = CancellationToken::new();
        let teams = target("Teams");
        let pending = correlator.begin(&teams, None, Some(Duration::from_secs(30)));
        let id = pending.correlation_id().to_string();

        let err = pending.wait(&cancel).await.unwrap_err();
        assert!(matches!(err, HubError::Timeout { .. }));
        assert!(!correlator.is_pending(&id));
        assert!(correlator.complete(&id, teams.id(), "late".into()).is_err());
    }

    #[tokio::test]
    async fn wait_is_cancellable() {
        let correlator = correlator();
        let cancel = CancellationToken::new();
        let pending = correlator.begin(&target("Teams"), None, None);
        cancel.cancel();
        assert_eq!(pending.wait(&cancel).await.unwrap_err(), HubError::Cancelled);
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn fail_target_reports_not_connected() {
        let correlator = correlator();
        let cancel = CancellationToken::new();
        let teams = target("Teams");
        let pending = correlator.begin(&teams, None, None);
        let other = correlator.begin(&target("Matches"), None, None);

        assert_eq!(correlator.fail_target(teams.id()), 1);
        let err = pending.wait(&cancel).await.unwrap_err();
        assert_eq!(
            err,
            HubError::NotConnected {
                identity: "Teams".into()
            }
        );
        assert!(correlator.is_pending(other.correlation_id()));
    }

    #[tokio::test]
    async fn fail_target_closes_open_streams() {
        let correlator = correlator();
        let cancel = CancellationToken::new();
        let teams = target("Teams");
        let pending = correlator.begin(&teams, None, None);
        let id = pending.correlation_id().to_string();
        correlator.push_token(&id, teams.id(), "half an ").unwrap();

        correlator.fail_target(teams.id());
        let text = pending.wait(&cancel).await.unwrap().into_text().await;
        assert_eq!(text, "half an ");
    }

    #[tokio::test]
    async fn requester_is_tracked() {
        let correlator = correlator();
        let requester = ConnectionId::new();
        let pending = correlator.begin(&target("Teams"), Some(requester), None);
        assert_eq!(correlator.requester_of(pending.correlation_id()), Some(requester));
    }

    #[tokio::test]
    async fn only_the_target_connection_may_answer() {
        let correlator = correlator();
        let cancel = CancellationToken::new();
        let teams = target("Teams");
        let intruder = target("EndUser");
        let pending = correlator.begin(&teams, None, Some(Duration::from_secs(5)));
        let id = pending.correlation_id().to_string();

        assert!(matches!(
            correlator.complete(&id, intruder.id(), "forged".into()),
            Err(HubError::DuplicateCompletion { .. })
        ));
        assert!(correlator.push_token(&id, intruder.id(), "forged").is_err());
        assert!(correlator.is_pending(&id));

        // Once streaming, only the producer may continue the stream.
        correlator.push_token(&id, teams.id(), "real ").unwrap();
        assert!(correlator.push_token(&id, intruder.id(), "forged").is_err());
        correlator.push_token(&id, teams.id(), END_TOKEN).unwrap();

        let text = pending.wait(&cancel).await.unwrap().into_text().await;
        assert_eq!(text, "real ");
    }

    #[tokio::test]
    async fn abandon_ends_an_open_stream() {
        let relay = Arc::new(StreamRelay::new());
        let correlator = Arc::new(RequestCorrelator::new(relay.clone()));
        let cancel = CancellationToken::new();
        let teams = target("Teams");
        let pending = correlator.begin(&teams, None, None);
        let id = pending.correlation_id().to_string();
        correlator.push_token(&id, teams.id(), "partial").unwrap();
        assert!(correlator.is_streaming(&id));

        assert!(correlator.abandon(&id));
        assert!(!correlator.is_streaming(&id));
        assert!(relay.is_empty());
        assert!(correlator.push_token(&id, teams.id(), "late").is_err());
        // Already gone.
        assert!(!correlator.abandon(&id));

        let text = pending.wait(&cancel).await.unwrap().into_text().await;
        assert_eq!(text, "partial");
    }
}
