//! The relay hub service shared by every connection.

use std::sync::Arc;
use std::time::Duration;

use askhub_protocol::constants::{DEFAULT_WAIT_TIMEOUT, END_USER_IDENTITY, ORCHESTRATOR_IDENTITY};
use askhub_protocol::envelope::Message;
use askhub_protocol::messages::QuestionEvent;
use askhub_protocol::MessageType;
use futures_util::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{Connection, Role, Sender};
use crate::correlator::{PendingAnswer, RequestCorrelator, expiry};
use crate::error::HubError;
use crate::introduction::IntroductionProtocol;
use crate::reconnect::ReconnectCoordinator;
use crate::registry::ConnectionRegistry;
use crate::stream_relay::{ResponseStream, StreamKey, StreamRelay, StreamWriter};

/// Hub-wide settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub orchestrator_identity: String,
    pub end_user_identity: String,
    /// Bound for every wait: target presence, answers, stream listeners.
    pub wait_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            orchestrator_identity: ORCHESTRATOR_IDENTITY.into(),
            end_user_identity: END_USER_IDENTITY.into(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

impl HubConfig {
    /// Derives the role of a participant from its identity (exact match).
    pub fn role_for(&self, identity: &str) -> Role {
        if identity == self.orchestrator_identity {
            Role::Orchestrator
        } else if identity == self.end_user_identity {
            Role::EndUser
        } else {
            Role::Expert
        }
    }
}

/// Routes questions between participants and relays their answers.
///
/// Constructed once per process and shared by every connection task.
pub struct RelayHub {
    config: HubConfig,
    registry: Arc<ConnectionRegistry>,
    introductions: Arc<IntroductionProtocol>,
    correlator: Arc<RequestCorrelator>,
    relay: Arc<StreamRelay>,
    reconnect: ReconnectCoordinator,
}

impl RelayHub {
    pub fn new(config: HubConfig) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let introductions = Arc::new(IntroductionProtocol::new(
            registry.clone(),
            config.orchestrator_identity.clone(),
            config.wait_timeout,
        ));
        let relay = Arc::new(StreamRelay::new());
        let correlator = Arc::new(RequestCorrelator::new(relay.clone()));
        let reconnect = ReconnectCoordinator::new(registry.clone(), introductions.clone());

        Arc::new(Self {
            config,
            registry,
            introductions,
            correlator,
            relay,
            reconnect,
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn introductions(&self) -> &IntroductionProtocol {
        &self.introductions
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.correlator
    }

    pub fn relay(&self) -> &Arc<StreamRelay> {
        &self.relay
    }

    /// Whether an orchestrator is currently registered.
    pub async fn orchestrator_online(&self) -> bool {
        self.reconnect.orchestrator_online().await
    }

    /// Builds a connection for `identity` with its derived role.
    pub fn connection(&self, identity: impl Into<String>, sender: Sender) -> Connection {
        let identity = identity.into();
        let role = self.config.role_for(&identity);
        Connection::new(identity, role, sender)
    }

    /// Registers a freshly connected participant.
    pub async fn connect(&self, conn: &Connection) {
        if let Some(previous) = self.registry.register(conn.clone()).await {
            info!(
                identity = %conn.identity(),
                previous = %previous.id(),
                "participant reconnected, replacing previous connection"
            );
            // The superseded handle's own disconnect is stale and will not
            // trigger recovery, so it happens here.
            self.reconnect.on_replaced(&previous).await;
        }
        if conn.role() == Role::Expert {
            self.introductions.track(conn).await;
        }
        self.reconnect.on_registered(conn).await;
        info!(identity = %conn.identity(), role = ?conn.role(), conn = %conn.id(), "participant connected");
    }

    /// Tears down everything owned by `conn`.
    ///
    /// Presence broadcasts only fire if `conn` was still the registered
    /// connection for its identity.
    pub async fn disconnect(&self, conn: &Connection) {
        let removed = self.registry.unregister(conn).await;

        let failed = self.correlator.fail_target(conn.id());
        if failed > 0 {
            warn!(identity = %conn.identity(), failed, "failed requests pending on disconnected target");
        }
        self.relay.close(&StreamKey::Connection(conn.id()));
        self.introductions.forget(conn.id()).await;

        if removed {
            self.reconnect.on_unregistered(conn).await;
        }
    }

    /// Introduces expert `conn` to the orchestrator, waiting for it if needed.
    pub async fn introduce(
        &self,
        conn: &Connection,
        name: &str,
        description: &str,
        cancel: &CancellationToken,
    ) -> Result<(), HubError> {
        self.introductions
            .introduce(conn, name, description, cancel)
            .await
    }

    /// Dispatches `question` to `target` and returns the pending answer.
    ///
    /// Waits (bounded) for `target` to connect; the answer itself is
    /// bounded by the same window.
    pub async fn begin_answer(
        &self,
        requester: Option<&Connection>,
        target: &str,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<PendingAnswer, HubError> {
        let target_conn = self
            .registry
            .wait_for(target, self.config.wait_timeout, cancel)
            .await?;

        let pending = self.correlator.begin(
            &target_conn,
            requester.map(Connection::id),
            Some(self.config.wait_timeout),
        );
        let event = QuestionEvent {
            correlation_id: pending.correlation_id().to_string(),
            question: question.to_string(),
            from: requester.map(|c| c.identity().to_string()),
        };
        let dispatched = Message::new(pending.correlation_id(), MessageType::GetAnswer, Some(&event))
            .map_err(HubError::from)
            .and_then(|msg| target_conn.deliver(msg));
        if let Err(e) = dispatched {
            self.correlator.forget(pending.correlation_id());
            return Err(e);
        }

        debug!(
            correlation_id = %pending.correlation_id(),
            to = %target,
            from = ?requester.map(Connection::identity),
            "question dispatched"
        );
        Ok(pending)
    }

    /// Asks `target` and waits for the whole answer.
    ///
    /// A streamed answer is drained and concatenated. The deadline fixed at
    /// dispatch covers the drain too; an expert that stops streaming midway
    /// yields a timeout and its stream is abandoned.
    pub async fn get_answer(
        &self,
        requester: Option<&Connection>,
        target: &str,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<String, HubError> {
        let pending = self.begin_answer(requester, target, question, cancel).await?;
        let correlation_id = pending.correlation_id().to_string();
        let deadline = pending.deadline();
        let answer = pending.wait(cancel).await?;

        let drained = tokio::select! {
            text = answer.into_text() => Ok(text),
            _ = cancel.cancelled() => Err(HubError::Cancelled),
            () = expiry(deadline) => {
                let after = deadline.map(|(_, window)| window).unwrap_or_default();
                Err(HubError::timeout(format!("answer to {correlation_id}"), after))
            }
        };
        if let Err(e) = &drained {
            warn!(correlation_id = %correlation_id, to = %target, "answer stream abandoned: {e}");
            self.correlator.abandon(&correlation_id);
        }
        drained
    }

    /// Asks the named expert and waits for the whole answer.
    pub async fn ask_expert(
        &self,
        requester: Option<&Connection>,
        expert: &str,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<String, HubError> {
        if self.config.role_for(expert) != Role::Expert {
            return Err(HubError::Protocol(format!("'{expert}' is not an expert")));
        }
        self.get_answer(requester, expert, question, cancel).await
    }

    /// Completes a question dispatched to `from` with a single value.
    pub fn send_answer_back(
        &self,
        from: &Connection,
        correlation_id: &str,
        answer: String,
    ) -> Result<(), HubError> {
        self.correlator
            .complete(correlation_id, from.id(), answer)
            .inspect_err(|e| warn!(correlation_id, from = %from.identity(), "discarding answer: {e}"))
    }

    /// Relays one token of a streamed answer produced by `from`.
    pub fn send_answer_token(
        &self,
        from: &Connection,
        correlation_id: &str,
        token: &str,
    ) -> Result<(), HubError> {
        self.correlator
            .push_token(correlation_id, from.id(), token)
            .inspect_err(|e| warn!(correlation_id, from = %from.identity(), "discarding answer token: {e}"))
    }

    /// Opens `conn`'s own response stream once somebody listens to it.
    pub async fn open_response_stream(
        &self,
        conn: &Connection,
        cancel: &CancellationToken,
    ) -> Result<StreamWriter, HubError> {
        self.relay
            .open_writer(StreamKey::Connection(conn.id()), self.config.wait_timeout, cancel)
            .await
    }

    /// Writes every token of `tokens` to `conn`'s response stream.
    pub async fn write_to_response_stream<S>(
        &self,
        conn: &Connection,
        tokens: S,
        cancel: &CancellationToken,
    ) -> Result<usize, HubError>
    where
        S: Stream<Item = String> + Unpin,
    {
        self.relay
            .write(
                StreamKey::Connection(conn.id()),
                tokens,
                self.config.wait_timeout,
                cancel,
            )
            .await
    }

    /// Subscribes to the response stream of `from`, waiting for it to connect.
    pub async fn listen_to_response_stream(
        &self,
        from: &str,
        cancel: &CancellationToken,
    ) -> Result<ResponseStream, HubError> {
        let producer = self
            .registry
            .wait_for(from, self.config.wait_timeout, cancel)
            .await?;
        Ok(self.relay.listen(StreamKey::Connection(producer.id())))
    }
}
