//! Per-connection dispatch of inbound protocol messages to the hub.
//!
//! Requests that may block (waiting for a participant, an answer or a
//! stream listener) run as their own task so one slow request never stalls
//! the connection. Token messages are applied inline to keep their order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use askhub_protocol::MessageType;
use askhub_protocol::envelope::Message;
use askhub_protocol::messages::{
    AnswerBackRequest, AnswerFailedEvent, AnswerPendingResponse, AnswerResponse,
    AnswerTokenPayload, AskExpertRequest, GetAnswerRequest, IntroduceRequest, ListenRequest,
    StreamTokenEvent, StreamTokenRequest,
};
use askhub_protocol::constants::{WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_NOT_IMPLEMENTED};
use futures_util::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::connection::Connection;
use crate::correlator::{Answer, expiry};
use crate::error::HubError;
use crate::hub::RelayHub;
use crate::stream_relay::{ResponseStream, StreamWriter};

/// State of one live participant connection.
pub(crate) struct Session {
    hub: Arc<RelayHub>,
    conn: Connection,
    cancel: CancellationToken,
    /// Writer for this participant's own response stream, between
    /// `write_stream_begin` and `write_stream_end`.
    writer: Mutex<Option<StreamWriter>>,
}

impl Session {
    pub(crate) fn new(hub: Arc<RelayHub>, conn: Connection, cancel: CancellationToken) -> Self {
        Self {
            hub,
            conn,
            cancel,
            writer: Mutex::new(None),
        }
    }

    pub(crate) fn identity(&self) -> &str {
        self.conn.identity()
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    fn writer(&self) -> MutexGuard<'_, Option<StreamWriter>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Finishes an open response stream on disconnect.
    pub(crate) fn close(&self) {
        if let Some(mut writer) = self.writer().take() {
            writer.finish();
        }
    }

    /// Parses one text frame and routes it.
    pub(crate) async fn dispatch_text(self: &Arc<Self>, text: &str) {
        let msg: Message = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                error!(identity = %self.identity(), "invalid message JSON: {e}");
                return;
            }
        };

        match msg.msg_type {
            MessageType::Introduce => self.spawn(msg, Self::on_introduce),
            MessageType::GetAnswer => self.spawn(msg, Self::on_get_answer),
            MessageType::AskExpert => self.spawn(msg, Self::on_ask_expert),
            MessageType::BeginAnswer => self.spawn(msg, Self::on_begin_answer),
            MessageType::ListenResponseStream => self.spawn(msg, Self::on_listen),
            MessageType::WriteStreamBegin => self.spawn(msg, Self::on_write_stream_begin),
            MessageType::SendAnswerBack => self.on_send_answer_back(&msg),
            MessageType::SendAnswerToken => self.on_send_answer_token(&msg),
            MessageType::StreamToken => self.on_stream_token(&msg),
            MessageType::WriteStreamEnd => self.on_write_stream_end(&msg),
            MessageType::Ping => self.reply::<()>(&msg, MessageType::Pong, None),
            _ => {
                warn!(identity = %self.identity(), msg_type = ?msg.msg_type, "unhandled message type");
                let _ = self.conn.sender().send_error(
                    &msg,
                    WS_ERR_CODE_NOT_IMPLEMENTED,
                    "unknown message type",
                );
            }
        }
    }

    fn spawn<F, Fut>(self: &Arc<Self>, msg: Message, handler: F)
    where
        F: FnOnce(Arc<Self>, Message) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(handler(Arc::clone(self), msg));
    }

    // -- Replies ------------------------------------------------------------

    fn reply<T: Serialize>(&self, req: &Message, msg_type: MessageType, payload: Option<&T>) {
        match req.reply(msg_type, payload) {
            Ok(reply) => {
                let _ = self.conn.send(reply);
            }
            Err(e) => error!(identity = %self.identity(), "failed to encode reply: {e}"),
        }
    }

    fn reply_err(&self, req: &Message, err: &HubError) {
        let _ = self.conn.sender().send_error(req, err.code(), &err.to_string());
    }

    fn payload<T: DeserializeOwned>(&self, msg: &Message) -> Option<T> {
        let problem = match msg.parse_payload::<T>() {
            Ok(Some(payload)) => return Some(payload),
            Ok(None) => "missing payload".to_string(),
            Err(e) => format!("invalid payload: {e}"),
        };
        warn!(identity = %self.identity(), msg_type = ?msg.msg_type, "{problem}");
        let _ = self
            .conn
            .sender()
            .send_error(msg, WS_ERR_CODE_BAD_REQUEST, &problem);
        None
    }

    /// Pushes an ordered event, waiting for buffer space.
    async fn push_ordered<T: Serialize>(&self, id: &str, msg_type: MessageType, payload: &T) -> bool {
        let msg = match Message::new(id, msg_type, Some(payload)) {
            Ok(m) => m,
            Err(e) => {
                error!(identity = %self.identity(), "failed to encode event: {e}");
                return false;
            }
        };
        self.conn.sender().send_msg_wait(msg).await.is_ok()
    }

    /// Next token of `stream`, or `None` once it ends or the connection drops.
    async fn next_token(&self, stream: &mut ResponseStream) -> Option<String> {
        tokio::select! {
            token = stream.next() => token,
            _ = self.cancel.cancelled() => None,
        }
    }

    // -- Blocking requests --------------------------------------------------

    async fn on_introduce(self: Arc<Self>, msg: Message) {
        let Some(req) = self.payload::<IntroduceRequest>(&msg) else {
            return;
        };
        match self
            .hub
            .introduce(&self.conn, &req.name, &req.description, &self.cancel)
            .await
        {
            Ok(()) => self.reply::<()>(&msg, MessageType::Ack, None),
            Err(e) => {
                warn!(identity = %self.identity(), "introduction failed: {e}");
                self.reply_err(&msg, &e);
            }
        }
    }

    async fn on_get_answer(self: Arc<Self>, msg: Message) {
        let Some(req) = self.payload::<GetAnswerRequest>(&msg) else {
            return;
        };
        let target = req
            .target
            .unwrap_or_else(|| self.hub.config().orchestrator_identity.clone());
        match self
            .hub
            .get_answer(Some(&self.conn), &target, &req.question, &self.cancel)
            .await
        {
            Ok(answer) => self.reply(&msg, MessageType::Answer, Some(&AnswerResponse { answer })),
            Err(e) => {
                warn!(identity = %self.identity(), to = %target, "get_answer failed: {e}");
                self.reply_err(&msg, &e);
            }
        }
    }

    async fn on_ask_expert(self: Arc<Self>, msg: Message) {
        let Some(req) = self.payload::<AskExpertRequest>(&msg) else {
            return;
        };
        match self
            .hub
            .ask_expert(Some(&self.conn), &req.expert, &req.question, &self.cancel)
            .await
        {
            Ok(answer) => self.reply(&msg, MessageType::Answer, Some(&AnswerResponse { answer })),
            Err(e) => {
                warn!(identity = %self.identity(), expert = %req.expert, "ask_expert failed: {e}");
                let _ = self.conn.sender().send_error(
                    &msg,
                    e.code(),
                    &format!("expert '{}' is not here: {e}", req.expert),
                );
            }
        }
    }

    /// Hands out a correlation id, then pushes the answer when it arrives.
    async fn on_begin_answer(self: Arc<Self>, msg: Message) {
        let Some(req) = self.payload::<GetAnswerRequest>(&msg) else {
            return;
        };
        let target = req
            .target
            .unwrap_or_else(|| self.hub.config().orchestrator_identity.clone());
        let pending = match self
            .hub
            .begin_answer(Some(&self.conn), &target, &req.question, &self.cancel)
            .await
        {
            Ok(p) => p,
            Err(e) => {
                warn!(identity = %self.identity(), to = %target, "begin_answer failed: {e}");
                self.reply_err(&msg, &e);
                return;
            }
        };

        let correlation_id = pending.correlation_id().to_string();
        let deadline = pending.deadline();
        self.reply(
            &msg,
            MessageType::AnswerPending,
            Some(&AnswerPendingResponse {
                correlation_id: correlation_id.clone(),
            }),
        );

        match pending.wait(&self.cancel).await {
            Ok(Answer::Value(answer)) => {
                let event = AnswerBackRequest {
                    correlation_id: correlation_id.clone(),
                    answer,
                };
                self.push_ordered(&correlation_id, MessageType::AnswerReceived, &event)
                    .await;
            }
            Ok(Answer::Stream(mut stream)) => {
                let relayed = async {
                    while let Some(token) = self.next_token(&mut stream).await {
                        let event = AnswerTokenPayload {
                            correlation_id: correlation_id.clone(),
                            token,
                        };
                        if !self
                            .push_ordered(&correlation_id, MessageType::AnswerToken, &event)
                            .await
                        {
                            break;
                        }
                    }
                };
                let stalled = tokio::select! {
                    () = relayed => None,
                    () = expiry(deadline) => {
                        let after = deadline.map(|(_, window)| window).unwrap_or_default();
                        Some(HubError::timeout(format!("answer to {correlation_id}"), after))
                    }
                };
                // No-op when the stream already ended on its own.
                self.hub.correlator().abandon(&correlation_id);
                if let Some(e) = stalled {
                    warn!(identity = %self.identity(), to = %target, "answer stream stalled: {e}");
                    self.push_failure(&correlation_id, &e).await;
                }
            }
            Err(HubError::Cancelled) => {
                debug!(identity = %self.identity(), correlation_id, "requester gone, dropping answer");
            }
            Err(e) => self.push_failure(&correlation_id, &e).await,
        }
    }

    async fn push_failure(&self, correlation_id: &str, e: &HubError) {
        let event = AnswerFailedEvent {
            correlation_id: correlation_id.to_string(),
            code: e.code(),
            reason: e.to_string(),
        };
        self.push_ordered(correlation_id, MessageType::AnswerFailed, &event)
            .await;
    }

    /// Subscribes to another participant's response stream and relays it.
    async fn on_listen(self: Arc<Self>, msg: Message) {
        let Some(req) = self.payload::<ListenRequest>(&msg) else {
            return;
        };
        let mut stream = match self
            .hub
            .listen_to_response_stream(&req.from, &self.cancel)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                warn!(identity = %self.identity(), from = %req.from, "listen failed: {e}");
                self.reply_err(&msg, &e);
                return;
            }
        };
        self.reply::<()>(&msg, MessageType::Ack, None);

        while let Some(token) = self.next_token(&mut stream).await {
            let event = StreamTokenEvent {
                from: req.from.clone(),
                token,
            };
            if !self
                .push_ordered(&msg.id, MessageType::StreamToken, &event)
                .await
            {
                break;
            }
        }
        debug!(identity = %self.identity(), from = %req.from, "response stream relayed");
    }

    async fn on_write_stream_begin(self: Arc<Self>, msg: Message) {
        match self.hub.open_response_stream(&self.conn, &self.cancel).await {
            Ok(writer) => {
                // A second begin replaces (and finishes) the previous stream.
                if let Some(mut previous) = self.writer().replace(writer) {
                    previous.finish();
                }
                self.reply::<()>(&msg, MessageType::Ack, None);
            }
            Err(e) => {
                warn!(identity = %self.identity(), "no listener for response stream: {e}");
                self.reply_err(&msg, &e);
            }
        }
    }

    // -- Inline messages ----------------------------------------------------

    fn on_send_answer_back(&self, msg: &Message) {
        let Some(req) = self.payload::<AnswerBackRequest>(msg) else {
            return;
        };
        match self
            .hub
            .send_answer_back(&self.conn, &req.correlation_id, req.answer)
        {
            Ok(()) => self.reply::<()>(msg, MessageType::Ack, None),
            Err(e) => self.reply_err(msg, &e),
        }
    }

    fn on_send_answer_token(&self, msg: &Message) {
        if let Some(req) = self.payload::<AnswerTokenPayload>(msg) {
            // Failures are logged by the hub; tokens get no reply.
            let _ = self
                .hub
                .send_answer_token(&self.conn, &req.correlation_id, &req.token);
        }
    }

    fn on_stream_token(&self, msg: &Message) {
        let Some(req) = self.payload::<StreamTokenRequest>(msg) else {
            return;
        };
        let mut slot = self.writer();
        let Some(writer) = slot.as_mut() else {
            warn!(identity = %self.identity(), "stream token without an open response stream");
            return;
        };
        if !writer.send(req.token) {
            slot.take();
        }
    }

    fn on_write_stream_end(&self, msg: &Message) {
        match self.writer().take() {
            Some(mut writer) => writer.finish(),
            None => debug!(identity = %self.identity(), id = %msg.id, "stream end without an open response stream"),
        }
    }
}
