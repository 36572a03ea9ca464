//! WebSocket client for participant-to-hub communication.
//!
//! Implements request-response with UUID correlation, ping/pong keepalive,
//! response-stream subscriptions and push dispatching to a
//! [`ClientHandler`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use askhub_protocol::constants::{
    END_TOKEN, IDENTITY_QUERY_PARAM, MessageType, WS_ANSWER_TIMEOUT, WS_MAX_MESSAGE_SIZE,
    WS_REQUEST_TIMEOUT, is_end_token, strip_end_token,
};
use askhub_protocol::envelope::Message;
use askhub_protocol::messages::{
    AnswerBackRequest, AnswerPendingResponse, AnswerResponse, AnswerTokenPayload,
    AskExpertRequest, GetAnswerRequest, IntroduceRequest, ListenRequest, StreamTokenRequest,
};

use crate::handler::{ClientHandler, Reply};

/// Errors from the hub client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("cancelled")]
    Cancelled,

    #[error("hub error {code}: {message}")]
    Hub { code: i32, message: String },

    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Wire error code, if the hub rejected the request.
    pub fn code(&self) -> Option<i32> {
        match self {
            ClientError::Hub { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Appends the identity query parameter to a hub URL.
pub fn hub_url(base: &str, identity: &str) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    let identity = utf8_percent_encode(identity, NON_ALPHANUMERIC);
    format!("{base}{sep}{IDENTITY_QUERY_PARAM}={identity}")
}

/// State shared between the client handle and its pumps.
pub(crate) struct Shared {
    pub(crate) identity: String,
    pub(crate) write_tx: mpsc::Sender<tungstenite::Message>,
    pub(crate) pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    /// Response-stream subscriptions keyed by their listen request id.
    pub(crate) streams: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    /// Last introduction sent, replayed when the hub asks for it.
    pub(crate) introduction: Mutex<Option<IntroduceRequest>>,
}

impl Shared {
    pub(crate) fn new(identity: String, write_tx: mpsc::Sender<tungstenite::Message>) -> Self {
        Self {
            identity,
            write_tx,
            pending: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            introduction: Mutex::new(None),
        }
    }

    async fn write(&self, msg: &Message) -> Result<(), ClientError> {
        let json = serde_json::to_string(msg)?;
        self.write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Sends a request under `id` and waits for the response.
    async fn send_request_with_id<T: serde::Serialize>(
        &self,
        id: &str,
        msg_type: MessageType,
        payload: Option<&T>,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        let msg = Message::new(id, msg_type, payload)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.to_string(), tx);

        if let Err(e) = self.write(&msg).await {
            self.pending.lock().await.remove(id);
            return Err(e);
        }

        let result = tokio::time::timeout(timeout, rx).await;

        // Clean up pending entry on any exit path.
        self.pending.lock().await.remove(id);

        match result {
            Ok(Ok(resp)) => {
                if let Some(err) = &resp.error {
                    return Err(ClientError::Hub {
                        code: err.code,
                        message: err.message.clone(),
                    });
                }
                Ok(resp)
            }
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    pub(crate) async fn send_request<T: serde::Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.send_request_with_id(&id, msg_type, payload, timeout)
            .await
    }

    /// Sends a message that gets no reply.
    pub(crate) async fn send_event<T: serde::Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<(), ClientError> {
        let msg = Message::new(uuid::Uuid::new_v4().to_string(), msg_type, payload)?;
        self.write(&msg).await
    }

    pub(crate) async fn introduce(&self, req: IntroduceRequest) -> Result<(), ClientError> {
        *self.introduction.lock().await = Some(req.clone());
        self.send_request(MessageType::Introduce, Some(&req), WS_REQUEST_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Re-sends the last introduction, if any.
    pub(crate) async fn reintroduce(&self) {
        let Some(req) = self.introduction.lock().await.clone() else {
            debug!(identity = %self.identity, "reintroduce requested but never introduced");
            return;
        };
        match self.introduce(req).await {
            Ok(()) => info!(identity = %self.identity, "reintroduced to orchestrator"),
            Err(e) => warn!(identity = %self.identity, "reintroduction failed: {e}"),
        }
    }

    /// Delivers `reply` for a question routed to this participant.
    pub(crate) async fn answer(&self, correlation_id: String, reply: Reply) {
        match reply {
            Reply::Value(answer) => {
                let req = AnswerBackRequest {
                    correlation_id,
                    answer,
                };
                if let Err(e) = self
                    .send_request(MessageType::SendAnswerBack, Some(&req), WS_REQUEST_TIMEOUT)
                    .await
                {
                    warn!(correlation_id = %req.correlation_id, "answer rejected: {e}");
                }
            }
            Reply::Stream(mut tokens) => {
                let mut ended = false;
                while let Some(token) = tokens.next().await {
                    ended = is_end_token(&token);
                    let payload = AnswerTokenPayload {
                        correlation_id: correlation_id.clone(),
                        token,
                    };
                    if self
                        .send_event(MessageType::SendAnswerToken, Some(&payload))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    if ended {
                        break;
                    }
                }
                if !ended {
                    let payload = AnswerTokenPayload {
                        correlation_id,
                        token: END_TOKEN.to_string(),
                    };
                    let _ = self
                        .send_event(MessageType::SendAnswerToken, Some(&payload))
                        .await;
                }
            }
        }
    }

    /// Fails outstanding requests and ends open subscriptions.
    pub(crate) async fn fail_all(&self) {
        self.pending.lock().await.clear();
        self.streams.lock().await.clear();
    }
}

/// Tokens of a response stream the client listens to.
///
/// Yields tokens in producer order with the end marker stripped, then ends.
#[derive(Debug)]
pub struct TokenStream {
    rx: mpsc::UnboundedReceiver<String>,
    done: bool,
}

impl TokenStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self { rx, done: false }
    }

    /// Drains the stream into one string.
    pub async fn collect_text(self) -> String {
        self.collect::<Vec<_>>().await.concat()
    }
}

impl Stream for TokenStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(token)) if is_end_token(&token) => {
                self.done = true;
                let rest = strip_end_token(&token);
                Poll::Ready((!rest.is_empty()).then_some(rest))
            }
            Poll::Ready(Some(token)) => Poll::Ready(Some(token)),
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// WebSocket client connected to the hub as one participant.
pub struct HubClient {
    shared: Arc<Shared>,
    _read_handle: tokio::task::JoinHandle<()>,
    _write_handle: tokio::task::JoinHandle<()>,
    _ping_handle: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

impl HubClient {
    /// Connects to the hub at `url` as `identity`.
    ///
    /// Pushes from the hub are dispatched to `handler`.
    pub async fn connect(
        url: &str,
        identity: &str,
        handler: Arc<dyn ClientHandler>,
    ) -> Result<Self, ClientError> {
        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(hub_url(url, identity), Some(ws_config), false)
                .await?;
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(256);
        let shared = Arc::new(Shared::new(identity.to_string(), write_tx.clone()));
        let cancel = CancellationToken::new();

        let write_handle = {
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::write::write_pump(write, write_rx, cancel))
        };

        let read_handle = {
            let shared = shared.clone();
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::read::read_pump(read, shared, handler, cancel))
        };

        let ping_handle = {
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::ping::ping_pump(write_tx, cancel))
        };

        info!(identity, "connected to hub");
        Ok(Self {
            shared,
            _read_handle: read_handle,
            _write_handle: write_handle,
            _ping_handle: ping_handle,
            cancel,
        })
    }

    pub fn identity(&self) -> &str {
        &self.shared.identity
    }

    /// Returns `true` until the connection drops or is closed.
    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled() && !self._read_handle.is_finished()
    }

    /// Introduces this expert to the orchestrator.
    ///
    /// The introduction is remembered and re-sent whenever the hub asks
    /// for it after an orchestrator restart.
    pub async fn introduce(&self, name: &str, description: &str) -> Result<(), ClientError> {
        self.shared
            .introduce(IntroduceRequest {
                name: name.to_string(),
                description: description.to_string(),
            })
            .await
    }

    /// Asks `target` (the orchestrator when `None`) and waits for the
    /// whole answer.
    pub async fn get_answer(&self, target: Option<&str>, question: &str) -> Result<String, ClientError> {
        let req = GetAnswerRequest {
            target: target.map(str::to_string),
            question: question.to_string(),
        };
        let resp = self
            .shared
            .send_request(MessageType::GetAnswer, Some(&req), WS_ANSWER_TIMEOUT)
            .await?;
        parse_answer(&resp)
    }

    /// Asks the named expert and waits for the whole answer.
    pub async fn ask_expert(&self, expert: &str, question: &str) -> Result<String, ClientError> {
        let req = AskExpertRequest {
            expert: expert.to_string(),
            question: question.to_string(),
        };
        let resp = self
            .shared
            .send_request(MessageType::AskExpert, Some(&req), WS_ANSWER_TIMEOUT)
            .await?;
        parse_answer(&resp)
    }

    /// Dispatches a question and returns its correlation id right away.
    ///
    /// The answer arrives through [`ClientHandler::on_answer_received`] or
    /// [`ClientHandler::on_answer_token`].
    pub async fn begin_answer(&self, target: Option<&str>, question: &str) -> Result<String, ClientError> {
        let req = GetAnswerRequest {
            target: target.map(str::to_string),
            question: question.to_string(),
        };
        let resp = self
            .shared
            .send_request(MessageType::BeginAnswer, Some(&req), WS_REQUEST_TIMEOUT)
            .await?;
        let pending: AnswerPendingResponse = resp
            .parse_payload()?
            .ok_or_else(|| ClientError::Protocol("answer_pending without payload".into()))?;
        Ok(pending.correlation_id)
    }

    /// Answers a question with a single value.
    pub async fn send_answer_back(&self, correlation_id: &str, answer: &str) -> Result<(), ClientError> {
        let req = AnswerBackRequest {
            correlation_id: correlation_id.to_string(),
            answer: answer.to_string(),
        };
        self.shared
            .send_request(MessageType::SendAnswerBack, Some(&req), WS_REQUEST_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Sends one token of a streamed answer.
    pub async fn send_answer_token(&self, correlation_id: &str, token: &str) -> Result<(), ClientError> {
        let payload = AnswerTokenPayload {
            correlation_id: correlation_id.to_string(),
            token: token.to_string(),
        };
        self.shared
            .send_event(MessageType::SendAnswerToken, Some(&payload))
            .await
    }

    /// Writes `tokens` to this participant's response stream.
    ///
    /// Waits (bounded by the hub) for a listener first. Returns the number
    /// of tokens sent; the hub appends the end marker if `tokens` lacks it.
    pub async fn write_to_response_stream<S>(&self, mut tokens: S) -> Result<usize, ClientError>
    where
        S: Stream<Item = String> + Unpin,
    {
        self.shared
            .send_request::<()>(MessageType::WriteStreamBegin, None, WS_REQUEST_TIMEOUT)
            .await?;

        let mut count = 0;
        while let Some(token) = tokens.next().await {
            let end = is_end_token(&token);
            self.shared
                .send_event(MessageType::StreamToken, Some(&StreamTokenRequest { token }))
                .await?;
            count += 1;
            if end {
                break;
            }
        }
        self.shared
            .send_event::<()>(MessageType::WriteStreamEnd, None)
            .await?;
        Ok(count)
    }

    /// Subscribes to the response stream of `from`.
    pub async fn listen_to_response_stream(&self, from: &str) -> Result<TokenStream, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        // Registered before the request so no token can outrun it.
        self.shared.streams.lock().await.insert(id.clone(), tx);

        let req = ListenRequest {
            from: from.to_string(),
        };
        let result = self
            .shared
            .send_request_with_id(&id, MessageType::ListenResponseStream, Some(&req), WS_REQUEST_TIMEOUT)
            .await;
        if let Err(e) = result {
            self.shared.streams.lock().await.remove(&id);
            return Err(e);
        }
        Ok(TokenStream::new(rx))
    }

    /// Gracefully closes the connection.
    pub async fn close(&self) {
        self.cancel.cancel();
        let _ = self
            .shared
            .write_tx
            .send(tungstenite::Message::Close(None))
            .await;
    }
}

impl Drop for HubClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self._read_handle.abort();
        self._write_handle.abort();
        self._ping_handle.abort();
    }
}

fn parse_answer(resp: &Message) -> Result<String, ClientError> {
    let answer: AnswerResponse = resp
        .parse_payload()?
        .ok_or_else(|| ClientError::Protocol("answer without payload".into()))?;
    Ok(answer.answer)
}
