//! WebSocket read pump: routes replies and dispatches pushes.

use std::sync::Arc;

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use askhub_protocol::constants::{MessageType, WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT, is_end_token};
use askhub_protocol::envelope::Message;
use askhub_protocol::messages::{
    AnswerBackRequest, AnswerFailedEvent, AnswerTokenPayload, ExpertPresenceEvent,
    IntroductionEvent, QuestionEvent, StreamTokenEvent,
};

use crate::handler::ClientHandler;
use crate::ws_client::Shared;

/// Reads messages from the WebSocket and dispatches them.
///
/// Any incoming frame resets the pong deadline; if nothing arrives within
/// [`WS_PONG_WAIT`] the connection is considered dead and the loop exits.
/// On exit outstanding requests fail and the handler is told.
pub(crate) async fn read_pump<S>(
    mut read: S,
    shared: Arc<Shared>,
    handler: Arc<dyn ClientHandler>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                warn!(identity = %shared.identity, "pong timeout, closing");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                handle_text_message(&text, &shared, &handler).await;
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = shared.write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Close(_) => {
                                debug!(identity = %shared.identity, "received close frame");
                                break;
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        warn!(identity = %shared.identity, "WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!(identity = %shared.identity, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    shared.fail_all().await;
    handler.on_disconnected().await;
}

/// Handles a text message from the WebSocket.
pub(crate) async fn handle_text_message(
    text: &str,
    shared: &Arc<Shared>,
    handler: &Arc<dyn ClientHandler>,
) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("message too large ({} bytes), dropping", text.len());
        return;
    }

    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to parse message: {e}");
            return;
        }
    };

    trace!(msg_type = ?msg.msg_type, id = %msg.id, "received message");

    if msg.msg_type == MessageType::StreamToken {
        relay_stream_token(&msg, shared).await;
        return;
    }

    if let Some(tx) = shared.pending.lock().await.remove(&msg.id) {
        let _ = tx.send(msg);
        return;
    }

    dispatch_push(msg, shared, handler).await;
}

/// Forwards a listened-to token to its subscription.
async fn relay_stream_token(msg: &Message, shared: &Shared) {
    let Some(event) = payload::<StreamTokenEvent>(msg) else {
        return;
    };
    let mut streams = shared.streams.lock().await;
    let Some(tx) = streams.get(&msg.id) else {
        debug!(id = %msg.id, from = %event.from, "token for unknown subscription");
        return;
    };
    let end = is_end_token(&event.token);
    if tx.send(event.token).is_err() || end {
        streams.remove(&msg.id);
    }
}

async fn dispatch_push(msg: Message, shared: &Arc<Shared>, handler: &Arc<dyn ClientHandler>) {
    match msg.msg_type {
        MessageType::GetAnswer => {
            let Some(question) = payload::<QuestionEvent>(&msg) else {
                return;
            };
            // Answering may take a while; keep reading meanwhile.
            let shared = Arc::clone(shared);
            let handler = Arc::clone(handler);
            tokio::spawn(async move {
                let correlation_id = question.correlation_id.clone();
                if let Some(reply) = handler.on_question(question).await {
                    shared.answer(correlation_id, reply).await;
                }
            });
        }
        MessageType::Introduce => {
            if let Some(intro) = payload::<IntroductionEvent>(&msg) {
                handler.on_introduction(intro).await;
            }
        }
        MessageType::Reintroduce => {
            let shared = Arc::clone(shared);
            let handler = Arc::clone(handler);
            tokio::spawn(async move {
                shared.reintroduce().await;
                handler.on_reintroduce().await;
            });
        }
        MessageType::ExpertJoined => {
            if let Some(event) = payload::<ExpertPresenceEvent>(&msg) {
                handler.on_expert_joined(event.identity).await;
            }
        }
        MessageType::ExpertLeft => {
            if let Some(event) = payload::<ExpertPresenceEvent>(&msg) {
                handler.on_expert_left(event.identity).await;
            }
        }
        MessageType::AnswerReceived => {
            if let Some(answer) = payload::<AnswerBackRequest>(&msg) {
                handler.on_answer_received(answer).await;
            }
        }
        MessageType::AnswerToken => {
            if let Some(token) = payload::<AnswerTokenPayload>(&msg) {
                handler.on_answer_token(token).await;
            }
        }
        MessageType::AnswerFailed => {
            if let Some(failure) = payload::<AnswerFailedEvent>(&msg) {
                handler.on_answer_failed(failure).await;
            }
        }
        other => {
            debug!(msg_type = ?other, id = %msg.id, "unhandled push");
        }
    }
}

fn payload<T: DeserializeOwned>(msg: &Message) -> Option<T> {
    match msg.parse_payload::<T>() {
        Ok(Some(p)) => Some(p),
        Ok(None) => {
            warn!(msg_type = ?msg.msg_type, id = %msg.id, "push without payload");
            None
        }
        Err(e) => {
            warn!(msg_type = ?msg.msg_type, id = %msg.id, "invalid push payload: {e}");
            None
        }
    }
}
