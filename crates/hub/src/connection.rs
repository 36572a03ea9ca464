//! Participant connections: identity, role, send buffering and the
//! read/write pumps that drive a live WebSocket.

use std::fmt;
use std::sync::Arc;

use askhub_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT};
use askhub_protocol::MessageType;
use askhub_protocol::envelope::Message;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::dispatch::Session;
use crate::error::HubError;
use crate::hub::RelayHub;

/// Opaque handle identifying one transport connection.
///
/// A reconnecting participant reuses its identity but always gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Role a participant plays, derived from its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Orchestrator,
    Expert,
    EndUser,
}

/// Handle for sending messages to one participant.
///
/// Cloneable and cheap; wraps an `mpsc::Sender`.
#[derive(Debug, Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    pub fn new(tx: mpsc::Sender<WsMessage>) -> Self {
        Self { tx }
    }

    /// Sends a protocol [`Message`] as JSON text.
    ///
    /// Returns `Err` if the buffer is full or the participant disconnected.
    pub fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            tracing::warn!(msg_type = ?msg.msg_type, "send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Sends a protocol [`Message`], waiting for buffer space.
    ///
    /// Used for token streams, where dropping a message would corrupt the
    /// answer. Fails only once the participant has disconnected.
    pub async fn send_msg_wait(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.tx
            .send(WsMessage::Text(json.into()))
            .await
            .map_err(|_| SendError)
    }

    /// Sends an error response for the given request message.
    pub fn send_error(&self, req: &Message, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(req.reply_error(code, message))
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    fn send_raw(&self, msg: WsMessage) {
        let _ = self.tx.try_send(msg);
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// A registered participant: who it is and how to reach it.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    identity: String,
    role: Role,
    sender: Sender,
}

impl Connection {
    pub fn new(identity: impl Into<String>, role: Role, sender: Sender) -> Self {
        Self {
            id: ConnectionId::new(),
            identity: identity.into(),
            role,
            sender,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    /// Sends a message to this participant.
    pub fn send(&self, msg: Message) -> Result<(), SendError> {
        self.sender.send_msg(msg)
    }

    /// Sends `msg`, reporting a closed channel as [`HubError::NotConnected`].
    pub(crate) fn deliver(&self, msg: Message) -> Result<(), HubError> {
        self.send(msg).map_err(|_| {
            if self.sender.is_connected() {
                HubError::SendFailed
            } else {
                HubError::NotConnected {
                    identity: self.identity.clone(),
                }
            }
        })
    }

    /// Pushes an unsolicited message of `msg_type` with a fresh id.
    pub(crate) fn push<T: serde::Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<(), HubError> {
        let msg = Message::new(uuid::Uuid::new_v4().to_string(), msg_type, payload)?;
        self.deliver(msg)
    }
}

/// Runs the read and write pumps for a registered participant.
///
/// The pumps run as background tokio tasks; when the read side ends the
/// connection is removed from the hub and the write pump is stopped.
pub(crate) fn spawn_connection<S>(
    ws_stream: S,
    conn: Connection,
    rx: mpsc::Receiver<WsMessage>,
    hub: Arc<RelayHub>,
    cancel: CancellationToken,
) where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
{
    let (ws_sink, ws_stream) = ws_stream.split();

    tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    tokio::spawn(async move {
        let session = Arc::new(Session::new(Arc::clone(&hub), conn.clone(), cancel.clone()));
        read_pump(ws_stream, &session, cancel.clone()).await;
        // When the read pump exits, stop the write pump and any waits.
        cancel.cancel();
        session.close();
        hub.disconnect(&conn).await;
        tracing::info!(identity = %conn.identity(), conn = %conn.id(), "participant disconnected");
    });
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::error!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// Read pump: reads WS frames and hands text frames to the session.
async fn read_pump<S>(mut stream: S, session: &Arc<Session>, cancel: CancellationToken)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
{
    // Any inbound frame counts as liveness.
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                tracing::warn!(identity = %session.identity(), "pong timeout, closing connection");
                break;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(ws_msg)) => {
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);
                        match ws_msg {
                            WsMessage::Text(text) => {
                                if text.len() > WS_MAX_MESSAGE_SIZE {
                                    tracing::error!("message exceeds max size ({} > {})", text.len(), WS_MAX_MESSAGE_SIZE);
                                    continue;
                                }
                                session.dispatch_text(&text).await;
                            }
                            WsMessage::Ping(data) => {
                                session.connection().sender().send_raw(WsMessage::Pong(data));
                            }
                            WsMessage::Close(_) => {
                                tracing::debug!(identity = %session.identity(), "received close frame");
                                break;
                            }
                            // Pong only refreshes the deadline; binary frames are not part of the protocol.
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!("read pump error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_error_display() {
        let err = SendError;
        assert!(err.to_string().contains("buffer full"));
    }

    #[test]
    fn connection_ids_are_unique() {
        let (tx, _rx) = mpsc::channel(1);
        let a = Connection::new("Teams", Role::Expert, Sender::new(tx.clone()));
        let b = Connection::new("Teams", Role::Expert, Sender::new(tx));
        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn send_serializes_json_text() {
        let (tx, mut rx) = mpsc::channel(4);
        let conn = Connection::new("EndUser", Role::EndUser, Sender::new(tx));
        let msg = Message::new::<()>("m1", MessageType::Reintroduce, None).unwrap();
        conn.send(msg).unwrap();

        match rx.recv().await.unwrap() {
            WsMessage::Text(text) => {
                let parsed: Message = serde_json::from_str(&text).unwrap();
                assert_eq!(parsed.msg_type, MessageType::Reintroduce);
            }
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deliver_to_closed_channel_is_not_connected() {
        let (tx, rx) = mpsc::channel(4);
        let conn = Connection::new("Teams", Role::Expert, Sender::new(tx));
        drop(rx);
        let err = conn.push::<()>(MessageType::Reintroduce, None).unwrap_err();
        assert_eq!(
            err,
            HubError::NotConnected {
                identity: "Teams".into()
            }
        );
    }

    #[tokio::test]
    async fn send_fails_when_closed() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let sender = Sender::new(tx);
        assert!(!sender.is_connected());
        let msg = Message::new::<()>("m1", MessageType::Ping, None).unwrap();
        assert!(sender.send_msg(msg).is_err());
    }
}
