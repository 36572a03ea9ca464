//! Hub WebSocket server.
//!
//! Listens on a TCP port and upgrades every connection to a WebSocket.
//! The participant identity comes from the `userid` query parameter of the
//! upgrade request; connections without one are rejected.

use std::net::SocketAddr;
use std::sync::Arc;

use askhub_protocol::constants::{IDENTITY_QUERY_PARAM, WS_MAX_MESSAGE_SIZE};
use percent_encoding::percent_decode_str;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;

use crate::SEND_BUFFER_SIZE;
use crate::connection::{self, Sender};
use crate::error::ServerError;
use crate::hub::RelayHub;

/// Server configuration.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
}

/// The hub WebSocket server.
///
/// Accepts any number of participant connections and feeds them to the
/// shared [`RelayHub`].
pub struct HubServer {
    port: u16,
    hub: Arc<RelayHub>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl HubServer {
    pub fn new(config: ServerConfig, hub: Arc<RelayHub>) -> Arc<Self> {
        Arc::new(Self {
            port: config.port,
            hub,
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Gracefully shuts down the server and every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("hub server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::warn!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades one TCP connection and registers the participant.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);

        let mut identity = None;
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            identity = identity_from_query(req.uri().query());
            if identity.is_some() {
                return Ok(resp);
            }
            let mut reject = ErrorResponse::new(Some(format!(
                "missing '{IDENTITY_QUERY_PARAM}' query parameter"
            )));
            *reject.status_mut() = StatusCode::BAD_REQUEST;
            Err(reject)
        };
        let ws_stream = accept_hdr_async_with_config(stream, callback, Some(ws_config)).await;
        let Some(identity) = identity else {
            return Err(ServerError::MissingIdentity(IDENTITY_QUERY_PARAM));
        };
        let ws_stream = ws_stream?;

        let (tx, rx) = mpsc::channel(SEND_BUFFER_SIZE);
        let conn = self.hub.connection(identity, Sender::new(tx));
        tracing::info!(%peer_addr, identity = %conn.identity(), role = ?conn.role(), "WebSocket connection established");

        self.hub.connect(&conn).await;
        connection::spawn_connection(
            ws_stream,
            conn,
            rx,
            Arc::clone(&self.hub),
            self.cancel.child_token(),
        );
        Ok(())
    }
}

/// Extracts the participant identity from an upgrade request query string.
///
/// Returns `None` if the parameter is absent or empty.
pub fn identity_from_query(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == IDENTITY_QUERY_PARAM)
        .and_then(|(_, value)| {
            let value = value.replace('+', " ");
            percent_decode_str(&value)
                .decode_utf8()
                .ok()
                .map(|v| v.into_owned())
        })
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use askhub_protocol::MessageType;
    use askhub_protocol::envelope::Message;
    use askhub_protocol::messages::{ExpertPresenceEvent, IntroduceRequest, IntroductionEvent};
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use super::*;
    use crate::hub::HubConfig;

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn start() -> (Arc<HubServer>, tokio::task::JoinHandle<()>, u16) {
        let server = HubServer::new(ServerConfig { port: 0 }, RelayHub::new(HubConfig::default()));
        let server2 = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            server2.run().await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let port = server.port().await;
        (server, handle, port)
    }

    async fn connect(port: u16, identity: &str) -> Client {
        let url = format!("ws://127.0.0.1:{port}/ws?{IDENTITY_QUERY_PARAM}={identity}");
        let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        ws
    }

    async fn recv(ws: &mut Client, msg_type: MessageType) -> Message {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out")
                .expect("closed")
                .unwrap();
            if let WsMessage::Text(text) = frame {
                let msg: Message = serde_json::from_str(&text).unwrap();
                if msg.msg_type == msg_type {
                    return msg;
                }
            }
        }
    }

    #[test]
    fn identity_query_parsing() {
        assert_eq!(identity_from_query(Some("userid=Teams")).as_deref(), Some("Teams"));
        assert_eq!(
            identity_from_query(Some("v=2&userid=Match%20Stats")).as_deref(),
            Some("Match Stats")
        );
        assert_eq!(identity_from_query(Some("userid=")), None);
        assert_eq!(identity_from_query(Some("user=Teams")), None);
        assert_eq!(identity_from_query(None), None);
    }

    #[tokio::test]
    async fn server_binds_dynamic_port() {
        let (server, handle, port) = start().await;
        assert!(port > 0, "should have bound to a dynamic port");
        assert!(server.hub().registry().is_empty().await);
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_connection_without_identity() {
        let (server, handle, port) = start().await;
        let url = format!("ws://127.0.0.1:{port}/ws");
        assert!(tokio_tungstenite::connect_async(&url).await.is_err());
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn registers_and_unregisters_participants() {
        let (server, handle, port) = start().await;
        let hub = server.hub().clone();

        let ws = connect(port, "Teams").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(hub.registry().lookup("Teams").await.is_some());

        drop(ws);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(hub.registry().lookup("Teams").await.is_none());

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn introduction_over_websocket() {
        let (server, handle, port) = start().await;
        let mut orch = connect(port, "Orchestrator").await;
        let mut teams = connect(port, "Teams").await;

        let joined = recv(&mut orch, MessageType::ExpertJoined).await;
        let joined: ExpertPresenceEvent = joined.parse_payload().unwrap().unwrap();
        assert_eq!(joined.identity, "Teams");

        let req = IntroduceRequest {
            name: "Teams".into(),
            description: "Team statistics".into(),
        };
        let msg = Message::new("i1", MessageType::Introduce, Some(&req)).unwrap();
        teams
            .send(WsMessage::Text(serde_json::to_string(&msg).unwrap().into()))
            .await
            .unwrap();

        assert_eq!(recv(&mut teams, MessageType::Ack).await.id, "i1");
        let intro = recv(&mut orch, MessageType::Introduce).await;
        let intro: IntroductionEvent = intro.parse_payload().unwrap().unwrap();
        assert_eq!(intro.identity, "Teams");
        assert_eq!(intro.description, "Team statistics");

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn orchestrator_drop_triggers_reintroduce() {
        let (server, handle, port) = start().await;
        let orch = connect(port, "Orchestrator").await;
        let mut teams = connect(port, "Teams").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        drop(orch);
        recv(&mut teams, MessageType::Reintroduce).await;

        server.shutdown();
        handle.await.unwrap();
    }
}
