//! Participant-side client for the askhub relay hub.
//!
//! Wraps one WebSocket connection: request/response correlation, keepalive,
//! response-stream subscriptions and push dispatch to a [`ClientHandler`].

pub mod handler;
mod pumps;
mod reconnection;
pub mod types;
pub mod ws_client;

pub use handler::{ClientHandler, HandlerFuture, NoopHandler, Reply, ReplyFuture};
pub use reconnection::connect_with_retry;
pub use types::ReconnectConfig;
pub use ws_client::{ClientError, HubClient, TokenStream, hub_url};
