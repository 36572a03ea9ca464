//! Connection-routing and answer correlation hub for askhub.
//!
//! An orchestrator routes questions to named experts over persistent
//! WebSocket connections. The hub tracks which participant owns which
//! connection, forwards expert introductions, correlates every question
//! with its answer (single value or token stream) and recovers when the
//! orchestrator reconnects.
//!
//! [`RelayHub`] is the in-process service; [`HubServer`] exposes it over
//! WebSocket.

mod connection;
mod correlator;
mod dispatch;
mod error;
mod hub;
mod introduction;
mod reconnect;
mod registry;
mod server;
mod stream_relay;
mod wait;

pub use connection::{Connection, ConnectionId, Role, SendError, Sender};
pub use correlator::{Answer, PendingAnswer, RequestCorrelator};
pub use error::{HubError, ServerError};
pub use hub::{HubConfig, RelayHub};
pub use introduction::{ExpertIntroduction, IntroductionProtocol, IntroductionState};
pub use reconnect::ReconnectCoordinator;
pub use registry::ConnectionRegistry;
pub use server::{HubServer, ServerConfig, identity_from_query};
pub use stream_relay::{ResponseStream, StreamKey, StreamRelay, StreamWriter};

/// Send buffer capacity per connection.
///
/// Token streams use a waiting send, everything else `try_send`; the
/// buffer has to absorb bursts of broadcasts and replies.
pub const SEND_BUFFER_SIZE: usize = 1024;
