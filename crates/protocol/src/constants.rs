use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reserved token marking the end of a streamed answer.
///
/// A token *containing* the marker ends the stream; any text before the
/// marker in that token is still part of the answer.
pub const END_TOKEN: &str = "<|askhub:end|>";

/// Default identity of the orchestrator participant.
pub const ORCHESTRATOR_IDENTITY: &str = "Orchestrator";

/// Default identity of the end-user participant.
pub const END_USER_IDENTITY: &str = "EndUser";

/// Query parameter carrying the participant identity at connect time.
pub const IDENTITY_QUERY_PARAM: &str = "userid";

/// Default bound for every hub-side wait (orchestrator, target, listener).
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Time to wait for a pong response (or any incoming message).
///
/// Acts as a read deadline: if nothing arrives within this window the
/// connection is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often to send pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Maximum message size in bytes (4 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Timeout for client request/response operations.
///
/// Slightly longer than [`DEFAULT_WAIT_TIMEOUT`] so the hub's own timeout
/// reply reaches the caller before the client gives up.
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(35);

/// Timeout for requests that wait for a participant and then for its
/// answer (`get_answer`, `ask_expert`); each phase is bounded by the hub.
pub const WS_ANSWER_TIMEOUT: Duration = Duration::from_secs(65);

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Requests from participants to the hub
    #[serde(rename = "introduce")]
    Introduce,
    #[serde(rename = "get_answer")]
    GetAnswer,
    #[serde(rename = "begin_answer")]
    BeginAnswer,
    #[serde(rename = "ask_expert")]
    AskExpert,
    #[serde(rename = "send_answer_back")]
    SendAnswerBack,
    #[serde(rename = "send_answer_token")]
    SendAnswerToken,
    #[serde(rename = "listen_response_stream")]
    ListenResponseStream,
    #[serde(rename = "write_stream_begin")]
    WriteStreamBegin,
    #[serde(rename = "stream_token")]
    StreamToken,
    #[serde(rename = "write_stream_end")]
    WriteStreamEnd,
    #[serde(rename = "ping")]
    Ping,

    // Replies from the hub
    #[serde(rename = "ack")]
    Ack,
    #[serde(rename = "answer")]
    Answer,
    #[serde(rename = "answer_pending")]
    AnswerPending,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error,

    // Pushes from the hub to participants
    #[serde(rename = "reintroduce")]
    Reintroduce,
    #[serde(rename = "expert_joined")]
    ExpertJoined,
    #[serde(rename = "expert_left")]
    ExpertLeft,
    #[serde(rename = "answer_received")]
    AnswerReceived,
    #[serde(rename = "answer_token")]
    AnswerToken,
    #[serde(rename = "answer_failed")]
    AnswerFailed,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Common WebSocket error codes.
pub const WS_ERR_CODE_BAD_REQUEST: i32 = 400;
pub const WS_ERR_CODE_NOT_CONNECTED: i32 = 404;
pub const WS_ERR_CODE_TIMEOUT: i32 = 408;
pub const WS_ERR_CODE_CONFLICT: i32 = 409;
pub const WS_ERR_CODE_CANCELLED: i32 = 499;
pub const WS_ERR_CODE_INTERNAL: i32 = 500;
pub const WS_ERR_CODE_NOT_IMPLEMENTED: i32 = 501;

/// Returns `true` if `token` carries the end-of-stream marker.
pub fn is_end_token(token: &str) -> bool {
    token.contains(END_TOKEN)
}

/// Strips the end-of-stream marker from a token, keeping any surrounding text.
pub fn strip_end_token(token: &str) -> String {
    token.replace(END_TOKEN, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_serialization() {
        assert_eq!(
            serde_json::to_string(&MessageType::SendAnswerBack).unwrap(),
            "\"send_answer_back\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::Reintroduce).unwrap(),
            "\"reintroduce\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::ListenResponseStream).unwrap(),
            "\"listen_response_stream\""
        );
    }

    #[test]
    fn message_type_deserialization() {
        let mt: MessageType = serde_json::from_str("\"expert_left\"").unwrap();
        assert_eq!(mt, MessageType::ExpertLeft);
    }

    #[test]
    fn unknown_message_type() {
        let mt: MessageType = serde_json::from_str("\"some_future_type\"").unwrap();
        assert_eq!(mt, MessageType::Unknown);
    }

    #[test]
    fn end_token_detection() {
        assert!(is_end_token(END_TOKEN));
        assert!(is_end_token(&format!("last words{END_TOKEN}")));
        assert!(!is_end_token("plain token"));
    }

    #[test]
    fn strip_end_token_keeps_text() {
        assert_eq!(strip_end_token(&format!("bye{END_TOKEN}")), "bye");
        assert_eq!(strip_end_token(END_TOKEN), "");
    }

    #[test]
    fn request_timeout_outlasts_hub_wait() {
        assert!(WS_REQUEST_TIMEOUT > DEFAULT_WAIT_TIMEOUT);
        assert!(WS_ANSWER_TIMEOUT > DEFAULT_WAIT_TIMEOUT * 2);
    }
}
