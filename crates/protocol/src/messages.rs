use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// An expert announcing itself to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntroduceRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Asks a participant a question and waits for the whole answer.
///
/// When `target` is omitted the question goes to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetAnswerRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub question: String,
}

/// Asks a named expert a question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskExpertRequest {
    pub expert: String,
    pub question: String,
}

/// Completes a dispatched question with a single value.
///
/// Also the payload of `answer_received`, pushed to a correlated requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerBackRequest {
    pub correlation_id: String,
    pub answer: String,
}

/// One token of a streamed answer.
///
/// Sent by the answering participant (`send_answer_token`) and relayed by
/// the hub to a correlated requester (`answer_token`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerTokenPayload {
    pub correlation_id: String,
    pub token: String,
}

/// Subscribes to the response stream of another participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenRequest {
    pub from: String,
}

/// One token written to the sender's own response stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamTokenRequest {
    pub token: String,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Full answer to a `get_answer` / `ask_expert` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerResponse {
    pub answer: String,
}

/// Correlation id handed out for a `begin_answer` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPendingResponse {
    pub correlation_id: String,
}

// ---------------------------------------------------------------------------
// Events (hub -> participant)
// ---------------------------------------------------------------------------

/// Introduction forwarded to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntroductionEvent {
    pub identity: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Question dispatched to a target; answer with the same correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionEvent {
    pub correlation_id: String,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

/// An expert joined or left the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertPresenceEvent {
    pub identity: String,
}

/// A correlated request failed before an answer arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerFailedEvent {
    pub correlation_id: String,
    pub code: i32,
    pub reason: String,
}

/// A token relayed from a listened-to response stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamTokenEvent {
    pub from: String,
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_answer_without_target_omits_field() {
        let req = GetAnswerRequest {
            target: None,
            question: "best alliance?".into(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("target"));
        let parsed: GetAnswerRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn correlation_ids_are_camel_case() {
        let back = AnswerBackRequest {
            correlation_id: "c1".into(),
            answer: "a".into(),
        };
        let json = serde_json::to_value(&back).unwrap();
        assert_eq!(json["correlationId"], "c1");
    }

    #[test]
    fn introduce_description_defaults_empty() {
        let req: IntroduceRequest = serde_json::from_str(r#"{"name":"Teams"}"#).unwrap();
        assert_eq!(req.name, "Teams");
        assert!(req.description.is_empty());
    }
}
