//! Handler trait for pushes from the hub.
//!
//! The client handles request correlation, keepalive and reintroduction;
//! implementors only provide participant logic (answering questions,
//! reacting to presence changes, consuming correlated answers).

use std::future::Future;
use std::pin::Pin;

use askhub_protocol::messages::{
    AnswerBackRequest, AnswerFailedEvent, AnswerTokenPayload, IntroductionEvent, QuestionEvent,
};
use futures_util::stream::BoxStream;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// A boxed future resolving to the reply for a question.
pub type ReplyFuture<'a> = Pin<Box<dyn Future<Output = Option<Reply>> + Send + 'a>>;

/// How a participant answers a question.
pub enum Reply {
    /// The whole answer at once (`send_answer_back`).
    Value(String),
    /// The answer token by token (`send_answer_token`). The end marker is
    /// appended if the stream does not emit it.
    Stream(BoxStream<'static, String>),
}

impl Reply {
    pub fn value(text: impl Into<String>) -> Self {
        Reply::Value(text.into())
    }
}

/// Receives pushes from the hub.
///
/// Every method except [`on_question`](Self::on_question) runs on the read
/// pump, so implementations should return quickly. Defaults ignore the push.
pub trait ClientHandler: Send + Sync + 'static {
    /// A question routed to this participant. Returning `None` leaves it
    /// unanswered; the asker then times out.
    fn on_question(&self, question: QuestionEvent) -> ReplyFuture<'_> {
        tracing::debug!(correlation_id = %question.correlation_id, "question ignored");
        Box::pin(async { None })
    }

    /// An expert introduced itself (orchestrator only).
    fn on_introduction(&self, intro: IntroductionEvent) -> HandlerFuture<'_> {
        let _ = intro;
        Box::pin(async {})
    }

    /// The orchestrator restarted. The client has already re-sent its
    /// last introduction when this fires.
    fn on_reintroduce(&self) -> HandlerFuture<'_> {
        Box::pin(async {})
    }

    fn on_expert_joined(&self, identity: String) -> HandlerFuture<'_> {
        let _ = identity;
        Box::pin(async {})
    }

    fn on_expert_left(&self, identity: String) -> HandlerFuture<'_> {
        let _ = identity;
        Box::pin(async {})
    }

    /// Whole answer to a correlated question (`begin_answer`).
    fn on_answer_received(&self, answer: AnswerBackRequest) -> HandlerFuture<'_> {
        let _ = answer;
        Box::pin(async {})
    }

    /// One token of a streamed answer to a correlated question.
    fn on_answer_token(&self, token: AnswerTokenPayload) -> HandlerFuture<'_> {
        let _ = token;
        Box::pin(async {})
    }

    /// A correlated question failed before it was answered.
    fn on_answer_failed(&self, failure: AnswerFailedEvent) -> HandlerFuture<'_> {
        tracing::warn!(
            correlation_id = %failure.correlation_id,
            code = failure.code,
            "answer failed: {}",
            failure.reason
        );
        Box::pin(async {})
    }

    /// The connection to the hub is gone (cleanup hook).
    fn on_disconnected(&self) -> HandlerFuture<'_> {
        Box::pin(async {})
    }
}

/// Handler that ignores every push; suits participants that only ask.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ClientHandler for NoopHandler {}
