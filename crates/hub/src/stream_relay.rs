//! Token stream relay: one producer, any number of consumers, terminated by
//! [`END_TOKEN`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use askhub_protocol::constants::{END_TOKEN, is_end_token, strip_end_token};
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::connection::ConnectionId;
use crate::error::HubError;
use crate::wait;

/// What a relayed stream is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamKey {
    /// A participant's own response stream.
    Connection(ConnectionId),
    /// A streamed answer to one correlated question.
    Correlation(String),
}

#[derive(Default)]
struct StreamChannel {
    /// Tokens relayed so far; replayed to subscribers that join mid-stream.
    relayed: Vec<String>,
    subscribers: Vec<mpsc::UnboundedSender<String>>,
}

impl StreamChannel {
    fn fan_out(&mut self, token: &str) {
        self.subscribers.retain(|tx| tx.send(token.to_string()).is_ok());
        self.relayed.push(token.to_string());
    }
}

/// Shared table of live stream channels.
pub struct StreamRelay {
    channels: Mutex<HashMap<StreamKey, StreamChannel>>,
    changed: watch::Sender<u64>,
}

impl Default for StreamRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRelay {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            channels: Mutex::new(HashMap::new()),
            changed,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<StreamKey, StreamChannel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribes to `key`, creating the channel if nobody listens yet.
    ///
    /// Every subscriber of a key shares the same channel and sees the full
    /// token sequence from the start.
    pub fn listen(&self, key: StreamKey) -> ResponseStream {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut channels = self.lock();
            let channel = channels.entry(key.clone()).or_default();
            for token in &channel.relayed {
                let _ = tx.send(token.clone());
            }
            channel.subscribers.push(tx);
            debug!(?key, listeners = channel.subscribers.len(), "listener attached");
        }
        wait::notify(&self.changed);
        ResponseStream::new(rx)
    }

    /// Returns `true` if a channel exists for `key`.
    pub fn contains(&self, key: &StreamKey) -> bool {
        self.lock().contains_key(key)
    }

    fn has_listener(&self, key: &StreamKey) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|c| !c.subscribers.is_empty())
    }

    /// Waits for at least one listener on `key` and returns a writer for it.
    pub async fn open_writer(
        self: &Arc<Self>,
        key: StreamKey,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<StreamWriter, HubError> {
        let probe = || {
            let ready = self.has_listener(&key);
            async move { ready.then_some(()) }
        };
        wait::wait_until(&self.changed, probe, timeout, cancel, "a stream listener").await?;

        Ok(StreamWriter {
            relay: Arc::clone(self),
            key,
            finished: false,
        })
    }

    /// Forwards every token of `tokens` to the listeners of `key`.
    ///
    /// Waits (bounded) for a listener first. If `tokens` ends without the
    /// end marker, the marker is appended so consumers never hang. Returns
    /// the number of tokens taken from the producer.
    pub async fn write<S>(
        self: &Arc<Self>,
        key: StreamKey,
        mut tokens: S,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<usize, HubError>
    where
        S: Stream<Item = String> + Unpin,
    {
        let mut writer = self.open_writer(key, timeout, cancel).await?;
        let mut count = 0;
        while let Some(token) = tokens.next().await {
            count += 1;
            if !writer.send(token) {
                break;
            }
        }
        writer.finish();
        Ok(count)
    }

    /// Pushes one token to `key`, returning `false` if no channel exists.
    ///
    /// A token carrying the end marker closes and removes the channel.
    pub(crate) fn push(&self, key: &StreamKey, token: &str) -> bool {
        let mut channels = self.lock();
        let Some(channel) = channels.get_mut(key) else {
            return false;
        };
        trace!(?key, "relaying token");
        channel.fan_out(token);
        if is_end_token(token) {
            channels.remove(key);
            debug!(?key, "stream finished");
        }
        true
    }

    /// Terminates `key` (e.g. its producer disconnected).
    ///
    /// Consumers receive the end marker; returns `false` if no channel existed.
    pub fn close(&self, key: &StreamKey) -> bool {
        let Some(mut channel) = self.lock().remove(key) else {
            return false;
        };
        channel.fan_out(END_TOKEN);
        debug!(?key, "stream closed");
        true
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Producer side of one relayed stream.
///
/// Dropping an unfinished writer finishes the stream.
pub struct StreamWriter {
    relay: Arc<StreamRelay>,
    key: StreamKey,
    finished: bool,
}

impl StreamWriter {
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Relays `token`; returns `false` once the stream is finished.
    pub fn send(&mut self, token: String) -> bool {
        if self.finished {
            return false;
        }
        let end = is_end_token(&token);
        if !self.relay.push(&self.key, &token) || end {
            self.finished = true;
        }
        !self.finished
    }

    /// Ends the stream, appending the end marker if it was never sent.
    pub fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.relay.push(&self.key, END_TOKEN);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Consumer side of one relayed stream.
///
/// Yields tokens in producer order, including the final token carrying the
/// end marker, then ends.
#[derive(Debug)]
pub struct ResponseStream {
    rx: mpsc::UnboundedReceiver<String>,
    done: bool,
}

impl ResponseStream {
    fn new(rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self { rx, done: false }
    }

    /// Drains the stream into one string with the end marker stripped.
    pub async fn collect_text(mut self) -> String {
        let mut text = String::new();
        while let Some(token) = self.next().await {
            if is_end_token(&token) {
                text.push_str(&strip_end_token(&token));
                break;
            }
            text.push_str(&token);
        }
        text
    }
}

impl Stream for ResponseStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(token)) => {
                if is_end_token(&token) {
                    self.done = true;
                }
                Poll::Ready(Some(token))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;

    use super::*;

    fn key() -> StreamKey {
        StreamKey::Connection(ConnectionId::new())
    }

    fn tokens(items: &[&str]) -> impl Stream<Item = String> + Unpin {
        stream::iter(items.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn write_appends_end_marker() {
        let relay = Arc::new(StreamRelay::new());
        let cancel = CancellationToken::new();
        let k = key();

        let listener = relay.listen(k.clone());
        let n = relay
            .write(k.clone(), tokens(&["a", "b", "c"]), Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(n, 3);

        let got: Vec<String> = listener.collect().await;
        assert_eq!(got, vec!["a", "b", "c", END_TOKEN]);
        assert!(!relay.contains(&k), "channel removed after terminator");
    }

    #[tokio::test]
    async fn every_listener_gets_the_same_sequence() {
        let relay = Arc::new(StreamRelay::new());
        let cancel = CancellationToken::new();
        let k = key();

        let first = relay.listen(k.clone());
        let second = relay.listen(k.clone());
        assert_eq!(relay.len(), 1, "get-or-create, not overwrite");

        let mut writer = relay
            .open_writer(k.clone(), Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert!(writer.send("a".into()));

        // Joins mid-stream: still sees the token already relayed.
        let late = relay.listen(k.clone());
        assert!(writer.send("b".into()));
        writer.finish();

        let expected = vec!["a".to_string(), "b".to_string(), END_TOKEN.to_string()];
        assert_eq!(first.collect::<Vec<_>>().await, expected);
        assert_eq!(second.collect::<Vec<_>>().await, expected);
        assert_eq!(late.collect::<Vec<_>>().await, expected);
    }

    #[tokio::test]
    async fn explicit_marker_is_not_duplicated() {
        let relay = Arc::new(StreamRelay::new());
        let cancel = CancellationToken::new();
        let k = key();
        let listener = relay.listen(k.clone());

        let last = format!("done{END_TOKEN}");
        relay
            .write(
                k,
                tokens(&["x", last.as_str(), "ignored"]),
                Duration::from_secs(1),
                &cancel,
            )
            .await
            .unwrap();

        let got: Vec<String> = listener.collect().await;
        assert_eq!(got, vec!["x".to_string(), last]);
    }

    #[tokio::test]
    async fn writer_waits_for_listener() {
        let relay = Arc::new(StreamRelay::new());
        let cancel = CancellationToken::new();
        let k = key();

        let r = relay.clone();
        let k2 = k.clone();
        let consumer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            r.listen(k2).collect_text().await
        });

        relay
            .write(k, tokens(&["hello ", "world"]), Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        assert_eq!(consumer.await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn writer_times_out_without_listener() {
        tokio::time::pause();
        let relay = Arc::new(StreamRelay::new());
        let cancel = CancellationToken::new();
        let err = relay
            .write(key(), tokens(&["a"]), Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Timeout { .. }));
    }

    #[tokio::test]
    async fn dropped_writer_finishes_stream() {
        let relay = Arc::new(StreamRelay::new());
        let cancel = CancellationToken::new();
        let k = key();
        let listener = relay.listen(k.clone());

        {
            let mut writer = relay
                .open_writer(k, Duration::from_secs(1), &cancel)
                .await
                .unwrap();
            writer.send("partial".into());
        }

        assert_eq!(listener.collect_text().await, "partial");
    }

    #[tokio::test]
    async fn close_terminates_listeners() {
        let relay = StreamRelay::new();
        let k = key();
        let listener = relay.listen(k.clone());
        assert!(relay.close(&k));
        assert!(!relay.close(&k));
        assert_eq!(listener.collect::<Vec<_>>().await, vec![END_TOKEN.to_string()]);
    }
}
