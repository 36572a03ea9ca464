//! Connecting with exponential backoff.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::handler::ClientHandler;
use crate::types::ReconnectConfig;
use crate::ws_client::{ClientError, HubClient};

/// Connects to the hub, retrying with backoff until an attempt succeeds,
/// `config.max_attempts` is exhausted (the last error is returned) or
/// `cancel` fires.
pub async fn connect_with_retry(
    url: &str,
    identity: &str,
    handler: Arc<dyn ClientHandler>,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Result<HubClient, ClientError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            result = HubClient::connect(url, identity, Arc::clone(&handler)) => match result {
                Ok(client) => {
                    if attempt > 1 {
                        info!(identity, attempt, "connected after retry");
                    }
                    return Ok(client);
                }
                Err(e) => e,
            },
        };

        if attempt >= config.max_attempts.max(1) {
            warn!(identity, attempt, "giving up on hub: {err}");
            return Err(err);
        }

        let delay = config.delay_for_attempt(attempt);
        warn!(identity, attempt, ?delay, "hub connect failed: {err}");
        tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::handler::NoopHandler;

    fn quick(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            backoff_factor: 2.0,
            max_attempts,
        }
    }

    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let url = format!("ws://127.0.0.1:{}/ws", closed_port().await);
        let err = connect_with_retry(
            &url,
            "Teams",
            Arc::new(NoopHandler),
            &quick(3),
            &CancellationToken::new(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ClientError::Ws(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn cancel_stops_retrying() {
        let url = format!("ws://127.0.0.1:{}/ws", closed_port().await);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = connect_with_retry(&url, "Teams", Arc::new(NoopHandler), &quick(100), &cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Cancelled));
    }
}
