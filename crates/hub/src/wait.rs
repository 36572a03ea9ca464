//! Bounded, cancellable waits on shared hub state.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::HubError;

/// Bumps a change counter, waking every waiter subscribed to it.
pub(crate) fn notify(changed: &watch::Sender<u64>) {
    changed.send_modify(|v| *v = v.wrapping_add(1));
}

/// Re-runs `probe` every time `changed` is bumped until it yields a value,
/// the deadline passes or `cancel` fires.
///
/// The subscription is taken before the first probe so a change landing
/// between the probe and the wait is never missed.
pub(crate) async fn wait_until<T, F, Fut>(
    changed: &watch::Sender<u64>,
    mut probe: F,
    timeout: Duration,
    cancel: &CancellationToken,
    what: &str,
) -> Result<T, HubError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let mut rx = changed.subscribe();
    if let Some(value) = probe().await {
        return Ok(value);
    }

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(HubError::Cancelled),

            () = &mut deadline => return Err(HubError::timeout(what, timeout)),

            res = rx.changed() => {
                if res.is_err() {
                    // Owner dropped: nothing can change any more.
                    return Err(HubError::timeout(what, timeout));
                }
                if let Some(value) = probe().await {
                    return Ok(value);
                }
            }
        }
    }
}
