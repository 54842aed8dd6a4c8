//! Retrying remote calls.

use crate::{config::RetryConfig, error::Result};
use std::future::Future;

/// Run `op` until it succeeds or `config.times` attempts have failed.
///
/// Sleeps `config.delay_for(n)` between attempts. Stops early once
/// `keep_going` returns false. Returns the last error and the number of
/// attempts made.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    label: &str,
    keep_going: impl Fn() -> bool,
    mut op: F,
) -> (Result<T>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let times = config.times.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return (Ok(value), attempt),
            Err(err) => {
                if attempt >= times || !keep_going() {
                    tracing::warn!(%err, attempt, operation = label, "giving up");
                    return (Err(err), attempt);
                }
                let delay = config.delay_for(attempt);
                tracing::debug!(
                    %err,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    operation = label,
                    "retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
