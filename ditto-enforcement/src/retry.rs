//! Asks retried on transient unavailability

use crate::config::{AskWithRetryConfig, RetryStrategy};
use ditto_model::{DittoRuntimeError, ErrorKind};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Run `attempt` until it succeeds, fails with a non-transient error or the
/// configured retries are used up. The last error is returned unchanged.
pub async fn ask_with_retry<T, F, Fut>(
    config: &AskWithRetryConfig,
    mut attempt: F,
) -> Result<T, DittoRuntimeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DittoRuntimeError>>,
{
    let retries = match config.strategy {
        RetryStrategy::Off => 0,
        _ => config.attempts,
    };
    let mut tries = 0;
    loop {
        match attempt().await {
            Err(err) if tries < retries && is_transient(err.kind()) => {
                let delay = delay_before(config, tries);
                tries += 1;
                debug!(retry = tries, ?delay, error = %err, "retrying ask");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            result => return result,
        }
    }
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::ThingUnavailable | ErrorKind::PolicyUnavailable)
}

fn delay_before(config: &AskWithRetryConfig, retry: u32) -> Duration {
    match config.strategy {
        RetryStrategy::Off | RetryStrategy::NoDelay => Duration::ZERO,
        RetryStrategy::FixedDelay => config.fixed_delay,
        RetryStrategy::BackoffDelay => config
            .backoff_min
            .saturating_mul(2u32.saturating_pow(retry))
            .min(config.backoff_max),
    }
}
