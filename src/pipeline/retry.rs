use std::future::Future;

use log::warn;
use rand::Rng;
use tokio::time::Duration;

use crate::error::PipelineError;
use crate::settings::StorageRetrySettings;

/// Delay before retry number `attempt` (1-based): exponential, capped, with
/// up to 50% jitter taken off.
pub fn backoff_delay(settings: &StorageRetrySettings, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let raw = settings.base_delay_ms.saturating_mul(1u64 << exp);
    let capped = raw.min(settings.max_delay_ms);
    let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
    Duration::from_millis((capped as f64 * factor) as u64)
}

/// Runs `op` until it succeeds or `max_attempts` is used up. Returns the
/// value together with the number of attempts it took.
pub async fn with_backoff<T, F, Fut>(
    settings: &StorageRetrySettings,
    what: &str,
    mut op: F,
) -> Result<(T, u32), PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = settings.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok((value, attempt)),
            Err(err) if attempt >= max_attempts => {
                return Err(PipelineError::StorageWrite {
                    attempts: attempt,
                    reason: format!("{what}: {err:#}"),
                });
            }
            Err(err) => {
                let delay = backoff_delay(settings, attempt);
                warn!(
                    "{what} failed (attempt {attempt}/{max_attempts}), retrying in {}ms: {err:#}",
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
