//! Bounded retry with exponential backoff.
//!
//! Only narrow, known-transient operations go through here (SQLite busy
//! contention on store writes). Nothing in the main event loop retries
//! blindly.

use std::time::Duration;

use tracing::warn;

/// Run `op` up to `attempts` times, sleeping between tries with doubling
/// delays: `initial`, `2*initial`, ... capped at `max_delay`. Returns the
/// first success or the last error.
pub async fn with_backoff<T, E, F, Fut>(
    attempts: u32,
    initial: Duration,
    max_delay: Duration,
    what: &str,
    op: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    debug_assert!(attempts > 0);
    let mut delay = initial;

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt == attempts => return Err(err),
            Err(err) => {
                warn!(
                    what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(max_delay);
            }
        }
    }
    unreachable!("loop returns on the final attempt")
}

/// The store flavor: three attempts starting at 100 ms.
pub async fn storage<T, E, F, Fut>(what: &str, op: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_backoff(
        3,
        Duration::from_millis(100),
        Duration::from_secs(1),
        what,
        op,
    )
    .await
}
