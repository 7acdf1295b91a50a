//! Retry/backoff shape for `TransientIo` (§7, SPEC_FULL §12): bounded
//! exponential backoff with jitter around object-store and warehouse
//! calls. The bound and base delay are fixed engine constants with no
//! config surface.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use redshift_core::error::{Result, TargetError};

/// Attempts per transient operation, including the first try.
pub const RETRY_ATTEMPTS: u32 = 4;
const BASE_DELAY: Duration = Duration::from_millis(250);
const MAX_JITTER_MS: u64 = 250;

/// Run `op` up to `RETRY_ATTEMPTS` times with exponential backoff plus
/// jitter between attempts. The final failure is promoted to
/// `TargetError::TransientIo` for `stream`.
pub async fn retry_transient<T, F, Fut>(stream: &str, op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut last_err = None;
    for attempt in 0..RETRY_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt + 1 < RETRY_ATTEMPTS {
                    let delay = backoff_delay(attempt);
                    warn!(
                        stream,
                        op = op_name,
                        attempt = attempt + 1,
                        max_attempts = RETRY_ATTEMPTS,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient I/O failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(err);
            }
        }
    }

    Err(TargetError::TransientIo {
        stream: stream.to_string(),
        source: last_err.expect("loop runs at least once"),
    })
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE_DELAY * 2u32.saturating_pow(attempt);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_JITTER_MS));
    exp + jitter
}
