//! Retry harness — bounded retry with optional fallback for one attempt
//! function.
//!
//! `max_retries` is the total attempt budget, not retries-in-addition-to
//! one: a node with `max_retries = 2` runs its attempt function at most
//! twice. The wait between attempts is a real wall-clock sleep (cancellable
//! at the await point). Every failed attempt is logged at warn level under
//! the supplied label.

use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use crate::error::{MeshError, MeshResult};

/// Fallback invoked with the last error and the last attempt index when all
/// attempts are exhausted; its result replaces the attempt result.
pub type Fallback<'a, T> =
    Box<dyn FnOnce(MeshError, u32) -> BoxFuture<'a, MeshResult<T>> + Send + 'a>;

/// Run `attempt(0)`, `attempt(1)`, … up to `max_retries` total attempts,
/// sleeping `wait_seconds` between failures. On final failure, delegate to
/// `fallback` when provided; otherwise propagate the last error.
pub async fn retry<'a, T>(
    label: &str,
    max_retries: u32,
    wait_seconds: f64,
    mut attempt: impl FnMut(u32) -> BoxFuture<'a, MeshResult<T>> + Send,
    fallback: Option<Fallback<'a, T>>,
) -> MeshResult<T> {
    let total = max_retries.max(1);
    let mut last_err: Option<MeshError> = None;

    for n in 0..total {
        match attempt(n).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(
                    label = %label,
                    attempt = n,
                    max_retries = total,
                    error = %err,
                    "Attempt failed"
                );
                last_err = Some(err);
                if n + 1 < total && wait_seconds > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(wait_seconds)).await;
                }
            }
        }
    }

    // total >= 1, so at least one attempt ran and set last_err.
    let err = last_err.unwrap_or_else(|| MeshError::Other("retry ran zero attempts".to_string()));
    match fallback {
        Some(fb) => fb(err, total - 1).await,
        None => Err(err),
    }
}
