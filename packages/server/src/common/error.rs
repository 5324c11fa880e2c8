//! Error taxonomy for the engine core.
//!
//! Operation boundaries return [`CoreError`]; external adapters (generator,
//! publisher) return [`AdapterError`], which the worker maps onto task
//! outcomes. Nothing is swallowed: task-scoped failures become log rows,
//! process-scoped failures become structured log messages.

use std::time::Duration;

pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Engine-level errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Missing or malformed configuration; fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database unreachable or query failed.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Rejected by validation at an operation boundary.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Optimistic-lock version mismatch or unique-constraint violation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A data-model invariant failed; operator attention required.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl CoreError {
    /// Whether a short local retry may help (storage-level hiccups only).
    pub fn is_retryable_storage(&self) -> bool {
        matches!(
            self,
            CoreError::Storage(sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
        )
    }
}

/// Errors surfaced by the generator and publisher adapters, categorized the
/// way the worker's outcome mapping needs them.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Network failure, 5xx, generic timeout. Retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Rate-limit signal with an advised cooldown. Retried after cooldown.
    #[error("quota exhausted, cooldown {}s", cooldown.as_secs())]
    Quota { cooldown: Duration },

    /// Auth failure, validation rejection, invalid media. Not retried.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

/// Retry bounded storage operations with short fixed backoff before
/// surfacing, per the propagation policy: retries at 50/200/500 ms.
pub async fn with_storage_retries<T, F, Fut>(mut op: F) -> CoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = CoreResult<T>>,
{
    const DELAYS_MS: [u64; 3] = [50, 200, 500];

    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable_storage() && attempt < DELAYS_MS.len() => {
                tracing::warn!(error = %e, attempt, "storage operation failed, retrying");
                tokio::time::sleep(Duration::from_millis(DELAYS_MS[attempt])).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
