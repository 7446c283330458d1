use std::future::Future;
use std::ops::Range;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::error::{RemoteError, RemoteResult};

/// Chunk size for zone `modify` calls after `LimitExceeded`.
pub const MODIFY_CHUNK_SIZE: usize = 200;
/// Ids per status push to a cursor-stream provider.
pub const STATUS_CHUNK_SIZE: usize = 1000;
/// Ids per entry download.
pub const ENTRIES_CHUNK_SIZE: usize = 1000;

/// How transient remote errors are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Backoff unit when the provider gives no delay: `base_delay * 2^retry`.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32, error: &RemoteError) -> Duration {
        error
            .retry_after()
            .unwrap_or_else(|| self.base_delay.saturating_mul(2u32.saturating_pow(retry)))
    }
}

/// Run `op`, retrying transient errors with backoff.
///
/// A provider-signalled `retry_after` is honoured exactly; otherwise the
/// delay doubles each retry. Each retry repeats the same call. Cancellation
/// interrupts both the call and the sleep and yields [`RemoteError::Canceled`].
/// Non-transient errors are returned immediately.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> RemoteResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RemoteResult<T>>,
{
    let mut retry = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(RemoteError::Canceled);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RemoteError::Canceled),
            result = op() => result,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && retry < policy.max_retries => e,
            Err(e) => return Err(e),
        };

        let delay = policy.delay_for(retry, &error);
        tracing::warn!(
            operation = %what,
            error = %error,
            retry = retry,
            delay_ms = delay.as_millis() as u64,
            "Transient remote error, backing off"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RemoteError::Canceled),
            _ = tokio::time::sleep(delay) => {}
        }
        retry += 1;
    }
}

/// Outcome of a chunked submission. Ranges index into the submitted slice.
#[derive(Debug, Default)]
pub struct ChunkReport {
    pub succeeded: Vec<Range<usize>>,
    pub failed: Vec<(Range<usize>, RemoteError)>,
}

impl ChunkReport {
    pub fn succeeded_count(&self) -> usize {
        self.succeeded.iter().map(|r| r.len()).sum()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.iter().map(|(r, _)| r.len()).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// `Ok` if every chunk succeeded, otherwise the first chunk's error.
    pub fn into_result(self) -> RemoteResult<()> {
        match self.failed.into_iter().next() {
            Some((_, error)) => Err(error),
            None => Ok(()),
        }
    }
}

/// Submit `items` in fixed-size chunks, one chunk at a time.
///
/// A failed chunk does not stop later chunks. Once `cancel` fires, the
/// remaining chunks are reported as failed with [`RemoteError::Canceled`]
/// without being sent.
pub async fn send_chunked<'a, T, F, Fut>(
    items: &'a [T],
    chunk_size: usize,
    cancel: &CancellationToken,
    mut op: F,
) -> ChunkReport
where
    F: FnMut(&'a [T]) -> Fut,
    Fut: Future<Output = RemoteResult<()>>,
{
    let chunk_size = chunk_size.max(1);
    let mut report = ChunkReport::default();

    for start in (0..items.len()).step_by(chunk_size) {
        let range = start..(start + chunk_size).min(items.len());
        if cancel.is_cancelled() {
            report.failed.push((range, RemoteError::Canceled));
            continue;
        }
        match op(&items[range.clone()]).await {
            Ok(()) => report.succeeded.push(range),
            Err(e) => {
                tracing::warn!(
                    start = range.start,
                    len = range.len(),
                    error = %e,
                    "Chunk submission failed"
                );
                report.failed.push((range, e));
            }
        }
    }

    report
}
