use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::models::{CoreError, CoreErrorKind, CoreResult};
use crate::signal::StopSignal;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct RetryOptions {
    pub timeout: Duration,
    pub interval: Duration,
    /// Doubles the interval after each failure up to `max_interval`.
    pub backoff: bool,
    pub max_interval: Duration,
    pub stop: Option<StopSignal>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            interval: DEFAULT_INTERVAL,
            backoff: false,
            max_interval: Duration::from_secs(1),
            stop: None,
        }
    }
}

impl RetryOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = Some(stop);
        self
    }
}

/// Runs `operation` until it succeeds, returns an abort-marked error, the stop
/// signal fires, or the timeout elapses. The abort marker is stripped before
/// the error is returned.
pub async fn retry<T, F, Fut>(options: &RetryOptions, mut operation: F) -> CoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CoreResult<T>>,
{
    let deadline = Instant::now() + options.timeout;
    let mut interval = options.interval;

    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if error.is_abort() {
            return Err(CoreError {
                abort: false,
                ..error
            });
        }

        if Instant::now() + interval > deadline {
            return Err(error.with_context("retry timeout"));
        }

        match &options.stop {
            Some(stop) => {
                if stop.is_stopped() {
                    return Err(cancelled(error));
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop.stopped() => return Err(cancelled(error)),
                }
            }
            None => tokio::time::sleep(interval).await,
        }

        if options.backoff {
            interval = interval.saturating_mul(2).min(options.max_interval);
        }
    }
}

fn cancelled(last: CoreError) -> CoreError {
    CoreError::new(
        CoreErrorKind::Cancelled,
        format!("retry cancelled: {}", last.message),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn retries_until_success() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let options = RetryOptions::default().with_interval(Duration::from_millis(1));
        let result = retry(&options, || {
            let attempts = attempts.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CoreError::transient("busy"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn abort_stops_immediately_and_is_stripped() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let result: CoreResult<()> = retry(&RetryOptions::default(), || {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(CoreError::bad_request("negative").abort())
            }
        })
        .await;
        let error = result.unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::BadRequest);
        assert!(!error.is_abort());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_timeout_with_last_error_kind() {
        let options = RetryOptions::default()
            .with_timeout(Duration::from_millis(30))
            .with_interval(Duration::from_millis(5));
        let result: CoreResult<()> =
            retry(&options, || async { Err(CoreError::conflict("version moved")) }).await;
        let error = result.unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::Conflict);
        assert!(error.message.starts_with("retry timeout"));
    }

    #[tokio::test]
    async fn stop_signal_cancels() {
        let stop = StopSignal::new();
        stop.stop();
        let options = RetryOptions::default().with_stop(stop);
        let result: CoreResult<()> =
            retry(&options, || async { Err(CoreError::transient("down")) }).await;
        assert_eq!(result.unwrap_err().kind, CoreErrorKind::Cancelled);
    }
}
