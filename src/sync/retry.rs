//! Retry combinator for HTTP calls that fail with transient statuses.

use anyhow::Result;
use backoff::backoff::Backoff;
use reqwest::blocking::Response;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::warn;

/// Default number of attempts (first try included).
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Default linear backoff step.
pub const DEFAULT_STEP: Duration = Duration::from_millis(500);

/// Backoff that waits `step * n` after the n-th failed attempt.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    step: Duration,
    max_attempts: u32,
    failures: u32,
}

impl LinearBackoff {
    pub fn new(step: Duration, max_attempts: u32) -> Self {
        Self {
            step,
            max_attempts,
            failures: 0,
        }
    }
}

impl Backoff for LinearBackoff {
    fn reset(&mut self) {
        self.failures = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.max_attempts {
            None
        } else {
            Some(self.step * self.failures)
        }
    }
}

/// When and how often to retry.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub step: Duration,
    pub retry_on: fn(StatusCode) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_ATTEMPTS,
            step: DEFAULT_STEP,
            retry_on: is_transient_status,
        }
    }
}

/// Statuses a WebDAV server uses for "busy, try again".
pub fn is_transient_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 409 | 412 | 423 | 425 | 429) || status.is_server_error()
}

enum AttemptError {
    Status(Response),
    Failed(anyhow::Error),
}

/// Run `op` until it returns a status outside the retry predicate or attempts run out.
///
/// The last response is returned as-is, whatever its status; the caller decides
/// what counts as success. Transport errors are not retried.
pub fn retry_on_status<F>(policy: RetryPolicy, label: &str, mut op: F) -> Result<Response>
where
    F: FnMut() -> Result<Response>,
{
    let backoff = LinearBackoff::new(policy.step, policy.max_attempts);

    let result = backoff::retry_notify(
        backoff,
        || {
            let response = op()
                .map_err(AttemptError::Failed)
                .map_err(backoff::Error::permanent)?;
            if (policy.retry_on)(response.status()) {
                Err(backoff::Error::transient(AttemptError::Status(response)))
            } else {
                Ok(response)
            }
        },
        |err: AttemptError, wait: Duration| {
            if let AttemptError::Status(response) = err {
                warn!(
                    "{} returned {}, retrying in {:?}",
                    label,
                    response.status(),
                    wait
                );
            }
        },
    );

    match result {
        Ok(response) => Ok(response),
        Err(backoff::Error::Permanent(err)) | Err(backoff::Error::Transient { err, .. }) => {
            match err {
                AttemptError::Status(response) => Ok(response),
                AttemptError::Failed(e) => Err(e),
            }
        }
    }
}
