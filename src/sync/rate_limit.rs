use std::time::Duration;

use crate::remote::RemoteError;

pub const MAX_RETRIES: u32 = 3;
const BACKOFF_SECONDS: &[u64] = &[60, 120, 240];

pub fn is_rate_limited(e: &RemoteError) -> bool {
    matches!(e, RemoteError::RateLimited)
}

/// Wait before retry `attempt` (zero based).
pub fn backoff(attempt: u32) -> Duration {
    let wait = BACKOFF_SECONDS
        .get(attempt as usize)
        .copied()
        .unwrap_or(240);
    Duration::from_secs(wait)
}

pub async fn backoff_sleep(service: crate::remote::Service, attempt: u32) {
    let wait = backoff(attempt);
    log::warn!(
        "{service} rate limited (429). Waiting {}s before retry {}/{}",
        wait.as_secs(),
        attempt + 1,
        MAX_RETRIES
    );
    tokio::time::sleep(wait).await;
}

/// Retry a remote call expression with backoff on 429 responses.
///
/// Usage: `retry_remote!(Service::Cloud, cloud.shows_changed(since, cursor.clone()))`
///
/// The expression is re-evaluated on each attempt, so arguments must be
/// cloneable. Any other failure, or a 429 after [`MAX_RETRIES`] retries, is
/// returned as `Err(Error::Remote { .. })`.
macro_rules! retry_remote {
    ($service:expr, $expr:expr) => {{
        let mut _attempt: u32 = 0;
        loop {
            match $expr.await {
                Ok(val) => break Ok::<_, $crate::error::Error>(val),
                Err(e) => {
                    if $crate::sync::rate_limit::is_rate_limited(&e)
                        && _attempt < $crate::sync::rate_limit::MAX_RETRIES
                    {
                        $crate::sync::rate_limit::backoff_sleep($service, _attempt).await;
                        _attempt += 1;
                    } else {
                        break Err($crate::error::Error::remote($service, e));
                    }
                }
            }
        }
    }};
}

pub(crate) use retry_remote;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{RemoteResult, Service};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff(0).as_secs(), 60);
        assert_eq!(backoff(2).as_secs(), 240);
        assert_eq!(backoff(9).as_secs(), 240);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_rate_limit_then_succeeds() {
        let calls = AtomicU32::new(0);
        let call = || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                RemoteResult::<i32>::Err(RemoteError::RateLimited)
            } else {
                Ok(7)
            }
        };

        let result = retry_remote!(Service::Tracker, call());
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let call = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            RemoteResult::<i32>::Err(RemoteError::Timeout)
        };

        let result = retry_remote!(Service::Cloud, call());
        assert!(matches!(
            result,
            Err(crate::Error::Remote {
                source: RemoteError::Timeout,
                ..
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
