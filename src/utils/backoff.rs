use std::future::Future;

use crate::errors::{Error, Result};
use tokio::time::{sleep, Duration, Instant};

/// Bounds a poll loop on a cloud-side state transition.
/// The wait between polls starts at "initial_interval" and doubles
/// up to "max_interval"; the loop gives up after "timeout".
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PollPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(300),
        }
    }
}

impl PollPolicy {
    /// Returns the wait before the poll that follows "current".
    #[must_use]
    pub fn next_interval(&self, current: Duration) -> Duration {
        let doubled = current.saturating_mul(2);
        if doubled > self.max_interval {
            self.max_interval
        } else {
            doubled
        }
    }
}

/// Calls "check" until it yields a value or the policy deadline passes.
/// "check" returning an error aborts the poll immediately.
pub async fn poll_until<T, F, Fut>(
    policy: &PollPolicy,
    operation: &str,
    target: &str,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    log::info!(
        "polling '{}' on {} (timeout {:?}, initial interval {:?})",
        operation,
        target,
        policy.timeout,
        policy.initial_interval
    );

    let start = Instant::now();
    let mut interval = policy.initial_interval;
    let mut cnt: u64 = 0;
    loop {
        if let Some(v) = check().await? {
            log::info!(
                "'{}' on {} done after {} poll(s), elapsed {:?}",
                operation,
                target,
                cnt + 1,
                start.elapsed()
            );
            return Ok(v);
        }
        cnt += 1;

        let elapsed = start.elapsed();
        if elapsed >= policy.timeout {
            return Err(Error::Timeout {
                operation: operation.to_string(),
                target: target.to_string(),
                elapsed,
            });
        }

        log::debug!("'{}' on {} not ready; sleeping {:?}", operation, target, interval);
        sleep(interval.min(policy.timeout - elapsed)).await;
        interval = policy.next_interval(interval);
    }
}

/// Retries a fallible call a fixed number of times with a fixed backoff.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Duration::from_secs(5),
        }
    }
}

/// Runs "call" up to "max_attempts" times.
/// On exhaustion returns the attempt count together with the last error.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> std::result::Result<T, (u32, Error)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(v) => {
                if attempt > 1 {
                    log::info!("'{}' succeeded on attempt {}", operation, attempt);
                }
                return Ok(v);
            }
            Err(e) => {
                if attempt >= max_attempts {
                    return Err((attempt, e));
                }
                log::warn!(
                    "'{}' attempt {}/{} failed ({}); retrying after {:?}...",
                    operation,
                    attempt,
                    max_attempts,
                    e,
                    policy.backoff
                );
                sleep(policy.backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
macro_rules! ab {
    ($e:expr) => {
        tokio_test::block_on($e)
    };
}

/// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- utils::backoff::test_next_interval --exact --show-output
#[test]
fn test_next_interval() {
    let policy = PollPolicy {
        initial_interval: Duration::from_secs(1),
        max_interval: Duration::from_secs(5),
        timeout: Duration::from_secs(60),
    };
    assert_eq!(policy.next_interval(Duration::from_secs(1)), Duration::from_secs(2));
    assert_eq!(policy.next_interval(Duration::from_secs(2)), Duration::from_secs(4));
    assert_eq!(policy.next_interval(Duration::from_secs(4)), Duration::from_secs(5));
    assert_eq!(policy.next_interval(Duration::from_secs(5)), Duration::from_secs(5));
}

/// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- utils::backoff::test_poll_until --exact --show-output
#[test]
fn test_poll_until() {
    use std::cell::Cell;
    let _ = env_logger::builder().is_test(true).try_init();

    let policy = PollPolicy {
        initial_interval: Duration::from_millis(1),
        max_interval: Duration::from_millis(4),
        timeout: Duration::from_secs(5),
    };

    let calls = Cell::new(0);
    let v = ab!(poll_until(&policy, "count", "test", || {
        calls.set(calls.get() + 1);
        let n = calls.get();
        async move { Ok(if n >= 3 { Some(n) } else { None }) }
    }))
    .unwrap();
    assert_eq!(v, 3);
    assert_eq!(calls.get(), 3);
}

/// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- utils::backoff::test_poll_until_timeout --exact --show-output
#[test]
fn test_poll_until_timeout() {
    let _ = env_logger::builder().is_test(true).try_init();

    let policy = PollPolicy {
        initial_interval: Duration::from_millis(1),
        max_interval: Duration::from_millis(2),
        timeout: Duration::from_millis(20),
    };
    let ret: Result<()> = ab!(poll_until(&policy, "never", "vol-1", || async {
        Ok(None)
    }));
    match ret {
        Err(Error::Timeout {
            operation, target, ..
        }) => {
            assert_eq!(operation, "never");
            assert_eq!(target, "vol-1");
        }
        other => panic!("unexpected {:?}", other),
    }
}

/// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- utils::backoff::test_poll_until_error --exact --show-output
#[test]
fn test_poll_until_error() {
    let policy = PollPolicy::default();
    let ret: Result<()> = ab!(poll_until(&policy, "fails", "vol-1", || async {
        Err(Error::API {
            message: "boom".to_string(),
            retryable: false,
        })
    }));
    assert!(matches!(ret, Err(Error::API { .. })));
}

/// RUST_LOG=debug cargo test --package ebs-provisioner --lib -- utils::backoff::test_retry --exact --show-output
#[test]
fn test_retry() {
    use std::cell::Cell;
    let _ = env_logger::builder().is_test(true).try_init();

    let policy = RetryPolicy {
        max_attempts: 2,
        backoff: Duration::from_millis(1),
    };

    // fails once, then succeeds
    let calls = Cell::new(0);
    let v = ab!(retry(&policy, "flaky", || {
        calls.set(calls.get() + 1);
        let n = calls.get();
        async move {
            if n == 1 {
                Err(Error::Other {
                    message: "first".to_string(),
                    retryable: true,
                })
            } else {
                Ok(n)
            }
        }
    }))
    .unwrap();
    assert_eq!(v, 2);

    // fails every time; gives up after max attempts
    let calls = Cell::new(0);
    let ret: std::result::Result<(), (u32, Error)> = ab!(retry(&policy, "broken", || {
        calls.set(calls.get() + 1);
        async {
            Err(Error::Other {
                message: "always".to_string(),
                retryable: false,
            })
        }
    }));
    let (attempts, e) = ret.unwrap_err();
    assert_eq!(attempts, 2);
    assert_eq!(calls.get(), 2);
    assert_eq!(e.message(), "always");
}
