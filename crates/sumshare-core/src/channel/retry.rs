//! Bounded retry with exponential backoff

use super::{DeliveryFailure, SecureChannel};
use crate::{Address, Error, Message, RetryPolicy};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Send `message` to `to`, retrying transport failures per `policy`
///
/// Each attempt is bounded by `policy.attempt_timeout`. Only retryable
/// errors are attempted again; a rejection by the remote fails at once.
pub async fn deliver<C>(
    channel: &C,
    to: &Address,
    message: &Message,
    policy: &RetryPolicy,
) -> Result<(), DeliveryFailure>
where
    C: SecureChannel + ?Sized,
{
    let mut attempt = 1;
    let mut delay = policy.initial_backoff;

    loop {
        let result = match timeout(policy.attempt_timeout, channel.send(to, message)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Transport(format!(
                "No response within {:?}",
                policy.attempt_timeout
            ))),
        };

        match result {
            Ok(()) => {
                debug!(to = %to, kind = %message.kind(), attempt, "Delivered");
                return Ok(());
            }
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                warn!(
                    to = %to,
                    kind = %message.kind(),
                    "Attempt {}/{} failed, retrying in {:?}: {}",
                    attempt, policy.max_attempts, delay, e
                );
                sleep(delay).await;
                attempt += 1;
                delay = (delay * 2).min(policy.max_backoff);
            }
            Err(e) => {
                return Err(DeliveryFailure {
                    to: to.clone(),
                    kind: message.kind(),
                    attempts: attempt,
                    last_error: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::async_trait;
    use crate::{MessageKind, Result};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails the first `failures` sends
    struct Flaky {
        local: Address,
        failures: u32,
        calls: AtomicU32,
        reject: bool,
    }

    #[async_trait]
    impl SecureChannel for Flaky {
        fn local_address(&self) -> &Address {
            &self.local
        }

        async fn send(&self, _to: &Address, _message: &Message) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                if self.reject {
                    return Err(Error::Rejected {
                        status: 409,
                        message: "duplicate".into(),
                    });
                }
                return Err(Error::Transport("connection refused".into()));
            }
            Ok(())
        }
    }

    fn flaky(failures: u32, reject: bool) -> Flaky {
        Flaky {
            local: "local".into(),
            failures,
            calls: AtomicU32::new(0),
            reject,
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_secs(1)).unwrap()
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let channel = flaky(2, false);
        deliver(&channel, &"peer".into(), &Message::share(1), &policy(3))
            .await
            .unwrap();
        assert_eq!(channel.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let channel = flaky(10, false);
        let failure = deliver(&channel, &"peer".into(), &Message::share(1), &policy(3))
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.kind, MessageKind::Share);
        assert_eq!(channel.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let channel = flaky(10, true);
        let failure = deliver(&channel, &"peer".into(), &Message::share(1), &policy(5))
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 1);
        assert!(failure.last_error.contains("duplicate"));
    }

    struct Hanging(Address);

    #[async_trait]
    impl SecureChannel for Hanging {
        fn local_address(&self) -> &Address {
            &self.0
        }

        async fn send(&self, _to: &Address, _message: &Message) -> Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout() {
        let channel = Hanging("local".into());
        let policy = RetryPolicy::new(2, Duration::from_millis(5), Duration::from_millis(50)).unwrap();

        let failure = deliver(&channel, &"peer".into(), &Message::report(3), &policy)
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 2);
        assert!(failure.last_error.contains("No response"));
    }
}
