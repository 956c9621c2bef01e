//! Circuit breaking for outbound delivery (email relay, SMS gateway).

use failsafe::futures::CircuitBreaker;
use failsafe::{backoff, failure_policy, Config, StateMachine};
use std::future::Future;
use std::time::Duration;

/// Consecutive failures before the breaker opens.
pub const FAILURE_THRESHOLD: u32 = 5;

/// Breaker type shared by outbound HTTP integrations.
pub type DeliveryBreaker =
    StateMachine<failure_policy::ConsecutiveFailures<backoff::Exponential>, ()>;

/// Outcome of a guarded call that did not succeed.
#[derive(Debug)]
pub enum Guarded<E> {
    /// The call ran and failed.
    Failed(E),
    /// The breaker is open; the call was never attempted.
    Rejected,
}

/// Creates the breaker placed in front of a delivery endpoint.
///
/// Opens after [`FAILURE_THRESHOLD`] consecutive failures, then waits with
/// exponential backoff (10s up to 60s) before letting a trial call through.
/// Clones share state.
pub fn delivery_breaker() -> DeliveryBreaker {
    let backoff_strategy = backoff::exponential(Duration::from_secs(10), Duration::from_secs(60));
    let failure_policy = failure_policy::consecutive_failures(FAILURE_THRESHOLD, backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}

/// Run `attempt` through `breaker`, counting any `Err` as a failure.
pub async fn guarded<T, E, F>(
    breaker: &DeliveryBreaker,
    target: &str,
    attempt: F,
) -> Result<T, Guarded<E>>
where
    F: Future<Output = Result<T, E>>,
{
    match breaker.call(attempt).await {
        Ok(value) => Ok(value),
        Err(failsafe::Error::Inner(e)) => Err(Guarded::Failed(e)),
        Err(failsafe::Error::Rejected) => {
            tracing::warn!("Circuit open for {}, rejecting call", target);
            Err(Guarded::Rejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn breaker_rejects_after_threshold() {
        let breaker = delivery_breaker();

        for _ in 0..FAILURE_THRESHOLD {
            let result = guarded(&breaker, "test", async { Err::<(), &str>("relay down") }).await;
            assert!(matches!(result, Err(Guarded::Failed("relay down"))));
        }

        let result = guarded(&breaker, "test", async { Ok::<(), &str>(()) }).await;
        assert!(matches!(result, Err(Guarded::Rejected)));
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let breaker = delivery_breaker();

        for _ in 0..FAILURE_THRESHOLD - 1 {
            let _ = guarded(&breaker, "test", async { Err::<(), &str>("flaky") }).await;
        }
        let value = guarded(&breaker, "test", async { Ok::<i32, &str>(42) }).await;
        assert!(matches!(value, Ok(42)));

        let result = guarded(&breaker, "test", async { Err::<(), &str>("flaky") }).await;
        assert!(matches!(result, Err(Guarded::Failed(_))));
    }
}
