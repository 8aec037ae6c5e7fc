use crate::config::RetrySettings;
use cosmosql_error::{CosmosError, ErrorCode};
use rand::Rng;
use std::time::Duration;

/// Calculate the delay for the next retry attempt with exponential backoff.
///
/// `attempt` is zero-based. Jitter of up to half the exponential delay is added
/// before the cap is applied.
pub fn next_retry_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let multiplier = 2_u64.saturating_pow(attempt);
    let delay = base_ms.saturating_mul(multiplier);
    let jitter = rand::random::<u64>() % (delay / 2 + 1);
    let total = delay.saturating_add(jitter);
    Duration::from_millis(total.min(max_ms))
}

/// What the pipeline should do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep, then resend the same request.
    RetryAfter(Duration),
    /// Refresh the partition key range map, then resend once.
    InvalidateAndRetry,
    /// Surface the error.
    Fail,
}

/// Budget spent by one logical request. Retries of a logical request share one state.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub throttled: u32,
    pub retry_with: u32,
    pub transient: u32,
    pub topology_refreshed: bool,
    pub waited: Duration,
}

impl RetryState {
    pub fn attempts(&self) -> u32 {
        1 + self.throttled + self.retry_with + self.transient + u32::from(self.topology_refreshed)
    }
}

/// Classifies failures into retry decisions.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    settings: RetrySettings,
}

impl RetryPolicy {
    pub fn new(settings: RetrySettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RetrySettings {
        &self.settings
    }

    /// Decide whether `err` is retried, updating `state` when it is.
    ///
    /// `idempotent` gates retries of timeouts, 5xx and network failures: a
    /// non-idempotent write may have been applied before the failure surfaced.
    pub fn evaluate(
        &self,
        err: &CosmosError,
        state: &mut RetryState,
        idempotent: bool,
    ) -> RetryDecision {
        let s = &self.settings;
        match err.code {
            ErrorCode::Throttled => {
                if state.throttled >= s.max_attempts {
                    return RetryDecision::Fail;
                }
                let delay = match err.retry_after_ms {
                    Some(ms) => Duration::from_millis(ms),
                    None => next_retry_delay(state.throttled, s.base_delay_ms, s.max_delay_ms),
                };
                if state.waited + delay > Duration::from_millis(s.max_wait_ms) {
                    return RetryDecision::Fail;
                }
                state.throttled += 1;
                state.waited += delay;
                RetryDecision::RetryAfter(delay)
            }
            ErrorCode::RetryWith => {
                if state.retry_with >= s.retry_with_max_attempts {
                    return RetryDecision::Fail;
                }
                let delay = Duration::from_millis(
                    rand::rng().random_range(s.retry_with_min_delay_ms..=s.retry_with_max_delay_ms),
                );
                state.retry_with += 1;
                state.waited += delay;
                RetryDecision::RetryAfter(delay)
            }
            ErrorCode::PartitionKeyRangeGone | ErrorCode::NameCacheStale => {
                if state.topology_refreshed {
                    return RetryDecision::Fail;
                }
                state.topology_refreshed = true;
                RetryDecision::InvalidateAndRetry
            }
            ErrorCode::RequestTimeout | ErrorCode::ServiceUnavailable | ErrorCode::NetworkError
                if idempotent =>
            {
                if state.transient >= s.transient_max_attempts {
                    return RetryDecision::Fail;
                }
                let delay = next_retry_delay(state.transient, s.base_delay_ms, s.max_delay_ms);
                state.transient += 1;
                state.waited += delay;
                RetryDecision::RetryAfter(delay)
            }
            _ => RetryDecision::Fail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttled(retry_after_ms: Option<u64>) -> CosmosError {
        CosmosError::from_status(429, None, "throttled").with_retry_after_ms(retry_after_ms)
    }

    #[test]
    fn test_next_retry_delay_is_capped() {
        for attempt in 0..20 {
            let d = next_retry_delay(attempt, 100, 5_000);
            assert!(d <= Duration::from_millis(5_000));
        }
        let first = next_retry_delay(0, 100, 5_000);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
    }

    #[test]
    fn test_throttle_uses_server_delay() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::default();
        assert_eq!(
            policy.evaluate(&throttled(Some(200)), &mut state, false),
            RetryDecision::RetryAfter(Duration::from_millis(200))
        );
        assert_eq!(state.throttled, 1);
        assert_eq!(state.waited, Duration::from_millis(200));
    }

    #[test]
    fn test_throttle_attempt_budget() {
        let policy = RetryPolicy::new(RetrySettings {
            max_attempts: 2,
            ..Default::default()
        });
        let mut state = RetryState::default();
        let err = throttled(Some(1));
        assert!(matches!(
            policy.evaluate(&err, &mut state, true),
            RetryDecision::RetryAfter(_)
        ));
        assert!(matches!(
            policy.evaluate(&err, &mut state, true),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(policy.evaluate(&err, &mut state, true), RetryDecision::Fail);
    }

    #[test]
    fn test_throttle_wait_budget() {
        let policy = RetryPolicy::new(RetrySettings {
            max_wait_ms: 500,
            ..Default::default()
        });
        let mut state = RetryState::default();
        let err = throttled(Some(300));
        assert!(matches!(
            policy.evaluate(&err, &mut state, true),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(policy.evaluate(&err, &mut state, true), RetryDecision::Fail);
    }

    #[test]
    fn test_retry_with_small_fixed_sleep() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::default();
        let err = CosmosError::from_status(449, None, "retry with");
        for _ in 0..3 {
            match policy.evaluate(&err, &mut state, false) {
                RetryDecision::RetryAfter(d) => {
                    assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(50))
                }
                other => panic!("unexpected decision {:?}", other),
            }
        }
        assert_eq!(policy.evaluate(&err, &mut state, false), RetryDecision::Fail);
    }

    #[test]
    fn test_gone_invalidates_once() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::default();
        let err = CosmosError::from_status(410, Some(1002), "gone");
        assert_eq!(
            policy.evaluate(&err, &mut state, true),
            RetryDecision::InvalidateAndRetry
        );
        assert_eq!(policy.evaluate(&err, &mut state, true), RetryDecision::Fail);
    }

    #[test]
    fn test_transient_only_when_idempotent() {
        let policy = RetryPolicy::default();
        let err = CosmosError::from_status(503, None, "unavailable");

        let mut state = RetryState::default();
        assert_eq!(policy.evaluate(&err, &mut state, false), RetryDecision::Fail);

        let mut state = RetryState::default();
        assert!(matches!(
            policy.evaluate(&err, &mut state, true),
            RetryDecision::RetryAfter(_)
        ));
    }

    #[test]
    fn test_terminal_statuses_never_retry() {
        let policy = RetryPolicy::default();
        for status in [401, 403, 404, 409, 412, 413] {
            let mut state = RetryState::default();
            let err = CosmosError::from_status(status, None, "terminal");
            assert_eq!(
                policy.evaluate(&err, &mut state, true),
                RetryDecision::Fail,
                "status {}",
                status
            );
        }
    }
}
