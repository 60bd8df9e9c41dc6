//! Retry utilities: backoff builders for the delivery pipeline.
//!
//! Uses `backon` for exponential backoff. Policies are iterated manually
//! (`std::iter::once(ZERO).chain(builder.build())`) where per-attempt
//! logging is needed.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

/// Backoff for stream appends on the producer side.
///
/// - Min delay: 100ms
/// - Max delay: 2s
/// - Max attempts: 3
/// - Jitter enabled
pub fn send_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(3)
        .with_jitter()
}

/// Backoff between handler invocation retries.
///
/// Doubling full seconds: 1s, 2s, 4s.
pub fn handler_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(4))
        .with_max_times(3)
}

/// Backoff for shard-discovery failures.
///
/// - Min delay: 1ms
/// - Factor: 2
/// - Capped at 5s, unbounded attempts (the discovery loop never gives up)
pub fn discovery_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_secs(5))
        .without_max_times()
}

/// Attempt schedule: a zero-delay first attempt followed by the policy's
/// sleeps. `enumerate()` over this gives (attempt, pre-sleep) pairs.
pub fn attempts(builder: ExponentialBuilder) -> impl Iterator<Item = Duration> {
    std::iter::once(Duration::ZERO).chain(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_backoff_is_bounded() {
        // 1 initial attempt + 3 retries
        assert_eq!(attempts(send_backoff()).count(), 4);
    }

    #[test]
    fn test_handler_backoff_doubles_seconds() {
        let delays: Vec<Duration> = handler_backoff().build().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[test]
    fn test_discovery_backoff_caps_at_five_seconds() {
        let caps: Vec<Duration> = discovery_backoff().build().take(20).collect();
        assert_eq!(caps[0], Duration::from_millis(1));
        assert!(caps.iter().all(|d| *d <= Duration::from_secs(5)));
        assert_eq!(*caps.last().unwrap(), Duration::from_secs(5));
    }
}
