//! Backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter. Provides the backoff
//! for in-call HTTP retries and the restart backoff for partition chains.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for retrying a single HTTP call after a timeout or connect error.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 5
/// - Jitter enabled
pub fn http_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(5)
        .with_jitter()
}

/// Backoff between restarts of a failed partition chain.
///
/// Never runs out: a partition is restarted for as long as the engine runs.
pub fn restart_backoff(min_delay: Duration, max_delay: Duration) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(min_delay)
        .with_max_delay(max_delay.max(min_delay))
        .without_max_times()
        .with_jitter()
}

#[cfg(test)]
mod tests {
    use backon::BackoffBuilder;

    use super::*;

    #[test]
    fn test_http_backoff_is_bounded() {
        let delays: Vec<Duration> = http_backoff().build().collect();
        assert_eq!(delays.len(), 5);
        assert!(delays.iter().all(|d| *d >= Duration::from_millis(100)));
    }

    #[test]
    fn test_restart_backoff_never_runs_out() {
        let mut delays =
            restart_backoff(Duration::from_millis(10), Duration::from_millis(40)).build();

        for _ in 0..100 {
            let delay = delays.next().unwrap();
            assert!(delay >= Duration::from_millis(10));
        }
    }
}
