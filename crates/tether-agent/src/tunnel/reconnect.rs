//! Backoff between control connection attempts

use std::time::Duration;

use tether_core::config::BackoffConfig;

/// Delay schedule shared by every failure path of the supervisor.
///
/// With the default configuration this is a fixed 10 second wait.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay restored by [`Backoff::reset`]
    initial: Duration,
    /// Delay returned by the next call
    current: Duration,
    /// Upper bound before jitter
    max: Duration,
    /// Growth per attempt
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
}

impl Backoff {
    /// Create a backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    /// Create a backoff with custom parameters
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            current: initial,
            max,
            multiplier: if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 },
            jitter: if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 },
        }
    }

    /// Get the next delay and advance the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        // Saturates at max when the product leaves the range of Duration
        let next = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max);
        self.current = next.min(self.max);

        // Jitter only ever lengthens the wait
        let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        delay.saturating_add(Duration::try_from_secs_f64(jitter_amount).unwrap_or_default())
    }

    /// Return to the initial delay after a connection succeeded
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_fixed_ten_seconds() {
        let mut backoff = Backoff::default();
        for _ in 0..5 {
            assert_eq!(backoff.next_delay(), Duration::from_secs(10));
        }
    }

    #[test]
    fn test_backoff_increases() {
        let mut backoff = Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            2.0,
            0.0, // No jitter for deterministic test
        );

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_max() {
        let mut backoff =
            Backoff::new(Duration::from_secs(10), Duration::from_secs(15), 2.0, 0.0);

        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(15));
        assert_eq!(backoff.next_delay(), Duration::from_secs(15));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 2.0, 0.0);

        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_huge_multiplier_saturates_at_max() {
        let mut backoff = Backoff::from_config(&BackoffConfig {
            initial: Duration::from_secs(10),
            max: Duration::from_secs(3600),
            multiplier: 1e300,
            jitter: 0.0,
        });

        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(3600));
        assert_eq!(backoff.next_delay(), Duration::from_secs(3600));
    }

    #[test]
    fn test_non_finite_parameters_fall_back() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(60), f64::NAN, f64::NAN);
        for _ in 0..3 {
            assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        }

        let mut backoff =
            Backoff::new(Duration::from_secs(5), Duration::MAX, f64::INFINITY, 1.0);
        backoff.next_delay();
        assert!(backoff.next_delay() >= Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_never_shortens() {
        let mut backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(10), 1.0, 0.5);
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_secs(10));
            assert!(delay <= Duration::from_secs(15));
        }
    }
}
