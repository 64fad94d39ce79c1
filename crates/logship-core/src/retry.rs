//! Exponential backoff configuration shared by storage retries and broker
//! connection attempts.
//!
//! Backoff formula: min(max_delay, base_delay * 2^attempt) + jitter

use std::time::Duration;

/// Configuration for exponential backoff retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay for first retry
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Maximum number of retries before escalation
    pub max_retries: u32,
    /// Whether to add jitter (randomness) to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_retries: 10,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Config for transient storage failures: short and bounded, so a sick
    /// disk escalates to a fatal error quickly.
    pub fn for_storage() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_retries: 3,
            jitter: true,
        }
    }

    /// Config for broker connection attempts: at least two seconds between
    /// tries, unbounded count (the caller stops via cancellation).
    pub fn for_broker_connect() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            max_retries: u32::MAX,
            jitter: true,
        }
    }

    /// Disable jitter (for testing).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Calculate the backoff delay for a given attempt.
    ///
    /// Uses exponential backoff: min(max_delay, base_delay * 2^attempt).
    /// Optionally adds jitter (±25%) to prevent thundering herd.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;

        let delay_ms = base_ms.saturating_mul(1u64 << attempt.min(20));
        let capped_delay_ms = delay_ms.min(max_ms);

        let final_delay_ms = if self.jitter {
            let jitter_range = capped_delay_ms / 4;
            let jitter = (std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos() as u64)
                % (jitter_range * 2 + 1);
            capped_delay_ms.saturating_sub(jitter_range) + jitter
        } else {
            capped_delay_ms
        };

        Duration::from_millis(final_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_per_attempt() {
        let config = RetryConfig::default().without_jitter();
        assert_eq!(config.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(config.calculate_delay(2), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_is_capped() {
        let config = RetryConfig::default().without_jitter();
        assert_eq!(config.calculate_delay(30), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let config = RetryConfig::default();
        let delay = config.calculate_delay(3); // 800ms nominal
        assert!(delay >= Duration::from_millis(600));
        assert!(delay <= Duration::from_millis(1000));
    }

    #[test]
    fn test_broker_connect_floor() {
        let config = RetryConfig::for_broker_connect().without_jitter();
        assert!(config.calculate_delay(0) >= Duration::from_secs(2));
    }
}
