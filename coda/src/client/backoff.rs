//! Exponential connection backoff with jitter, shared by subchannels and
//! the retry machinery.

use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;

#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// The amount of time to backoff after the first failure.
    pub base_delay: Duration,

    /// The factor with which to multiply backoffs after a failed attempt.
    /// Should ideally be greater than 1.
    pub multiplier: f64,

    /// The factor with which backoffs are randomized.
    pub jitter: f64,

    /// The upper bound of backoff delay.
    pub max_delay: Duration,

    /// The minimum amount of time a connection attempt is given before it is
    /// declared timed out, so that a burst of failing attempts cannot spin.
    pub min_connect_timeout: Duration,
}

/// The canonical backoff parameters for connection attempts.
pub const DEFAULT_EXPONENTIAL_CONFIG: BackoffConfig = BackoffConfig {
    base_delay: Duration::from_secs(1),
    multiplier: 1.6,
    jitter: 0.2,
    max_delay: Duration::from_secs(120),
    min_connect_timeout: Duration::from_secs(20),
};

impl Default for BackoffConfig {
    fn default() -> Self {
        DEFAULT_EXPONENTIAL_CONFIG.clone()
    }
}

impl BackoffConfig {
    fn validate(&self) -> Result<(), &'static str> {
        if self.base_delay > self.max_delay {
            Err("base_delay must not be greater than max_delay")?;
        }
        if self.multiplier < 1.0 {
            Err("multiplier must be greater than or equal to 1.0")?;
        }
        if self.jitter < 0.0 {
            Err("jitter must be greater than or equal to 0")?;
        }
        if self.jitter > 1.0 {
            Err("jitter must be less than or equal to 1")?;
        }
        Ok(())
    }
}

pub struct ExponentialBackoff {
    config: BackoffConfig,

    /// The delay for the next attempt, without the random jitter. Stored as
    /// f64 to avoid rounding errors.
    next_delay_secs: Mutex<f64>,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Result<Self, &'static str> {
        config.validate()?;
        let next_delay_secs = config.base_delay.as_secs_f64();
        Ok(ExponentialBackoff {
            config,
            next_delay_secs: Mutex::new(next_delay_secs),
        })
    }

    /// Resets the next delay to the base delay. Called when a connection
    /// attempt succeeds, or on an explicit application reset.
    pub fn reset(&self) {
        let mut next_delay = self.next_delay_secs.lock().unwrap();
        *next_delay = self.config.base_delay.as_secs_f64();
    }

    /// Forces the next attempt to happen without delay. Unlike `reset`, the
    /// delay after that resumes from the base delay.
    pub fn skip_next(&self) {
        let mut next_delay = self.next_delay_secs.lock().unwrap();
        *next_delay = 0.0;
    }

    /// Returns the delay to apply before the next attempt and advances the
    /// internal schedule.
    pub fn backoff_duration(&self) -> Duration {
        let mut next_delay = self.next_delay_secs.lock().unwrap();
        let jitter_factor = 1.0 + self.config.jitter * rand::rng().random_range(-1.0..1.0);
        let cur_delay = *next_delay * jitter_factor;
        *next_delay = self
            .config
            .max_delay
            .as_secs_f64()
            .min(self.config.base_delay.as_secs_f64().max(*next_delay) * self.config.multiplier);
        Duration::from_secs_f64(cur_delay.max(0.0))
    }

    pub fn min_connect_timeout(&self) -> Duration {
        self.config.min_connect_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    fn config(multiplier: f64, jitter: f64, base: u64, max: u64) -> BackoffConfig {
        BackoffConfig {
            multiplier,
            jitter,
            base_delay: Duration::from_secs(base),
            max_delay: Duration::from_secs(max),
            min_connect_timeout: Duration::from_secs(20),
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(ExponentialBackoff::new(DEFAULT_EXPONENTIAL_CONFIG.clone()).is_ok());
    }

    #[test]
    fn base_more_than_max() {
        assert!(ExponentialBackoff::new(config(123.0, 0.0, 100, 10)).is_err());
    }

    #[test]
    fn negative_multiplier() {
        assert!(ExponentialBackoff::new(config(-123.0, 0.0, 10, 100)).is_err());
    }

    #[test]
    fn jitter_out_of_range() {
        assert!(ExponentialBackoff::new(config(1.0, -10.0, 10, 100)).is_err());
        assert!(ExponentialBackoff::new(config(1.0, 2.0, 10, 100)).is_err());
    }

    #[test]
    fn backoff_reset_no_jitter() {
        let backoff = ExponentialBackoff::new(config(2.0, 0.0, 1, 15)).unwrap();
        assert_eq!(backoff.backoff_duration(), Duration::from_secs(1));
        assert_eq!(backoff.backoff_duration(), Duration::from_secs(2));
        assert_eq!(backoff.backoff_duration(), Duration::from_secs(4));
        assert_eq!(backoff.backoff_duration(), Duration::from_secs(8));
        assert_eq!(backoff.backoff_duration(), Duration::from_secs(15));
        // Duration is capped to max_delay.
        assert_eq!(backoff.backoff_duration(), Duration::from_secs(15));

        // reset and repeat.
        backoff.reset();
        assert_eq!(backoff.backoff_duration(), Duration::from_secs(1));
        assert_eq!(backoff.backoff_duration(), Duration::from_secs(2));
    }

    #[test]
    fn skip_next_is_one_shot() {
        let backoff = ExponentialBackoff::new(config(2.0, 0.0, 1, 15)).unwrap();
        backoff.skip_next();
        assert_eq!(backoff.backoff_duration(), Duration::ZERO);
        // The schedule resumes from the base delay.
        assert_eq!(backoff.backoff_duration(), Duration::from_secs(2));
    }

    #[test]
    fn backoff_with_jitter() {
        let backoff = ExponentialBackoff::new(config(2.0, 0.2, 1, 15)).unwrap();
        // 0.8 <= duration <= 1.2.
        let duration = backoff.backoff_duration();
        assert!(duration > Duration::from_secs_f64(0.8 - EPSILON));
        assert!(duration < Duration::from_secs_f64(1.2 + EPSILON));
        // 1.6 <= duration <= 2.4.
        let duration = backoff.backoff_duration();
        assert!(duration > Duration::from_secs_f64(1.6 - EPSILON));
        assert!(duration < Duration::from_secs_f64(2.4 + EPSILON));
        // 3.2 <= duration <= 4.8.
        let duration = backoff.backoff_duration();
        assert!(duration > Duration::from_secs_f64(3.2 - EPSILON));
        assert!(duration < Duration::from_secs_f64(4.8 + EPSILON));
    }
}
