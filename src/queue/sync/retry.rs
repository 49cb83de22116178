//! Exponential backoff for transient failures.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Pure retry timing: `base * growth^attempt`, capped at `max_delay`, plus uniform jitter of up
/// to `jitter_ratio` of the capped delay.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
	pub base_delay: Duration,
	pub growth_factor: f64,
	pub max_delay: Duration,
	pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self::from(&RetryConfig::default())
	}
}

impl From<&RetryConfig> for RetryPolicy {
	fn from(config: &RetryConfig) -> Self {
		Self {
			base_delay: Duration::from_millis(config.base_delay_ms),
			growth_factor: config.growth_factor,
			max_delay: Duration::from_millis(config.max_delay_ms),
			jitter_ratio: config.jitter_ratio,
		}
	}
}

impl RetryPolicy {
	pub fn should_retry(&self, attempt: u32, max_attempts: u32) -> bool {
		attempt < max_attempts
	}

	/// Delay before the next attempt, with jitter from the thread-local RNG.
	pub fn next_delay(&self, attempt: u32) -> Duration {
		self.next_delay_with(attempt, &mut rand::rng())
	}

	pub fn next_delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
		let delay = self.capped_delay(attempt);
		let max_jitter = delay.as_secs_f64() * self.jitter_ratio.clamp(0.0, 1.0);
		if max_jitter <= 0.0 {
			return delay;
		}
		delay + Duration::from_secs_f64(rng.random_range(0.0..=max_jitter))
	}

	/// The delay without jitter.
	pub fn capped_delay(&self, attempt: u32) -> Duration {
		let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
		let secs = self.base_delay.as_secs_f64() * self.growth_factor.powi(exponent);
		if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
			return self.max_delay;
		}
		Duration::from_secs_f64(secs)
	}
}
