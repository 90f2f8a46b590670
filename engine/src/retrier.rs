//! Bounded retry with exponential backoff and jitter.
//!
//! Per-attempt deadlines live in the underlying clients (every outbound
//! call is already deadline-bound); this module decides whether and when to
//! try again. Transient failures are retried up to the limit, everything
//! else escalates immediately.

use rand::Rng;
use std::{cmp::min, fmt::Display, future::Future, time::Duration};
use tracing::warn;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug)]
pub struct RetryLimits {
	pub initial_delay: Duration,
	pub max_attempts: u32,
}

impl RetryLimits {
	pub const fn new(initial_delay: Duration, max_attempts: u32) -> Self {
		Self { initial_delay, max_attempts }
	}
}

fn backoff_ceiling(initial_delay: Duration, attempt: u32) -> Duration {
	min(MAX_BACKOFF, initial_delay.saturating_mul(2u32.saturating_pow(attempt)))
}

/// Jittered delay before retry number `attempt` (zero-based): at least half
/// the exponential ceiling, at most the ceiling.
fn retry_delay(initial_delay: Duration, attempt: u32) -> Duration {
	let half = backoff_ceiling(initial_delay, attempt) / 2;
	if half.is_zero() {
		return Duration::ZERO
	}
	half + rand::thread_rng().gen_range(Duration::ZERO..half)
}

/// Drives `submit` until it succeeds, fails permanently, or the attempt
/// budget runs out. The last error is returned on exhaustion.
pub async fn with_retries<T, E, F, Fut, P>(
	name: &str,
	limits: RetryLimits,
	is_transient: P,
	mut submit: F,
) -> Result<T, E>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
	P: Fn(&E) -> bool,
	E: Display,
{
	let mut attempt = 0u32;
	loop {
		match submit().await {
			Ok(value) => return Ok(value),
			Err(error) if !is_transient(&error) => return Err(error),
			Err(error) => {
				attempt += 1;
				if attempt >= limits.max_attempts {
					warn!(%name, %error, attempts = attempt, "retry budget exhausted");
					return Err(error)
				}
				let delay = retry_delay(limits.initial_delay, attempt - 1);
				warn!(%name, %error, attempt, delay_ms = delay.as_millis() as u64, "transient failure, retrying");
				tokio::time::sleep(delay).await;
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	#[derive(Debug, thiserror::Error)]
	enum TestError {
		#[error("transient")]
		Transient,
		#[error("permanent")]
		Permanent,
	}

	const LIMITS: RetryLimits = RetryLimits::new(Duration::from_millis(1), 5);

	#[tokio::test(start_paused = true)]
	async fn succeeds_after_transient_failures() {
		let attempts = AtomicU32::new(0);
		let result = with_retries(
			"test",
			LIMITS,
			|e| matches!(e, TestError::Transient),
			|| async {
				if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
					Err(TestError::Transient)
				} else {
					Ok(99)
				}
			},
		)
		.await;
		assert_eq!(result.unwrap(), 99);
		assert_eq!(attempts.load(Ordering::SeqCst), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn permanent_errors_do_not_retry() {
		let attempts = AtomicU32::new(0);
		let result: Result<(), _> = with_retries(
			"test",
			LIMITS,
			|e| matches!(e, TestError::Transient),
			|| async {
				attempts.fetch_add(1, Ordering::SeqCst);
				Err(TestError::Permanent)
			},
		)
		.await;
		assert!(matches!(result.unwrap_err(), TestError::Permanent));
		assert_eq!(attempts.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn exhaustion_returns_the_last_error() {
		let attempts = AtomicU32::new(0);
		let result: Result<(), _> = with_retries(
			"test",
			LIMITS,
			|_| true,
			|| async {
				attempts.fetch_add(1, Ordering::SeqCst);
				Err(TestError::Transient)
			},
		)
		.await;
		assert!(matches!(result.unwrap_err(), TestError::Transient));
		assert_eq!(attempts.load(Ordering::SeqCst), LIMITS.max_attempts);
	}

	#[test]
	fn backoff_doubles_and_caps() {
		let initial = Duration::from_secs(1);
		assert_eq!(backoff_ceiling(initial, 0), Duration::from_secs(1));
		assert_eq!(backoff_ceiling(initial, 3), Duration::from_secs(8));
		assert_eq!(backoff_ceiling(initial, 30), MAX_BACKOFF);
	}
}
