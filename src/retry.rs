use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng as _;

/// Retry decision returned by the error classifier callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Try again. `after` is a server-supplied backoff hint that overrides
    /// the policy delay; `rate_limited` feeds the shared [`Pacer`].
    Retry {
        after: Option<Duration>,
        rate_limited: bool,
    },
    Abort,
}

/// Bounded retry policy. `max_attempts` counts the initial call.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryConfig {
    /// Policy delay when the server gave no hint.
    ///
    /// Formula: `min(base_delay * pacer_multiplier, max_delay) + random_jitter(0..=base_delay/4)`
    pub fn delay(&self, pacer: &Pacer) -> Duration {
        let scaled = self.base_delay.mul_f64(pacer.multiplier());
        let capped = scaled.min(self.max_delay);
        let jitter_ms = (self.base_delay.as_millis() / 4) as u64;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        capped + Duration::from_millis(jitter)
    }
}

const MULTIPLIER_ONE: u32 = 1000;
const MULTIPLIER_MAX: u32 = 64 * MULTIPLIER_ONE;

/// Process-lifetime pacing signal shared by every remote call.
///
/// A rate-limit response doubles the multiplier (capped at 64x); each
/// successful call decays it by a tenth of its excess over 1x. The value is
/// stored as fixed-point thousandths in an atomic so concurrent transfer
/// workers can update it without a lock.
#[derive(Debug)]
pub struct Pacer {
    multiplier_milli: AtomicU32,
    pace_unit: Duration,
}

impl Pacer {
    pub fn new(pace_unit: Duration) -> Self {
        Self {
            multiplier_milli: AtomicU32::new(MULTIPLIER_ONE),
            pace_unit,
        }
    }

    pub fn multiplier(&self) -> f64 {
        f64::from(self.multiplier_milli.load(Ordering::Acquire)) / f64::from(MULTIPLIER_ONE)
    }

    pub fn on_rate_limited(&self) {
        let _ = self
            .multiplier_milli
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |m| {
                Some(m.saturating_mul(2).min(MULTIPLIER_MAX))
            });
    }

    pub fn on_success(&self) {
        let _ = self
            .multiplier_milli
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |m| {
                if m <= MULTIPLIER_ONE {
                    None
                } else {
                    let step = ((m - MULTIPLIER_ONE) / 10).max(1);
                    Some(m - step)
                }
            });
    }

    /// Pause inserted before each remote call; zero until a rate limit is seen.
    pub fn pause(&self) -> Duration {
        self.pace_unit.mul_f64(self.multiplier() - 1.0)
    }

    pub async fn throttle(&self) {
        let pause = self.pause();
        if !pause.is_zero() {
            tracing::debug!(pause_ms = pause.as_millis() as u64, "pacing remote call");
            tokio::time::sleep(pause).await;
        }
    }
}

impl Default for Pacer {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Retry an async operation under the shared pacer.
///
/// - `config`: attempt cap and delay policy
/// - `pacer`: process-wide pacing state, updated on every outcome
/// - `classifier`: inspects an error and returns `Retry` or `Abort`
/// - `operation`: the async closure to retry
///
/// Returns the first `Ok` result, or the last error once the classifier
/// returns `Abort` or `max_attempts` calls have been made.
pub async fn retry_with_backoff<F, Fut, T, E, C>(
    config: &RetryConfig,
    pacer: &Pacer,
    classifier: C,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryAction,
    E: std::fmt::Display,
{
    let total_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        pacer.throttle().await;

        let err = match operation().await {
            Ok(val) => {
                pacer.on_success();
                return Ok(val);
            }
            Err(e) => e,
        };

        let after = match classifier(&err) {
            RetryAction::Abort => return Err(err),
            RetryAction::Retry {
                after,
                rate_limited,
            } => {
                if rate_limited {
                    pacer.on_rate_limited();
                }
                after
            }
        };

        if attempt >= total_attempts {
            return Err(err);
        }

        let delay = after.unwrap_or_else(|| config.delay(pacer));
        tracing::warn!(
            "Retryable error (attempt {}/{}), retrying in {:.1}s: {}",
            attempt,
            total_attempts,
            delay.as_secs_f64(),
            err
        );
        tokio::time::sleep(delay).await;
    }
}
