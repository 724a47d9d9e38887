//! Exponential backoff for re-establishing a lost transport.
//!
//! [`Backoff`] yields jittered, exponentially growing delays; [`retry`]
//! drives an async connect attempt with them until it succeeds or the
//! attempts run out. A client resuming a session sizes its backoff with
//! [`BackoffConfig::within_grace`] so it gives up roughly when the host's
//! reconnection deadline would fail the peer anyway.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Delay schedule for reconnection attempts.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first attempt. Default: 250 ms.
    pub initial_delay: Duration,
    /// Growth factor per failed attempt. Default: 2.0.
    pub multiplier: f64,
    /// Upper bound on a single delay. Default: 10 s.
    pub max_delay: Duration,
    /// Attempts before giving up. Default: 10.
    pub max_attempts: u32,
    /// Jitter factor (0.0 to 1.0), applied as ±jitter. Default: 0.2.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            max_attempts: 10,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Limit the attempts so the un-jittered delays add up to no more than
    /// `grace`. At least one attempt is always allowed.
    pub fn within_grace(mut self, grace: Duration) -> Self {
        let mut total = Duration::ZERO;
        let mut delay = self.initial_delay;
        let mut attempts = 0;
        while attempts < self.max_attempts {
            total += delay.min(self.max_delay);
            if total > grace {
                break;
            }
            attempts += 1;
            delay = delay.mul_f64(self.multiplier);
        }
        self.max_attempts = attempts.max(1);
        self
    }
}

/// Attempt counter and delay generator.
pub struct Backoff {
    config: BackoffConfig,
    attempts: u32,
    current: Duration,
}

impl Backoff {
    /// Start a fresh schedule.
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.initial_delay;
        Self {
            config,
            attempts: 0,
            current,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_attempts {
            return None;
        }
        self.attempts += 1;

        let base = self.current;
        self.current = self
            .current
            .mul_f64(self.config.multiplier)
            .min(self.config.max_delay);

        let delay = if self.config.jitter > 0.0 {
            let factor = rand::rng()
                .random_range((1.0 - self.config.jitter)..=(1.0 + self.config.jitter));
            base.mul_f64(factor)
        } else {
            base
        };
        Some(delay.min(self.config.max_delay))
    }

    /// Restart the schedule after a success.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current = self.config.initial_delay;
    }

    /// Attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Errors produced while reconnecting.
#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    /// Every attempt failed.
    #[error("gave up after {attempts} attempts")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
    },

    /// An I/O error occurred during an attempt.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sleep and call `attempt` until it succeeds or the schedule runs out.
pub async fn retry<T, E, F, Fut>(config: BackoffConfig, mut attempt: F) -> Result<T, ReconnectError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = Backoff::new(config);
    while let Some(delay) = backoff.next_delay() {
        tracing::info!("Reconnection attempt {} in {:?}", backoff.attempts(), delay);
        tokio::time::sleep(delay).await;

        match attempt().await {
            Ok(value) => {
                tracing::info!("Reconnected after {} attempts", backoff.attempts());
                return Ok(value);
            }
            Err(e) => {
                tracing::warn!("Reconnection attempt {} failed: {e}", backoff.attempts());
            }
        }
    }
    Err(ReconnectError::Exhausted {
        attempts: backoff.attempts(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            jitter: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_delays_double_until_cap() {
        let mut backoff = Backoff::new(BackoffConfig {
            max_delay: Duration::from_secs(1),
            ..no_jitter()
        });
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).take(4).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
    }

    #[test]
    fn test_attempts_exhaust() {
        let mut backoff = Backoff::new(BackoffConfig {
            max_attempts: 2,
            ..no_jitter()
        });
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert!(backoff.next_delay().is_some());
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let mut backoff = Backoff::new(BackoffConfig {
            max_attempts: 1,
            ..Default::default()
        });
        let delay = backoff.next_delay().unwrap();
        assert!(delay >= Duration::from_millis(200));
        assert!(delay <= Duration::from_millis(300));
    }

    #[test]
    fn test_within_grace_limits_attempts() {
        // 250 + 500 + 1000 = 1750 <= 2s; adding 2000 exceeds it.
        let config = no_jitter().within_grace(Duration::from_secs(2));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(no_jitter().within_grace(Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let mut calls = 0;
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(1),
            ..no_jitter()
        };
        let result = retry(config, || {
            calls += 1;
            let ok = calls >= 3;
            async move { if ok { Ok(calls) } else { Err("refused") } }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(1),
            max_attempts: 2,
            ..no_jitter()
        };
        let result: Result<(), _> = retry(config, || async { Err::<(), _>("refused") }).await;
        assert!(matches!(result, Err(ReconnectError::Exhausted { attempts: 2 })));
    }
}
