//! Retry and backoff for the host-side services loop
//!
//! The tunnel services loop (credentials relay, port forwarder, log drain)
//! restarts after transport failures with capped backoff and jitter until
//! its root context is cancelled.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Base delay applied on the first retry
    pub base_delay: Duration,
    /// Multiplier applied per attempt (1.0 = constant delay)
    pub factor: f64,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Jitter fraction applied symmetrically (0.1 = ±10%)
    pub jitter: f64,
}

impl Default for RetryConfig {
    /// The services-loop policy: start at 500 ms, constant factor, ±10%
    /// jitter, capped at 10 s.
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            factor: 1.0,
            max_delay: Duration::from_secs(10),
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Delay before the given 0-based attempt, jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            // fastrand::f64 is uniform in [0, 1); map to [-jitter, +jitter].
            let offset = (fastrand::f64() * 2.0 - 1.0) * self.jitter;
            capped * (1.0 + offset)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Sleep for the attempt's delay.
    pub async fn wait(&self, attempt: u32) {
        let delay = self.delay_for_attempt(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "retry backoff");
        tokio::time::sleep(delay).await;
    }
}

/// Restart a failing service until the root context is cancelled.
///
/// The factory is invoked to produce each service run; a run that returns
/// an error is restarted after the attempt's backoff delay. A successful
/// return ends supervision (the service chose to stop).
pub async fn supervise<F, Fut>(
    mut factory: F,
    config: &RetryConfig,
    root: &tokio_util::sync::CancellationToken,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::errors::Result<()>>,
{
    let mut attempt: u32 = 0;
    loop {
        let run = tokio::select! {
            run = factory() => run,
            _ = root.cancelled() => return,
        };
        match run {
            Ok(()) => return,
            Err(e) => {
                tracing::warn!(attempt, error = %e, "service failed, restarting");
            }
        }
        tokio::select! {
            _ = config.wait(attempt) => {}
            _ = root.cancelled() => return,
        }
        attempt = attempt.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_factor_keeps_delay_near_base() {
        let config = RetryConfig::default();
        for attempt in 0..5 {
            let delay = config.delay_for_attempt(attempt);
            let millis = delay.as_millis() as f64;
            assert!((450.0..=550.0).contains(&millis), "attempt {}: {}ms", attempt, millis);
        }
    }

    #[test]
    fn exponential_factor_is_capped() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_secs(1),
            jitter: 0.0,
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn supervise_restarts_until_cancelled() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let attempts = Arc::new(AtomicU32::new(0));
        let root = tokio_util::sync::CancellationToken::new();
        let config = RetryConfig {
            base_delay: Duration::from_millis(10),
            factor: 1.0,
            max_delay: Duration::from_millis(10),
            jitter: 0.0,
        };

        let canceller = {
            let root = root.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                root.cancel();
            })
        };

        let loop_attempts = attempts.clone();
        supervise(
            move || {
                let attempts = loop_attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(crate::errors::TunnelError::Disconnected.into())
                }
            },
            &config,
            &root,
        )
        .await;

        canceller.await.unwrap();
        assert!(attempts.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn supervise_stops_on_clean_exit() {
        let root = tokio_util::sync::CancellationToken::new();
        let config = RetryConfig::default();
        supervise(|| async { Ok(()) }, &config, &root).await;
    }
}
