//! Retry, backoff, circuit breaking and rate limiting for outbound calls
//!
//! [`Resilience`] wraps one idempotent operation per call:
//!
//! - `Transient` errors are retried up to `max_retries` times with
//!   exponential backoff
//! - `RateLimited` errors wait for the provider's `Retry-After` (or the same
//!   backoff) without consuming the retry budget, up to `max_rate_limit_waits`
//! - `Fatal` errors surface immediately
//! - after `failure_threshold` consecutive failures the source's breaker
//!   opens and calls fail fast with `CircuitOpen` until the cooldown elapses
//!
//! Every attempt is bounded by `call_timeout`, and cancellation is observed
//! before each attempt and during each sleep.

pub mod backoff;
pub mod circuit;
pub mod rate_limit;

pub use backoff::Backoff;
pub use circuit::{CircuitBreaker, CircuitState};
pub use rate_limit::RequestLimiter;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ResilienceConfig;
use crate::error::{FetchError, FetchResult};
use crate::stats::RunStats;

/// Resilience policy and breaker state for one source
#[derive(Debug)]
pub struct Resilience {
    source_id: String,
    config: ResilienceConfig,
    backoff: Backoff,
    breaker: Mutex<CircuitBreaker>,
    limiter: Option<RequestLimiter>,
    stats: Arc<RunStats>,
    cancel: CancellationToken,
}

impl Resilience {
    pub fn new(
        source_id: impl Into<String>,
        config: ResilienceConfig,
        stats: Arc<RunStats>,
        cancel: CancellationToken,
    ) -> Self {
        let breaker = CircuitBreaker::new(config.failure_threshold, config.cooldown());
        let limiter = config.requests_per_minute.and_then(RequestLimiter::per_minute);
        Self {
            source_id: source_id.into(),
            backoff: Backoff::from_config(&config),
            breaker: Mutex::new(breaker),
            limiter,
            config,
            stats,
            cancel,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker().state()
    }

    fn breaker(&self) -> MutexGuard<'_, CircuitBreaker> {
        // Breaker state is a few plain fields; a panic mid-update leaves it usable
        self.breaker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn admit(&self) -> FetchResult<()> {
        self.breaker()
            .try_acquire(Instant::now())
            .map_err(|retry_in| FetchError::CircuitOpen {
                source_id: self.source_id.clone(),
                retry_in,
            })
    }

    /// Returns true if this failure opened the circuit
    fn record_failure(&self) -> bool {
        let opened = self.breaker().record_failure(Instant::now());
        if opened {
            self.stats.record_circuit_breaks(1);
        }
        opened
    }

    /// Sleep for `delay` unless the run is cancelled first
    pub async fn pause(&self, delay: Duration) -> FetchResult<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(FetchError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Run `attempt` under the retry/backoff/breaker policy
    pub async fn call<T, F, Fut>(&self, mut attempt: F) -> FetchResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = FetchResult<T>>,
    {
        let mut retries = 0u32;
        let mut rate_limit_waits = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            self.admit()?;

            if let Some(ref limiter) = self.limiter {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        self.breaker().release_probe();
                        return Err(FetchError::Cancelled);
                    }
                    _ = limiter.until_ready() => {}
                }
            }

            let outcome = match tokio::time::timeout(self.config.call_timeout(), attempt()).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::transient(format!(
                    "call timed out after {}s",
                    self.config.call_timeout_secs
                ))),
            };

            let err = match outcome {
                Ok(value) => {
                    self.breaker().record_success();
                    return Ok(value);
                },
                Err(err) => err,
            };

            match err {
                FetchError::RateLimited { retry_after } => {
                    self.breaker().release_probe();
                    self.stats.record_rate_limited(1);
                    rate_limit_waits += 1;
                    if rate_limit_waits > self.config.max_rate_limit_waits {
                        warn!(
                            source_id = %self.source_id,
                            waits = rate_limit_waits - 1,
                            "Rate-limit wait budget exhausted"
                        );
                        return Err(FetchError::RateLimited { retry_after });
                    }
                    let delay =
                        retry_after.unwrap_or_else(|| self.backoff.delay(rate_limit_waits - 1));
                    warn!(
                        source_id = %self.source_id,
                        wait = rate_limit_waits,
                        delay_ms = delay.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                    self.pause(delay).await?;
                },
                FetchError::Transient(ref msg) => {
                    let opened = self.record_failure();
                    if opened {
                        let retry_in = self.config.cooldown();
                        warn!(
                            source_id = %self.source_id,
                            error = %msg,
                            cooldown_secs = retry_in.as_secs(),
                            "Circuit opened"
                        );
                        return Err(FetchError::CircuitOpen {
                            source_id: self.source_id.clone(),
                            retry_in,
                        });
                    }
                    if retries >= self.config.max_retries {
                        warn!(
                            source_id = %self.source_id,
                            attempts = retries + 1,
                            error = %msg,
                            "Retry budget exhausted"
                        );
                        return Err(err);
                    }
                    let delay = self.backoff.delay(retries);
                    retries += 1;
                    self.stats.record_retries(1);
                    warn!(
                        source_id = %self.source_id,
                        attempt = retries,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %msg,
                        "Retrying after transient error"
                    );
                    self.pause(delay).await?;
                },
                FetchError::Fatal(ref msg) => {
                    self.record_failure();
                    debug!(source_id = %self.source_id, error = %msg, "Fatal error, not retrying");
                    return Err(err);
                },
                FetchError::CircuitOpen { .. } | FetchError::Cancelled => {
                    self.breaker().release_probe();
                    return Err(err);
                },
            }
        }
    }
}
