//! Per-source circuit breaker
//!
//! Uses `tokio::time::Instant` so cooldowns follow the runtime clock (and
//! paused clocks in tests).

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls are permitted
    Closed,
    /// Too many consecutive failures; calls fail fast
    Open { since: Instant },
    /// Cooldown elapsed; a single probe call is permitted
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    failure_threshold: u32,
    cooldown: Duration,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            failure_threshold,
            cooldown,
            probe_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, CircuitState::Open { .. })
    }

    /// Ask to issue a call
    ///
    /// `Err(retry_in)` means the call must not be attempted.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open { since } => {
                let elapsed = now.saturating_duration_since(since);
                if elapsed >= self.cooldown {
                    debug!("Circuit breaker transitioning to half-open");
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(self.cooldown - elapsed)
                }
            },
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    Err(self.cooldown)
                } else {
                    self.probe_in_flight = true;
                    Ok(())
                }
            },
        }
    }

    pub fn record_success(&mut self) {
        if self.state == CircuitState::HalfOpen {
            debug!("Circuit breaker closing after successful probe");
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.probe_in_flight = false;
    }

    /// Record a non-rate-limit failure; returns true if this call opened the circuit
    pub fn record_failure(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::HalfOpen => {
                warn!("Circuit breaker probe failed, reopening");
                self.state = CircuitState::Open { since: now };
                self.probe_in_flight = false;
                true
            },
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    warn!(
                        failures = self.consecutive_failures,
                        threshold = self.failure_threshold,
                        "Circuit breaker opening"
                    );
                    self.state = CircuitState::Open { since: now };
                    true
                } else {
                    false
                }
            },
            CircuitState::Open { .. } => false,
        }
    }

    /// A probe ended without a verdict (e.g. rate limited); let another probe through
    pub fn release_probe(&mut self) {
        self.probe_in_flight = false;
    }
}
