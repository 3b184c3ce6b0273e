//! Consecutive-failure circuit breaker with a single half-open probe.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use catalogsync_shared::BreakerConfig;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

/// What the breaker allows for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed circuit: call normally.
    Allowed,
    /// The single half-open probe. Its outcome closes or reopens the circuit.
    Probe,
    /// Fail fast without touching the transport.
    Rejected,
}

#[derive(Debug)]
enum Inner {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner::Closed { failures: 0 }),
        }
    }

    pub fn from_config(config: &BreakerConfig) -> Self {
        Self::new(config.failure_threshold, config.recovery_timeout())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> BreakerState {
        match *self.lock() {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen => BreakerState::HalfOpen,
        }
    }

    /// Consecutive failures recorded while closed.
    pub fn failures(&self) -> u32 {
        match *self.lock() {
            Inner::Closed { failures } => failures,
            _ => self.failure_threshold,
        }
    }

    /// `true` when the circuit is open and its cooldown has elapsed.
    pub fn probe_ready(&self) -> bool {
        matches!(*self.lock(), Inner::Open { since } if since.elapsed() >= self.cooldown)
    }

    /// Decide whether a call may proceed. An open circuit past its cooldown
    /// moves to half-open and admits exactly one probe.
    pub fn admit(&self) -> Admission {
        let mut inner = self.lock();
        match *inner {
            Inner::Closed { .. } => Admission::Allowed,
            Inner::Open { since } if since.elapsed() >= self.cooldown => {
                *inner = Inner::HalfOpen;
                tracing::info!("circuit half-open, admitting probe");
                Admission::Probe
            }
            Inner::Open { .. } | Inner::HalfOpen => Admission::Rejected,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if matches!(*inner, Inner::HalfOpen) {
            tracing::info!("probe succeeded, circuit closed");
        }
        *inner = Inner::Closed { failures: 0 };
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match *inner {
            Inner::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.failure_threshold {
                    tracing::warn!(failures, "failure threshold reached, circuit open");
                    *inner = Inner::Open {
                        since: Instant::now(),
                    };
                } else {
                    *inner = Inner::Closed { failures };
                }
            }
            Inner::HalfOpen => {
                tracing::warn!("probe failed, circuit reopened");
                *inner = Inner::Open {
                    since: Instant::now(),
                };
            }
            // Already open: keep the original timestamp so the cooldown runs out.
            Inner::Open { .. } => {}
        }
    }
}
