//! Circuit breaker for the completion dependency.
//!
//! The breaker counts consecutive failures. When they reach the configured
//! threshold the circuit *opens* and callers are turned away. After a
//! cooldown the next [`CircuitBreaker::is_open`] call moves the circuit to
//! *half-open* and lets exactly that caller through as a probe; the probe's
//! outcome closes or re-opens the circuit.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy: requests allowed.
    Closed,
    /// Tripped: requests blocked until cooldown expires.
    Open,
    /// Cooldown expired: one probe request in flight.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Failure-counting guard.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    probe_started: Option<Instant>,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Time after the last failure before Open → HalfOpen.
    pub cooldown: Duration,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            probe_started: None,
            failure_threshold,
            cooldown,
        }
    }

    /// Whether callers must be turned away.
    ///
    /// Not a pure query: once the cooldown has elapsed on an open circuit this
    /// call moves it to half-open and returns `false`, admitting the caller as
    /// the single recovery probe. Further calls return `true` until the probe
    /// reports back, or until another cooldown passes without an outcome.
    pub fn is_open(&mut self) -> bool {
        let now = Instant::now();
        match self.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled = self
                    .last_failure
                    .is_none_or(|at| now.duration_since(at) >= self.cooldown);
                if cooled {
                    self.state = CircuitState::HalfOpen;
                    self.probe_started = Some(now);
                    info!(
                        failures = self.consecutive_failures,
                        "Circuit half-open, admitting probe"
                    );
                    false
                } else {
                    true
                }
            }
            CircuitState::HalfOpen => {
                let stale = self
                    .probe_started
                    .is_none_or(|at| now.duration_since(at) >= self.cooldown);
                if stale {
                    self.probe_started = Some(now);
                    warn!("Probe never reported an outcome, admitting another");
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Record a success: resets the failure count and closes the circuit.
    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            info!(previous = %self.state, "Circuit closed");
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.last_failure = None;
        self.probe_started = None;
    }

    /// Record a failure: may trip the circuit to Open.
    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(Instant::now());

        let trip = match self.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.consecutive_failures >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            warn!(
                failures = self.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Circuit opened"
            );
            self.state = CircuitState::Open;
            self.probe_started = None;
        }
    }

    /// Current state without performing any transition.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Consecutive failures recorded since the last success.
    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(120))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_starts_closed() {
        let mut cb = CircuitBreaker::default();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!cb.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_threshold() {
        let mut cb = CircuitBreaker::new(3, Duration::from_secs(120));
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.is_open());
        cb.record_failure();
        assert!(cb.is_open());
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.failure_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_circuit() {
        let mut cb = CircuitBreaker::new(2, Duration::from_secs(120));
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        // Count restarted, so one failure is not enough.
        assert!(!cb.is_open());
        cb.record_failure();
        assert!(cb.is_open());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!cb.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_probe() {
        let mut cb = CircuitBreaker::new(3, Duration::from_secs(120));
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(119)).await;
        assert!(cb.is_open());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!cb.is_open(), "first call after cooldown is the probe");
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.is_open(), "second caller waits for the probe");
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_success_closes() {
        let mut cb = CircuitBreaker::new(1, Duration::from_secs(10));
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!cb.is_open());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens() {
        let mut cb = CircuitBreaker::new(3, Duration::from_secs(10));
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!cb.is_open());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_probe_is_replaced_after_cooldown() {
        let mut cb = CircuitBreaker::new(1, Duration::from_secs(10));
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!cb.is_open());
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cb.is_open());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!cb.is_open());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
        assert_eq!(
            serde_json::to_string(&CircuitState::Open).unwrap(),
            "\"open\""
        );
    }
}
