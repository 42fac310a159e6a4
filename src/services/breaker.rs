use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::BreakerConfig;
use crate::metrics;

/// Circuit state for one named provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Three-state breaker: CLOSED passes traffic and counts consecutive
/// failures; OPEN fails fast until the cooldown elapses; HALF_OPEN lets a
/// single serialized probe through and needs `success_threshold` consecutive
/// successes to close.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> CircuitBreaker {
        CircuitBreaker {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.config.cooldown_ms)
    }

    /// Whether a request may go out right now. In HALF_OPEN only one probe
    /// is allowed at a time; callers that get `true` must report the outcome
    /// via `on_success`/`on_failure`.
    pub fn try_acquire(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.cooldown() {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_successes = 0;
                    self.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful call. Returns the new state.
    pub fn on_success(&mut self) -> CircuitState {
        self.probe_in_flight = false;
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.success_threshold {
                    self.state = CircuitState::Closed;
                    self.consecutive_failures = 0;
                    self.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
        self.state
    }

    /// Record a failed call. Returns the new state.
    pub fn on_failure(&mut self) -> CircuitState {
        self.probe_in_flight = false;
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {}
        }
        self.state
    }
}

/// Process-local registry of breakers keyed by adapter name. Deliberately
/// not replicated across workers; each process learns a provider's health on
/// its own. Built once and passed explicitly to the delivery workers.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> BreakerRegistry {
        BreakerRegistry {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn with_breaker<T>(&self, name: &str, f: impl FnOnce(&mut CircuitBreaker) -> T) -> T {
        let mut map = match self.breakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let breaker = map
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config.clone()));
        f(breaker)
    }

    /// Whether a call to `name` may proceed; false means fail fast.
    pub fn try_acquire(&self, name: &str) -> bool {
        self.with_breaker(name, |b| b.try_acquire())
    }

    pub fn record_success(&self, name: &str) {
        let state = self.with_breaker(name, |b| {
            let before = b.state();
            let after = b.on_success();
            (before, after)
        });
        if state.0 != state.1 {
            metrics::breaker_transition(name, state.1.as_str());
            tracing::info!(provider = name, state = state.1.as_str(), "Circuit closed");
        }
    }

    pub fn record_failure(&self, name: &str) {
        let state = self.with_breaker(name, |b| {
            let before = b.state();
            let after = b.on_failure();
            (before, after)
        });
        if state.0 != state.1 {
            metrics::breaker_transition(name, state.1.as_str());
            tracing::warn!(provider = name, state = state.1.as_str(), "Circuit opened");
        }
    }

    pub fn state(&self, name: &str) -> CircuitState {
        self.with_breaker(name, |b| b.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(cooldown_ms: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 5,
            cooldown_ms,
            success_threshold: 2,
        }
    }

    #[test]
    fn opens_after_exactly_threshold_failures() {
        let mut b = CircuitBreaker::new(config(30_000));
        for _ in 0..4 {
            assert!(b.try_acquire());
            b.on_failure();
            assert_eq!(b.state(), CircuitState::Closed);
        }
        assert!(b.try_acquire());
        assert_eq!(b.on_failure(), CircuitState::Open);
        assert!(!b.try_acquire(), "open circuit fails fast");
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let mut b = CircuitBreaker::new(config(30_000));
        for _ in 0..4 {
            b.try_acquire();
            b.on_failure();
        }
        b.try_acquire();
        b.on_success();
        for _ in 0..4 {
            b.try_acquire();
            b.on_failure();
        }
        assert_eq!(b.state(), CircuitState::Closed, "streak restarted after success");
    }

    #[test]
    fn half_open_after_cooldown_with_serialized_probe() {
        let mut b = CircuitBreaker::new(config(10));
        for _ in 0..5 {
            b.try_acquire();
            b.on_failure();
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.try_acquire());

        std::thread::sleep(Duration::from_millis(20));
        assert!(b.try_acquire(), "cooldown elapsed, probe allowed");
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(!b.try_acquire(), "second probe blocked while one is in flight");

        b.on_success();
        assert_eq!(b.state(), CircuitState::HalfOpen, "one success is not enough");
        assert!(b.try_acquire());
        assert_eq!(b.on_success(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let mut b = CircuitBreaker::new(config(10));
        for _ in 0..5 {
            b.try_acquire();
            b.on_failure();
        }
        std::thread::sleep(Duration::from_millis(20));
        assert!(b.try_acquire());
        assert_eq!(b.on_failure(), CircuitState::Open);
        assert!(!b.try_acquire(), "back to fail-fast immediately");
    }

    #[test]
    fn registry_isolates_providers() {
        let registry = BreakerRegistry::new(config(30_000));
        for _ in 0..5 {
            registry.try_acquire("email.primary");
            registry.record_failure("email.primary");
        }
        assert_eq!(registry.state("email.primary"), CircuitState::Open);
        assert!(!registry.try_acquire("email.primary"));
        assert!(registry.try_acquire("sms.primary"), "independent per provider");
    }
}
