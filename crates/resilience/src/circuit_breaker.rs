//! Circuit breaker for downstream protection.
//!
//! # States
//! - Closed: normal operation, calls pass through and outcomes are recorded
//! - Open: dependency assumed down, calls fail fast
//! - HalfOpen: cooldown elapsed, a single trial call is in flight
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure threshold crossed within the rolling window
//! Open → HalfOpen: after cooldown, on the next call
//! HalfOpen → Closed: trial call succeeds (window reset)
//! HalfOpen → Open: trial call fails (cooldown restarts)
//! ```
//!
//! The rolling window and state live behind one mutex per breaker, so a
//! transition is never observed half-applied.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CircuitOpenError, ResilienceError};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures needed to open the circuit (consecutive, or within the window)
    pub failure_threshold: u32,
    /// Number of most recent calls kept in the rolling window
    pub window_size: usize,
    /// Failure ratio over the window that opens the circuit
    pub failure_ratio: f64,
    /// Time the circuit stays open before admitting a trial call
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_size: 20,
            failure_ratio: 0.5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_window(mut self, window_size: usize, failure_ratio: f64) -> Self {
        self.window_size = window_size;
        self.failure_ratio = failure_ratio;
        self
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// `true` entries are failures.
    window: VecDeque<bool>,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

/// A named circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::closed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state as last recorded.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Force the breaker back to `Closed` with an empty window.
    pub fn reset(&self) {
        *self.inner.lock().unwrap() = BreakerState::closed();
    }

    /// Ask for permission to make one call.
    ///
    /// In `Open`, fails until the cooldown has elapsed; the first caller after
    /// that receives the single trial permit and the breaker moves to
    /// `HalfOpen`. Every other caller is rejected until the trial settles.
    pub fn try_acquire(&self) -> Result<Permit<'_>, CircuitOpenError> {
        let mut inner = self.inner.lock().unwrap();

        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed >= self.config.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(circuit = %self.name, "cooldown elapsed, admitting trial call");
                    Ok(Permit::new(self, true))
                } else {
                    Err(self.open_error(self.config.cooldown - elapsed))
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(self.open_error(Duration::ZERO))
                } else {
                    inner.trial_in_flight = true;
                    Ok(Permit::new(self, true))
                }
            }
        }
    }

    /// Run `op` through the breaker, counting every error as a failure.
    pub fn call<T, E, F>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.call_with(op, |_| true)
    }

    /// Run `op` through the breaker; errors for which `is_failure` returns
    /// `false` are recorded as successes (the dependency answered).
    pub fn call_with<T, E, F, P>(&self, op: F, is_failure: P) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        P: Fn(&E) -> bool,
    {
        let permit = self.try_acquire().map_err(ResilienceError::CircuitOpen)?;

        match op() {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                if is_failure(&err) {
                    permit.failure();
                } else {
                    permit.success();
                }
                Err(ResilienceError::Operation(err))
            }
        }
    }

    fn open_error(&self, retry_after: Duration) -> CircuitOpenError {
        CircuitOpenError {
            name: self.name.clone(),
            retry_after,
        }
    }

    fn record(&self, trial: bool, failed: bool) {
        let mut inner = self.inner.lock().unwrap();

        if trial {
            inner.trial_in_flight = false;
            if failed {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(circuit = %self.name, "trial call failed, circuit re-opened");
            } else {
                *inner = BreakerState::closed();
                info!(circuit = %self.name, "trial call succeeded, circuit closed");
            }
            return;
        }

        // Outcomes of calls admitted before the circuit opened are ignored.
        if inner.state != CircuitState::Closed {
            return;
        }

        if inner.window.len() >= self.config.window_size.max(1) {
            inner.window.pop_front();
        }
        inner.window.push_back(failed);

        if !failed {
            inner.consecutive_failures = 0;
            return;
        }

        inner.consecutive_failures += 1;
        let threshold = self.config.failure_threshold.max(1);
        let failures = inner.window.iter().filter(|f| **f).count();
        let ratio = failures as f64 / inner.window.len() as f64;

        let trip = inner.consecutive_failures >= threshold
            || (failures as u32 >= threshold && ratio >= self.config.failure_ratio);

        if trip {
            warn!(
                circuit = %self.name,
                failures,
                window = inner.window.len(),
                consecutive = inner.consecutive_failures,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "failure threshold crossed, circuit opened"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.window.clear();
            inner.consecutive_failures = 0;
        }
    }

    fn release_trial(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.trial_in_flight = false;
    }
}

/// Permission to make one call through a [`CircuitBreaker`].
///
/// Settle it with [`Permit::success`] or [`Permit::failure`]. Dropping an
/// unsettled trial permit frees the trial slot without changing state.
#[derive(Debug)]
#[must_use = "a permit must be settled with success() or failure()"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    /// Whether this is the single `HalfOpen` trial call.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record(self.trial, false);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record(self.trial, true);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

/// One breaker per key (e.g. per queue name), created on first use.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get (or lazily create) the breaker for `key`.
    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.clone())))
            .clone()
    }

    /// Snapshot of every known breaker's state.
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let breakers = self.breakers.lock().unwrap();
        let mut states: Vec<_> = breakers
            .iter()
            .map(|(key, breaker)| (key.clone(), breaker.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}
