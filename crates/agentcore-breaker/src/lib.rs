#![forbid(unsafe_code)]

//! Per-subsystem circuit breakers.
//!
//! A [`CircuitBreaker`] tracks failures in a rolling window and moves
//! through three states — `CLOSED` (calls pass through), `OPEN` (calls are
//! rejected immediately), `HALF_OPEN` (a limited number of probe calls are
//! allowed through to test recovery) — the way a breaker protecting an
//! unreliable downstream dependency does. [`CircuitBreakerRegistry`] owns
//! one breaker per named subsystem so callers never have to thread breaker
//! instances through unrelated code paths.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use agentcore_errors::CoreError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

/// A breaker's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Tunables for a single breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within `window_secs` required to trip the breaker.
    pub failure_threshold: u32,
    /// How long a tripped breaker stays `OPEN` before admitting probes.
    pub reset_timeout_secs: f64,
    /// Rolling window over which failures are counted.
    pub window_secs: f64,
    /// Concurrent probe calls admitted while `HALF_OPEN`, and the number of
    /// probe successes required to close the breaker again.
    pub half_open_limit: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 30.0,
            window_secs: 60.0,
            half_open_limit: 3,
        }
    }
}

/// A single observed state transition, kept for the registry's metrics
/// surface.
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// Point-in-time counters and transition history for one breaker.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BreakerMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub prevented_requests: u64,
    pub state_changes: Vec<StateChange>,
}

struct Inner {
    state: CircuitState,
    failure_timestamps: VecDeque<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    half_open_in_flight: u32,
    half_open_successes: u32,
    metrics: BreakerMetrics,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_timestamps: VecDeque::new(),
            opened_at: None,
            half_open_in_flight: 0,
            half_open_successes: 0,
            metrics: BreakerMetrics::default(),
        }
    }

    fn transition(&mut self, to: CircuitState, now: DateTime<Utc>) {
        if self.state == to {
            return;
        }
        self.metrics.state_changes.push(StateChange {
            from: self.state,
            to,
            at: now,
        });
        self.state = to;
    }

    fn prune_window(&mut self, now: DateTime<Utc>, window_secs: f64) {
        let cutoff = now - chrono::Duration::milliseconds((window_secs * 1000.0) as i64);
        while matches!(self.failure_timestamps.front(), Some(t) if *t < cutoff) {
            self.failure_timestamps.pop_front();
        }
    }
}

/// A named circuit breaker guarding one subsystem.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a call is currently permitted. `OPEN` transitions to
    /// `HALF_OPEN` once `reset_timeout_secs` has elapsed since it tripped.
    pub async fn allow(&self) -> bool {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| (now - t).num_milliseconds() as f64 / 1000.0)
                    .unwrap_or(f64::MAX);
                if elapsed >= self.config.reset_timeout_secs {
                    inner.transition(CircuitState::HalfOpen, now);
                    inner.half_open_in_flight = 1;
                    inner.half_open_successes = 0;
                    true
                } else {
                    inner.metrics.prevented_requests += 1;
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_limit {
                    inner.half_open_in_flight += 1;
                    true
                } else {
                    inner.metrics.prevented_requests += 1;
                    false
                }
            }
        }
    }

    /// Records a successful call. In `HALF_OPEN`, the breaker closes once
    /// `half_open_limit` probes have succeeded.
    pub async fn record_success(&self) {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.metrics.total_requests += 1;
        inner.metrics.successful_requests += 1;
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.half_open_limit {
                inner.transition(CircuitState::Closed, now);
                inner.failure_timestamps.clear();
                inner.opened_at = None;
                inner.half_open_in_flight = 0;
                inner.half_open_successes = 0;
            }
        }
    }

    /// Records a failed call, tripping the breaker if the rolling-window
    /// failure count reaches `failure_threshold`, or immediately re-opening
    /// it if the failure happened during a `HALF_OPEN` probe.
    pub async fn record_failure(&self) {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.metrics.total_requests += 1;
        inner.metrics.failed_requests += 1;

        if inner.state == CircuitState::HalfOpen {
            inner.transition(CircuitState::Open, now);
            inner.opened_at = Some(now);
            inner.half_open_in_flight = 0;
            inner.half_open_successes = 0;
            return;
        }

        inner.failure_timestamps.push_back(now);
        inner.prune_window(now, self.config.window_secs);
        if inner.failure_timestamps.len() as u32 >= self.config.failure_threshold {
            inner.transition(CircuitState::Open, now);
            inner.opened_at = Some(now);
            tracing::warn!(breaker = %self.name, "circuit breaker opened");
        }
    }

    /// Runs `op` if the breaker currently admits calls, recording the
    /// outcome. Rejects without running `op` otherwise.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        if !self.allow().await {
            let retry_after = self.retry_after_secs().await;
            return Err(CoreError::circuit_open(self.name.clone(), retry_after));
        }
        match op().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(err) => {
                self.record_failure().await;
                Err(err)
            }
        }
    }

    async fn retry_after_secs(&self) -> f64 {
        let inner = self.inner.lock().await;
        match inner.opened_at {
            Some(opened_at) => {
                let elapsed = (Utc::now() - opened_at).num_milliseconds() as f64 / 1000.0;
                (self.config.reset_timeout_secs - elapsed).max(0.0)
            }
            None => 0.0,
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn metrics(&self) -> BreakerMetrics {
        self.inner.lock().await.metrics.clone()
    }

    /// Forces the breaker back to `CLOSED`, clearing failure history. Used
    /// by the admin `reset_all_breakers` surface.
    pub async fn reset(&self) {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.transition(CircuitState::Closed, now);
        inner.failure_timestamps.clear();
        inner.opened_at = None;
        inner.half_open_in_flight = 0;
        inner.half_open_successes = 0;
    }
}

/// Owns one [`CircuitBreaker`] per named subsystem, created lazily on first
/// use. Deliberately an instance a caller constructs and holds (not a
/// process-global singleton): tests and multiple coordination cores running
/// in one process should not share breaker state.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the breaker for `name`, creating it with `config` the first
    /// time it's requested. `config` is ignored on subsequent calls.
    pub async fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().await;
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().await.get(name).cloned()
    }

    /// Admin surface: resets every known breaker to `CLOSED`.
    pub async fn reset_all(&self) {
        let breakers: Vec<_> = self.breakers.lock().await.values().cloned().collect();
        for breaker in breakers {
            breaker.reset().await;
        }
    }

    /// Admin surface: a metrics snapshot per breaker name.
    pub async fn metrics(&self) -> HashMap<String, BreakerMetrics> {
        let breakers = self.breakers.lock().await;
        let mut out = HashMap::with_capacity(breakers.len());
        for (name, breaker) in breakers.iter() {
            out.insert(name.clone(), breaker.metrics().await);
        }
        out
    }
}

/// A breaker that only counts a subset of errors as failures.
///
/// Plain [`CircuitBreaker::execute`] treats every `Err` as a failure; that's
/// wrong when the wrapped operation can fail for reasons the breaker
/// shouldn't react to (a caller-side validation error isn't evidence the
/// downstream dependency is unhealthy). `SelectiveCircuitBreaker` takes a
/// classifier deciding which errors count.
pub struct SelectiveCircuitBreaker<C> {
    breaker: Arc<CircuitBreaker>,
    is_tripping_failure: C,
}

impl<C> SelectiveCircuitBreaker<C>
where
    C: Fn(&CoreError) -> bool,
{
    pub fn new(breaker: Arc<CircuitBreaker>, is_tripping_failure: C) -> Self {
        Self {
            breaker,
            is_tripping_failure,
        }
    }

    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        if !self.breaker.allow().await {
            let retry_after = self.breaker.retry_after_secs().await;
            return Err(CoreError::circuit_open(
                self.breaker.name.clone(),
                retry_after,
            ));
        }
        match op().await {
            Ok(value) => {
                self.breaker.record_success().await;
                Ok(value)
            }
            Err(err) => {
                if (self.is_tripping_failure)(&err) {
                    self.breaker.record_failure().await;
                }
                // A non-matching error propagates without touching the breaker.
                Err(err)
            }
        }
    }
}
