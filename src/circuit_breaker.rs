//! Circuit Breaker
//!
//! Generic protective wrapper around calls to an external dependency.
//! It knows nothing about withdrawals: any `async` operation returning
//! `Result<T, E>` can be executed through it.
//!
//! # State Machine
//!
//! ```text
//!            failures >= failure_threshold (within interval)
//!   CLOSED ─────────────────────────────────────────────▶ OPEN
//!     ▲                                                   │  ▲
//!     │ successes >= success_threshold       timeout      │  │ any failure
//!     │                                      elapsed      ▼  │
//!     └──────────────────────────────────────────────── HALF_OPEN
//!                                     (at most max_requests trial calls)
//! ```
//!
//! One instance is shared (via `Arc`) by every caller of a dependency, so all
//! saga workers observe the same state. Counters live behind a mutex that is
//! never held across an `.await`.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Calls pass through, failures are counted
    Closed,
    /// Limited trial calls decide whether the dependency recovered
    HalfOpen,
    /// Calls fail fast without touching the dependency
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::HalfOpen => "HALF_OPEN",
            CircuitState::Open => "OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Maximum trial requests allowed while HALF_OPEN
    pub max_requests: u32,
    /// Rolling window for CLOSED-state counters (zero = never reset)
    #[serde(with = "secs")]
    pub interval: Duration,
    /// How long the breaker stays OPEN before allowing trials
    #[serde(with = "secs")]
    pub timeout: Duration,
    /// Failures within `interval` that trip the breaker
    pub failure_threshold: u32,
    /// Successful trials needed to close again (capped at `max_requests`)
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_requests: 3,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            failure_threshold: 5,
            success_threshold: 2,
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Request/outcome counters for the current generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }
}

/// Hook invoked on every state transition
pub trait StateObserver: Send + Sync {
    fn on_state_change(&self, name: &str, from: CircuitState, to: CircuitState);
}

/// Default observer: logs every transition
pub struct LoggingObserver;

impl StateObserver for LoggingObserver {
    fn on_state_change(&self, name: &str, from: CircuitState, to: CircuitState) {
        warn!(breaker = name, from = %from, to = %to, "Circuit breaker state changed");
    }
}

/// Error returned by [`CircuitBreaker::execute`]
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker '{0}' is open")]
    Open(String),

    #[error("circuit breaker '{0}' rejected call: too many half-open requests")]
    TooManyRequests(String),

    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// True when the wrapped function was never invoked
    pub fn is_rejected(&self) -> bool {
        !matches!(self, BreakerError::Inner(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    /// CLOSED: end of the rolling window. OPEN: when trials may begin.
    expiry: Option<Instant>,
    opened_at: Option<Instant>,
}

/// Generic circuit breaker
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    observer: Option<Arc<dyn StateObserver>>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let now = Instant::now();
        let expiry = window_end(now, config.interval);
        Self {
            name: name.into(),
            config,
            observer: None,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
                opened_at: None,
            }),
        }
    }

    /// Attach a state-change observer
    pub fn with_observer(mut self, observer: Arc<dyn StateObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state (advances OPEN → HALF_OPEN if the timeout elapsed)
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.current_state(&mut inner, Instant::now());
        inner.state
    }

    /// Counters of the current generation
    pub fn counts(&self) -> Counts {
        let mut inner = self.lock();
        self.current_state(&mut inner, Instant::now());
        inner.counts
    }

    /// Instant the breaker last tripped
    pub fn opened_at(&self) -> Option<Instant> {
        self.lock().opened_at
    }

    /// Run `f` through the breaker
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let generation = self.before_request()?;
        let result = f().await;
        self.after_request(generation, result.is_ok());
        result.map_err(BreakerError::Inner)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn before_request<E>(&self) -> Result<u64, BreakerError<E>> {
        let mut inner = self.lock();
        let now = Instant::now();
        self.current_state(&mut inner, now);

        match inner.state {
            CircuitState::Open => {
                debug!(breaker = %self.name, "Call rejected (open)");
                Err(BreakerError::Open(self.name.clone()))
            }
            CircuitState::HalfOpen if inner.counts.requests >= self.config.max_requests => {
                debug!(breaker = %self.name, "Call rejected (half-open quota used)");
                Err(BreakerError::TooManyRequests(self.name.clone()))
            }
            _ => {
                inner.counts.on_request();
                Ok(inner.generation)
            }
        }
    }

    fn after_request(&self, before: u64, success: bool) {
        let mut inner = self.lock();
        let now = Instant::now();
        self.current_state(&mut inner, now);

        // Outcome belongs to an earlier generation; ignore it
        if inner.generation != before {
            return;
        }

        if success {
            self.on_success(&mut inner, now);
        } else {
            self.on_failure(&mut inner, now);
        }
    }

    fn on_success(&self, inner: &mut BreakerInner, now: Instant) {
        match inner.state {
            CircuitState::Closed => inner.counts.on_success(),
            CircuitState::HalfOpen => {
                inner.counts.on_success();
                let needed = self
                    .config
                    .success_threshold
                    .min(self.config.max_requests)
                    .max(1);
                if inner.counts.consecutive_successes >= needed {
                    self.set_state(inner, CircuitState::Closed, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut BreakerInner, now: Instant) {
        match inner.state {
            CircuitState::Closed => {
                inner.counts.on_failure();
                if inner.counts.total_failures >= self.config.failure_threshold.max(1) {
                    self.set_state(inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => self.set_state(inner, CircuitState::Open, now),
            CircuitState::Open => {}
        }
    }

    /// Apply time-based transitions: window rollover and OPEN timeout
    fn current_state(&self, inner: &mut BreakerInner, now: Instant) {
        match inner.state {
            CircuitState::Closed => {
                if let Some(expiry) = inner.expiry
                    && expiry <= now
                {
                    self.new_generation(inner, now);
                }
            }
            CircuitState::Open => {
                if let Some(expiry) = inner.expiry
                    && expiry <= now
                {
                    self.set_state(inner, CircuitState::HalfOpen, now);
                }
            }
            CircuitState::HalfOpen => {}
        }
    }

    fn set_state(&self, inner: &mut BreakerInner, state: CircuitState, now: Instant) {
        if inner.state == state {
            return;
        }

        let prev = inner.state;
        inner.state = state;
        if state == CircuitState::Open {
            inner.opened_at = Some(now);
        }
        self.new_generation(inner, now);

        if let Some(observer) = &self.observer {
            observer.on_state_change(&self.name, prev, state);
        }
    }

    fn new_generation(&self, inner: &mut BreakerInner, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            CircuitState::Closed => window_end(now, self.config.interval),
            CircuitState::Open => Some(now + self.config.timeout),
            CircuitState::HalfOpen => None,
        };
    }
}

fn window_end(now: Instant, interval: Duration) -> Option<Instant> {
    if interval.is_zero() {
        None
    } else {
        Some(now + interval)
    }
}
