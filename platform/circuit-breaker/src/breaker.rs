use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::HalfOpen,
            2 => Self::Open,
            _ => Self::Closed,
        }
    }

    /// Gauge encoding: 0 closed, 1 half-open, 2 open
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed before tripping to Open
    pub failure_threshold: u32,
    /// Consecutive successes in HalfOpen before closing
    pub success_threshold: u32,
    /// Time spent Open before trials are allowed
    pub reset_timeout: Duration,
    /// Concurrent trial calls admitted while HalfOpen
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_transition_at: DateTime<Utc>,
}

/// Emitted on every state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerTransition {
    pub name: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct Counters {
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_transition_at: DateTime<Utc>,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    origin: Instant,
    state: AtomicU8,
    // millis since `origin` of the last transition
    last_transition_ms: AtomicU64,
    half_open_calls: AtomicU32,
    counters: Mutex<Counters>,
    events: Option<broadcast::Sender<BreakerTransition>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            origin: Instant::now(),
            state: AtomicU8::new(CircuitState::Closed.as_u8()),
            last_transition_ms: AtomicU64::new(0),
            half_open_calls: AtomicU32::new(0),
            counters: Mutex::new(Counters {
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_transition_at: Utc::now(),
            }),
            events: None,
        }
    }

    /// Attach a channel that receives every transition.
    pub fn with_events(mut self, events: broadcast::Sender<BreakerTransition>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state without triggering the lazy Open -> HalfOpen move.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether a call may proceed.
    pub fn can_execute(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.since_last_transition() < self.config.reset_timeout {
                    return false;
                }
                {
                    let mut counters = self.lock();
                    // re-check: another caller may have moved it already
                    if self.state() == CircuitState::Open
                        && self.since_last_transition() >= self.config.reset_timeout
                    {
                        self.transition(&mut counters, CircuitState::HalfOpen);
                    }
                }
                self.state() == CircuitState::HalfOpen && self.try_acquire_trial()
            }
            CircuitState::HalfOpen => self.try_acquire_trial(),
        }
    }

    pub fn record_success(&self) {
        let mut counters = self.lock();
        match self.state() {
            CircuitState::Closed => {
                counters.consecutive_failures = 0;
                counters.consecutive_successes = counters.consecutive_successes.saturating_add(1);
            }
            CircuitState::HalfOpen => {
                self.release_trial();
                counters.consecutive_failures = 0;
                counters.consecutive_successes += 1;
                debug!(
                    breaker = %self.name,
                    successes = counters.consecutive_successes,
                    threshold = self.config.success_threshold,
                    "Half-open trial succeeded"
                );
                if counters.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut counters, CircuitState::Closed);
                }
            }
            // late result of a call admitted before the breaker opened
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut counters = self.lock();
        counters.consecutive_successes = 0;
        counters.consecutive_failures = counters.consecutive_failures.saturating_add(1);
        match self.state() {
            CircuitState::Closed => {
                if counters.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut counters, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.release_trial();
                self.transition(&mut counters, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Manual override: force Closed regardless of counters.
    pub fn reset(&self) {
        let mut counters = self.lock();
        if self.state() != CircuitState::Closed {
            self.transition(&mut counters, CircuitState::Closed);
        }
        counters.consecutive_failures = 0;
        counters.consecutive_successes = 0;
        info!(breaker = %self.name, "Circuit breaker manually reset");
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let counters = self.lock();
        CircuitBreakerState {
            name: self.name.clone(),
            state: self.state(),
            consecutive_failures: counters.consecutive_failures,
            consecutive_successes: counters.consecutive_successes,
            last_transition_at: counters.last_transition_at,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn since_last_transition(&self) -> Duration {
        let now_ms = self.origin.elapsed().as_millis() as u64;
        let last = self.last_transition_ms.load(Ordering::Acquire);
        Duration::from_millis(now_ms.saturating_sub(last))
    }

    fn try_acquire_trial(&self) -> bool {
        let max = self.config.half_open_max_calls.max(1);
        self.half_open_calls
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    fn release_trial(&self) {
        let _ = self
            .half_open_calls
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }

    /// Caller holds the counters lock.
    fn transition(&self, counters: &mut Counters, to: CircuitState) {
        let from = self.state();
        if from == to {
            return;
        }

        match to {
            CircuitState::Open => counters.consecutive_successes = 0,
            CircuitState::HalfOpen => {
                counters.consecutive_successes = 0;
                self.half_open_calls.store(0, Ordering::Release);
            }
            CircuitState::Closed => {
                counters.consecutive_failures = 0;
                counters.consecutive_successes = 0;
                self.half_open_calls.store(0, Ordering::Release);
            }
        }

        let at = Utc::now();
        counters.last_transition_at = at;
        self.last_transition_ms
            .store(self.origin.elapsed().as_millis() as u64, Ordering::Release);
        self.state.store(to.as_u8(), Ordering::Release);

        match to {
            CircuitState::Open => warn!(breaker = %self.name, %from, "Circuit breaker opened"),
            _ => info!(breaker = %self.name, %from, %to, "Circuit breaker transition"),
        }

        if let Some(events) = &self.events {
            // no receivers is fine
            let _ = events.send(BreakerTransition {
                name: self.name.clone(),
                from,
                to,
                at,
            });
        }
    }
}
