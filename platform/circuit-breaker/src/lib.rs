//! # Circuit Breaker
//!
//! One failure/success state machine per upstream dependency (payment
//! provider, notification gateway, ...).
//!
//! ## States
//!
//! - **Closed**: calls allowed; `failure_threshold` consecutive failures trip to Open
//! - **Open**: calls rejected until `reset_timeout` has elapsed since the last
//!   transition; the move to HalfOpen happens on the next `can_execute` check
//! - **HalfOpen**: a bounded number of trial calls; `success_threshold`
//!   consecutive successes close the breaker, any failure re-opens it
//!
//! `can_execute` is lock-free on the hot path. Counter mutation is serialized
//! behind a mutex. Every transition is broadcast as a [`BreakerTransition`].
//!
//! ```rust
//! use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
//!
//! let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
//! let breaker = registry.get("paystack");
//! for _ in 0..5 {
//!     breaker.record_failure();
//! }
//! assert_eq!(breaker.state(), CircuitState::Open);
//! assert!(!breaker.can_execute());
//! ```

mod breaker;
mod registry;

pub use breaker::{
    BreakerTransition, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitState,
};
pub use registry::CircuitBreakerRegistry;
