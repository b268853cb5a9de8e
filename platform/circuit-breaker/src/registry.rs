use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::{BreakerTransition, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState};

/// Breakers keyed by dependency name, auto-registered on first use
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    events: broadcast::Sender<BreakerTransition>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            breakers: DashMap::new(),
            events,
        }
    }

    /// Breaker for `name`, creating it with the registry config if absent.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(
                    CircuitBreaker::new(name, self.config.clone()).with_events(self.events.clone()),
                )
            })
            .clone()
    }

    /// Existing breaker only.
    pub fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    /// Force `name` to Closed, registering it if needed.
    pub fn reset(&self, name: &str) -> CircuitBreakerState {
        let breaker = self.get(name);
        breaker.reset();
        breaker.snapshot()
    }

    /// Snapshots sorted by name
    pub fn snapshots(&self) -> Vec<CircuitBreakerState> {
        let mut all: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.events.subscribe()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
