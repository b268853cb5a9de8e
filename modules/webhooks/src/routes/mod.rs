pub mod breaker;
pub mod health;
pub mod metrics;
pub mod webhooks;
