mod circuit_breaker;
mod retry;

pub use circuit_breaker::{
    BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitState,
};
pub use retry::{BackoffStrategy, RetryManager, RetryPolicy};
