pub mod backend;
pub mod circuit_breaker;
pub mod manager;

pub use backend::{SamplingBackend, SamplingRequest, SamplingResponse};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use manager::{AiHealth, AiManager, AiManagerConfig, BackendHealth};
