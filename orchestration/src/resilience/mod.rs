//! Failure isolation for external dependencies.
//!
//! Every call to a language model, context store or agent goes through a
//! named [`CircuitBreaker`]. Breakers are owned by a
//! [`CircuitBreakerManager`] built at startup and shared by reference.
//!
//! Callers match on [`CircuitError`] to tell a rejected call (the circuit
//! is open) from a dependency that ran and failed.

pub mod circuit_breaker;
pub mod manager;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitSnapshot, CircuitState,
};
pub use manager::{CircuitBreakerManager, SharedBreakers};
