//! Provider configuration and the circuit breaker state machine. Both are
//! storage-agnostic: this crate defines the
//! `Provider` record, its validation rules, the `ProviderRepository` and
//! `CircuitStore` traits, an in-memory circuit breaker manager, and the
//! file-backed repository implementation. The relational repository and
//! circuit-state backend live in `llmrelay-storage`, which depends on this
//! crate for the traits.

pub mod backend;
pub mod circuit;
pub mod provider;
pub mod repository;

pub use circuit::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitBreakerManager, CircuitState, CircuitStore};
pub use provider::{Provider, ProviderError, validate_providers};
pub use repository::{ProviderRepository, RepositoryError};
