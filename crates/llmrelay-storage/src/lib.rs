//! Relational backend for provider config, circuit state, and the request
//! log (components A/E/F persisted over `sea-orm`), plus the async log
//! pipeline that decouples request handling from disk writes.
//!
//! `llmrelay-provider` owns the `ProviderRepository`/`CircuitStore` traits;
//! this crate supplies the sql-backed implementations plus the
//! file-independent bits (schema, pipeline, cleanup) that only make sense
//! once a database is in the picture.

pub mod circuit_store;
pub mod db;
pub mod entities;
pub mod global_config;
pub mod pipeline;
pub mod provider_repo;

pub use circuit_store::SqlCircuitStore;
pub use db::{connect, sync_schema};
pub use entities::{BreakerStates, GlobalConfigs, Providers, RequestBodies, RequestLogs};
pub use global_config::{load_global_config, upsert_global_config};
pub use pipeline::{BodyRecord, LogPipeline, MetadataRecord, cleanup_older_than};
pub use provider_repo::SqlProviderRepository;
