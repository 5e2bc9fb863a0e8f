//! Cross-cutting types shared by every `llmrelay-*` crate: the merged
//! process configuration and the trace-id helper. Kept deliberately small —
//! anything that belongs to one component lives in that component's crate.

mod config;
mod trace;

pub use config::{GlobalConfig, GlobalConfigError, GlobalConfigPatch};
pub use trace::new_trace_id;
