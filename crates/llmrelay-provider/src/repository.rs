//! The storage-agnostic contract both provider backends honor.

use async_trait::async_trait;
use llmrelay_protocol::Platform;

use crate::provider::{Provider, ProviderError};

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Validation(#[from] ProviderError),
    #[error("provider not found: {0}")]
    NotFound(i64),
    #[error("backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait ProviderRepository: Send + Sync {
    /// Ordered by `priorityLevel` ascending, ties broken by `id` ascending.
    async fn load(&self, platform: Platform) -> Result<Vec<Provider>, RepositoryError>;

    /// Validates the whole incoming set against what's currently stored,
    /// then replaces it atomically.
    async fn save(&self, platform: Platform, providers: Vec<Provider>) -> Result<Vec<String>, RepositoryError>;

    async fn add(&self, provider: Provider) -> Result<Provider, RepositoryError>;

    async fn update(&self, provider: Provider) -> Result<Provider, RepositoryError>;

    async fn delete(&self, platform: Platform, id: i64) -> Result<(), RepositoryError>;
}
