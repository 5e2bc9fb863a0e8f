use std::sync::Arc;

use llmrelay_core::upstream::WreqUpstreamClient;
use llmrelay_core::Dispatcher;
use llmrelay_provider::{CircuitBreakerManager, ProviderRepository};
use llmrelay_protocol::Platform;
use sea_orm::DatabaseConnection;
use time::OffsetDateTime;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher<WreqUpstreamClient>>,
    pub repository: Arc<dyn ProviderRepository>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub db: DatabaseConnection,
    pub started_at: OffsetDateTime,
    pub version: &'static str,
}

impl AppState {
    /// Whether at least one enabled provider exists across every platform —
    /// `GET /readiness`'s one boolean.
    pub async fn has_any_enabled_provider(&self) -> bool {
        for platform in [Platform::Claude, Platform::Codex, Platform::GeminiCli, Platform::Picoclaw] {
            match self.repository.load(platform).await {
                Ok(providers) => {
                    if providers.iter().any(|p| p.enabled) {
                        return true;
                    }
                }
                Err(err) => {
                    tracing::warn!(platform = platform.as_str(), error = %err, "readiness check failed to load providers");
                }
            }
        }
        false
    }

    /// Per-platform enabled-provider counts for `GET /metrics`.
    pub async fn enabled_counts_by_platform(&self) -> Vec<(Platform, usize)> {
        let mut counts = Vec::new();
        for platform in [Platform::Claude, Platform::Codex, Platform::GeminiCli, Platform::Picoclaw] {
            let enabled = self.repository.load(platform).await.map(|ps| ps.iter().filter(|p| p.enabled).count()).unwrap_or(0);
            counts.push((platform, enabled));
        }
        counts
    }
}
