//! File-per-platform provider repository: an alternative to the relational
//! backend, used in tests and by operators who don't want a database. One
//! JSON array per platform under `data_dir`, e.g. `providers_claude.json`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use llmrelay_protocol::Platform;
use tokio::sync::Mutex;

use crate::provider::{Provider, validate_providers};
use crate::repository::{ProviderRepository, RepositoryError};

pub struct FileProviderRepository {
    data_dir: PathBuf,
    /// Guards the whole id-allocation-and-write sequence; ids must stay
    /// unique across all platforms' files, so allocation can't be sharded
    /// per-platform the way reads can.
    next_id: Arc<Mutex<i64>>,
}

impl FileProviderRepository {
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|e| RepositoryError::Backend(format!("create data dir: {e}")))?;

        let mut max_id = 0i64;
        for platform in [Platform::Claude, Platform::Codex, Platform::GeminiCli, Platform::Picoclaw] {
            let providers = read_platform(&data_dir, platform).await?;
            max_id = max_id.max(providers.iter().map(|p| p.id).max().unwrap_or(0));
        }

        Ok(Self { data_dir, next_id: Arc::new(Mutex::new(max_id + 1)) })
    }

    fn path_for(&self, platform: Platform) -> PathBuf {
        self.data_dir.join(format!("providers_{}.json", platform.as_str()))
    }
}

async fn read_platform(data_dir: &std::path::Path, platform: Platform) -> Result<Vec<Provider>, RepositoryError> {
    let path = data_dir.join(format!("providers_{}.json", platform.as_str()));
    match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| RepositoryError::Backend(format!("parse {path:?}: {e}"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(RepositoryError::Backend(format!("read {path:?}: {e}"))),
    }
}

async fn write_platform(path: &std::path::Path, providers: &[Provider]) -> Result<(), RepositoryError> {
    let contents = serde_json::to_vec_pretty(providers).map_err(|e| RepositoryError::Backend(e.to_string()))?;
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, &contents).await.map_err(|e| RepositoryError::Backend(format!("write {tmp_path:?}: {e}")))?;
    tokio::fs::rename(&tmp_path, path).await.map_err(|e| RepositoryError::Backend(format!("rename into {path:?}: {e}")))?;
    Ok(())
}

fn sort_by_priority_then_id(providers: &mut [Provider]) {
    providers.sort_by(|a, b| a.effective_priority().cmp(&b.effective_priority()).then(a.id.cmp(&b.id)));
}

#[async_trait]
impl ProviderRepository for FileProviderRepository {
    async fn load(&self, platform: Platform) -> Result<Vec<Provider>, RepositoryError> {
        let mut providers = read_platform(&self.data_dir, platform).await?;
        sort_by_priority_then_id(&mut providers);
        Ok(providers)
    }

    async fn save(&self, platform: Platform, providers: Vec<Provider>) -> Result<Vec<String>, RepositoryError> {
        let existing = read_platform(&self.data_dir, platform).await?;
        let warnings = validate_providers(&existing, &providers)?;
        let mut providers = providers;
        sort_by_priority_then_id(&mut providers);
        write_platform(&self.path_for(platform), &providers).await?;
        Ok(warnings)
    }

    async fn add(&self, mut provider: Provider) -> Result<Provider, RepositoryError> {
        let mut next_id = self.next_id.lock().await;
        let mut existing = read_platform(&self.data_dir, provider.platform).await?;
        provider.id = *next_id;
        let mut incoming = existing.clone();
        incoming.push(provider.clone());
        validate_providers(&existing, &incoming)?;
        *next_id += 1;

        existing.push(provider.clone());
        sort_by_priority_then_id(&mut existing);
        write_platform(&self.path_for(provider.platform), &existing).await?;
        Ok(provider)
    }

    async fn update(&self, provider: Provider) -> Result<Provider, RepositoryError> {
        let mut existing = read_platform(&self.data_dir, provider.platform).await?;
        let Some(slot) = existing.iter_mut().find(|p| p.id == provider.id) else {
            return Err(RepositoryError::NotFound(provider.id));
        };
        if slot.name != provider.name {
            return Err(RepositoryError::Validation(crate::provider::ProviderError::NameNotMutable));
        }
        *slot = provider.clone();
        validate_providers(&[], &existing)?;
        sort_by_priority_then_id(&mut existing);
        write_platform(&self.path_for(provider.platform), &existing).await?;
        Ok(provider)
    }

    async fn delete(&self, platform: Platform, id: i64) -> Result<(), RepositoryError> {
        let mut existing = read_platform(&self.data_dir, platform).await?;
        let before = existing.len();
        existing.retain(|p| p.id != id);
        if existing.len() == before {
            return Err(RepositoryError::NotFound(id));
        }
        write_platform(&self.path_for(platform), &existing).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn provider(platform: Platform, id: i64, name: &str, priority: u32) -> Provider {
        Provider {
            id,
            platform,
            name: name.to_string(),
            base_url: "https://example.invalid".to_string(),
            api_key: "key".to_string(),
            enabled: true,
            priority_level: priority,
            supported_models: vec!["claude-*".to_string()],
            model_mapping: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn round_trips_through_add_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileProviderRepository::open(dir.path()).await.unwrap();
        let added = repo.add(provider(Platform::Claude, 0, "primary", 1)).await.unwrap();
        assert_eq!(added.id, 1);

        let loaded = repo.load(Platform::Claude).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "primary");
    }

    #[tokio::test]
    async fn load_orders_by_priority_then_id() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileProviderRepository::open(dir.path()).await.unwrap();
        repo.add(provider(Platform::Claude, 0, "low-priority", 3)).await.unwrap();
        repo.add(provider(Platform::Claude, 0, "high-priority", 1)).await.unwrap();

        let loaded = repo.load(Platform::Claude).await.unwrap();
        assert_eq!(loaded[0].name, "high-priority");
        assert_eq!(loaded[1].name, "low-priority");
    }

    #[tokio::test]
    async fn ids_are_unique_across_platforms() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileProviderRepository::open(dir.path()).await.unwrap();
        let a = repo.add(provider(Platform::Claude, 0, "a", 1)).await.unwrap();
        let b = repo.add(provider(Platform::Codex, 0, "b", 1)).await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn update_rejects_rename() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileProviderRepository::open(dir.path()).await.unwrap();
        let added = repo.add(provider(Platform::Claude, 0, "primary", 1)).await.unwrap();
        let mut renamed = added.clone();
        renamed.name = "renamed".to_string();
        let err = repo.update(renamed).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Validation(_)));
    }

    #[tokio::test]
    async fn delete_removes_provider() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileProviderRepository::open(dir.path()).await.unwrap();
        let added = repo.add(provider(Platform::Claude, 0, "primary", 1)).await.unwrap();
        repo.delete(Platform::Claude, added.id).await.unwrap();
        assert!(repo.load(Platform::Claude).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reopening_continues_id_sequence() {
        let dir = tempfile::tempdir().unwrap();
        {
            let repo = FileProviderRepository::open(dir.path()).await.unwrap();
            repo.add(provider(Platform::Claude, 0, "primary", 1)).await.unwrap();
        }
        let repo = FileProviderRepository::open(dir.path()).await.unwrap();
        let added = repo.add(provider(Platform::Claude, 0, "secondary", 1)).await.unwrap();
        assert_eq!(added.id, 2);
    }
}
