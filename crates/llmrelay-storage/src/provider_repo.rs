//! Relational implementation of `ProviderRepository`, one row per provider
//! with `supportedModels`/`modelMapping` folded into a single
//! `config_json` blob instead of normalizing into join tables nothing else
//! queries.

use std::collections::HashMap;

use async_trait::async_trait;
use llmrelay_protocol::Platform;
use llmrelay_provider::{Provider, ProviderRepository, RepositoryError, validate_providers};
use sea_orm::{ActiveValue, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, TransactionTrait};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::entities::{self, provider::Column};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProviderConfig {
    #[serde(default)]
    supported_models: Vec<String>,
    #[serde(default)]
    model_mapping: HashMap<String, String>,
}

pub struct SqlProviderRepository {
    db: DatabaseConnection,
}

impl SqlProviderRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

fn to_domain(model: entities::provider::Model) -> Result<Provider, RepositoryError> {
    let config: ProviderConfig =
        serde_json::from_value(model.config_json).map_err(|e| RepositoryError::Backend(format!("decode config_json: {e}")))?;
    let platform = model.platform.parse().map_err(|_| RepositoryError::Backend(format!("unknown platform: {}", model.platform)))?;
    Ok(Provider {
        id: model.id,
        platform,
        name: model.name,
        base_url: model.base_url,
        api_key: model.api_key,
        enabled: model.enabled,
        priority_level: model.priority_level.max(0) as u32,
        supported_models: config.supported_models,
        model_mapping: config.model_mapping,
    })
}

fn to_active(provider: &Provider, now: OffsetDateTime) -> Result<entities::provider::ActiveModel, RepositoryError> {
    let config = ProviderConfig {
        supported_models: provider.supported_models.clone(),
        model_mapping: provider.model_mapping.clone(),
    };
    let config_json = serde_json::to_value(config).map_err(|e| RepositoryError::Backend(e.to_string()))?;

    Ok(entities::provider::ActiveModel {
        id: if provider.id == 0 { ActiveValue::NotSet } else { ActiveValue::Set(provider.id) },
        platform: ActiveValue::Set(provider.platform.as_str().to_string()),
        name: ActiveValue::Set(provider.name.clone()),
        base_url: ActiveValue::Set(provider.base_url.clone()),
        api_key: ActiveValue::Set(provider.api_key.clone()),
        enabled: ActiveValue::Set(provider.enabled),
        priority_level: ActiveValue::Set(provider.priority_level as i32),
        config_json: ActiveValue::Set(config_json),
        updated_at: ActiveValue::Set(now),
    })
}

async fn load_platform(db: &DatabaseConnection, platform: Platform) -> Result<Vec<Provider>, RepositoryError> {
    let rows = entities::Providers::find()
        .filter(Column::Platform.eq(platform.as_str()))
        .order_by_asc(Column::PriorityLevel)
        .order_by_asc(Column::Id)
        .all(db)
        .await
        .map_err(|e| RepositoryError::Backend(e.to_string()))?;
    rows.into_iter().map(to_domain).collect()
}

#[async_trait]
impl ProviderRepository for SqlProviderRepository {
    async fn load(&self, platform: Platform) -> Result<Vec<Provider>, RepositoryError> {
        load_platform(&self.db, platform).await
    }

    async fn save(&self, platform: Platform, providers: Vec<Provider>) -> Result<Vec<String>, RepositoryError> {
        let existing = load_platform(&self.db, platform).await?;
        let warnings = validate_providers(&existing, &providers)?;

        let txn = self.db.begin().await.map_err(|e| RepositoryError::Backend(e.to_string()))?;
        entities::Providers::delete_many()
            .filter(Column::Platform.eq(platform.as_str()))
            .exec(&txn)
            .await
            .map_err(|e| RepositoryError::Backend(e.to_string()))?;

        let now = OffsetDateTime::now_utc();
        for provider in &providers {
            let active = to_active(provider, now)?;
            entities::Providers::insert(active).exec(&txn).await.map_err(|e| RepositoryError::Backend(e.to_string()))?;
        }
        txn.commit().await.map_err(|e| RepositoryError::Backend(e.to_string()))?;
        Ok(warnings)
    }

    async fn add(&self, mut provider: Provider) -> Result<Provider, RepositoryError> {
        let existing = load_platform(&self.db, provider.platform).await?;
        provider.id = 0;
        let mut incoming = existing.clone();
        incoming.push(provider.clone());
        validate_providers(&existing, &incoming)?;

        let active = to_active(&provider, OffsetDateTime::now_utc())?;
        let result = entities::Providers::insert(active).exec(&self.db).await.map_err(|e| RepositoryError::Backend(e.to_string()))?;
        provider.id = result.last_insert_id;
        Ok(provider)
    }

    async fn update(&self, provider: Provider) -> Result<Provider, RepositoryError> {
        let Some(stored) = entities::Providers::find_by_id(provider.id)
            .one(&self.db)
            .await
            .map_err(|e| RepositoryError::Backend(e.to_string()))?
        else {
            return Err(RepositoryError::NotFound(provider.id));
        };
        if stored.name != provider.name {
            return Err(RepositoryError::Validation(llmrelay_provider::ProviderError::NameNotMutable));
        }

        let existing = load_platform(&self.db, provider.platform).await?;
        let incoming: Vec<Provider> = existing.iter().map(|p| if p.id == provider.id { provider.clone() } else { p.clone() }).collect();
        validate_providers(&[], &incoming)?;

        let active = to_active(&provider, OffsetDateTime::now_utc())?;
        entities::Providers::update(active).exec(&self.db).await.map_err(|e| RepositoryError::Backend(e.to_string()))?;
        Ok(provider)
    }

    async fn delete(&self, platform: Platform, id: i64) -> Result<(), RepositoryError> {
        let result = entities::Providers::delete_many()
            .filter(Column::Id.eq(id))
            .filter(Column::Platform.eq(platform.as_str()))
            .exec(&self.db)
            .await
            .map_err(|e| RepositoryError::Backend(e.to_string()))?;
        if result.rows_affected == 0 {
            return Err(RepositoryError::NotFound(id));
        }
        Ok(())
    }
}
