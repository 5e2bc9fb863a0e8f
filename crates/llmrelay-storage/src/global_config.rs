//! Persistence for the third tier of SPEC_FULL.md's config precedence
//! (CLI > ENV > persisted-in-storage default). One row, fixed at `id = 1`;
//! `upsert_global_config` is called once at startup with the fully merged
//! config so the next run's default reflects this run's CLI/ENV overrides.

use llmrelay_common::GlobalConfig;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ActiveValue, DatabaseConnection, EntityTrait, QueryOrder};
use time::OffsetDateTime;

use crate::entities::{self, global_config::Column};

const SINGLETON_ID: i64 = 1;

pub async fn load_global_config(db: &DatabaseConnection) -> Result<Option<GlobalConfig>, sea_orm::DbErr> {
    let row = entities::GlobalConfigs::find().order_by_asc(Column::Id).one(db).await?;
    Ok(row.map(|m| GlobalConfig {
        host: m.host,
        port: u16::try_from(m.port).unwrap_or(8080),
        dsn: m.dsn,
        data_dir: m.data_dir,
        round_robin: m.round_robin,
        gateway_url: m.gateway_url,
        gateway_token: m.gateway_token,
    }))
}

pub async fn upsert_global_config(db: &DatabaseConnection, config: &GlobalConfig) -> Result<(), sea_orm::DbErr> {
    let active = entities::global_config::ActiveModel {
        id: ActiveValue::Set(SINGLETON_ID),
        host: ActiveValue::Set(config.host.clone()),
        port: ActiveValue::Set(i32::from(config.port)),
        dsn: ActiveValue::Set(config.dsn.clone()),
        data_dir: ActiveValue::Set(config.data_dir.clone()),
        round_robin: ActiveValue::Set(config.round_robin),
        gateway_url: ActiveValue::Set(config.gateway_url.clone()),
        gateway_token: ActiveValue::Set(config.gateway_token.clone()),
        updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
    };

    entities::GlobalConfigs::insert(active)
        .on_conflict(
            OnConflict::column(Column::Id)
                .update_columns([
                    Column::Host,
                    Column::Port,
                    Column::Dsn,
                    Column::DataDir,
                    Column::RoundRobin,
                    Column::GatewayUrl,
                    Column::GatewayToken,
                    Column::UpdatedAt,
                ])
                .to_owned(),
        )
        .exec(db)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{connect, sync_schema};

    #[tokio::test]
    async fn round_trips_through_upsert_and_load() {
        let db = connect("sqlite::memory:").await.unwrap();
        sync_schema(&db).await.unwrap();

        assert!(load_global_config(&db).await.unwrap().is_none());

        let config = GlobalConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            dsn: "sqlite://./data/db/llmrelay.db".to_string(),
            data_dir: "./data".to_string(),
            round_robin: true,
            gateway_url: Some("https://gateway.example".to_string()),
            gateway_token: Some("tok".to_string()),
        };
        upsert_global_config(&db, &config).await.unwrap();

        let loaded = load_global_config(&db).await.unwrap().unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn upsert_twice_overwrites_the_same_row_instead_of_inserting_a_second() {
        let db = connect("sqlite::memory:").await.unwrap();
        sync_schema(&db).await.unwrap();

        let first = GlobalConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            dsn: "sqlite::memory:".to_string(),
            data_dir: "./data".to_string(),
            round_robin: false,
            gateway_url: None,
            gateway_token: None,
        };
        upsert_global_config(&db, &first).await.unwrap();

        let second = GlobalConfig { round_robin: true, port: 9090, ..first };
        upsert_global_config(&db, &second).await.unwrap();

        let loaded = load_global_config(&db).await.unwrap().unwrap();
        assert_eq!(loaded, second);
        assert_eq!(entities::GlobalConfigs::find().all(&db).await.unwrap().len(), 1);
    }
}
