//! The relational back-end for component A. One row per provider; the
//! whitelist and mapping — both variable-shaped collections — are kept as a
//! single `config_json` blob rather than normalized into join tables nobody
//! queries independently.

use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "providers")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub platform: String,
    #[sea_orm(indexed)]
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub enabled: bool,
    pub priority_level: i32,
    pub config_json: Json,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
