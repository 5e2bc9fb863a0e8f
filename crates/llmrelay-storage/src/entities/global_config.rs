//! The third tier of SPEC_FULL.md's config precedence (CLI > ENV > persisted
//! default). A single row, fixed at `id = 1`: there is exactly one process
//! configuration, not one per something else.

use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "global_config")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub host: String,
    pub port: i32,
    pub dsn: String,
    pub data_dir: String,
    pub round_robin: bool,
    pub gateway_url: Option<String>,
    pub gateway_token: Option<String>,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
