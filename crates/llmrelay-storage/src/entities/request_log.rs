//! Per-attempt metadata row. Indexed on `traceId`, `requestId`,
//! `(platform, provider)`, `createdAt`, `httpCode`, `userId`, plus the
//! composite `(provider, createdAt)`, `(platform, createdAt)`,
//! `(model, createdAt)` pairs the admin surface's filtered queries lean on.

use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(indexed, unique)]
    pub trace_id: String,
    #[sea_orm(indexed)]
    pub request_id: Option<String>,
    pub platform: String,
    pub model: String,
    pub provider: String,
    #[sea_orm(indexed)]
    pub http_status: i32,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub reasoning_tokens: i64,
    pub is_stream: bool,
    pub duration_seconds: f64,
    pub user_agent: Option<String>,
    pub client_ip: Option<String>,
    #[sea_orm(indexed)]
    pub user_id: Option<String>,
    pub request_method: String,
    pub request_path: String,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub vendor_error_code: Option<String>,
    pub cost_input: f64,
    pub cost_output: f64,
    pub cost_cache_create: f64,
    pub cost_cache_read: f64,
    pub cost_ephemeral_5m: f64,
    pub cost_ephemeral_1h: f64,
    pub cost_total: f64,
    pub has_pricing: bool,
    #[sea_orm(indexed)]
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
