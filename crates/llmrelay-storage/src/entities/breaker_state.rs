//! Persisted circuit breaker state, one row per provider. Mirrors
//! `llmrelay_provider::circuit::BreakerSnapshot` field-for-field so
//! rehydration is a straight row-to-struct mapping.

use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "breaker_states")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub provider_id: i64,
    pub state: String,
    pub consecutive_failures: i32,
    pub last_failure_at: Option<OffsetDateTime>,
    pub opened_at: Option<OffsetDateTime>,
    pub total_requests: i64,
    pub total_failures: i64,
    pub total_successes: i64,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
