//! Relational implementation of `CircuitStore` (component E's persistence
//! seam), upserting one row per provider on every transition.

use async_trait::async_trait;
use llmrelay_provider::{BreakerSnapshot, CircuitState, CircuitStore, CircuitStoreError};
use sea_orm::sea_query::OnConflict;
use sea_orm::{ActiveValue, DatabaseConnection, EntityTrait};
use time::OffsetDateTime;

use crate::entities::{self, breaker_state::Column};

pub struct SqlCircuitStore {
    db: DatabaseConnection,
}

impl SqlCircuitStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

fn state_to_str(state: CircuitState) -> &'static str {
    match state {
        CircuitState::Closed => "closed",
        CircuitState::Open => "open",
        CircuitState::HalfOpen => "half_open",
    }
}

fn str_to_state(s: &str) -> CircuitState {
    match s {
        "open" => CircuitState::Open,
        "half_open" => CircuitState::HalfOpen,
        _ => CircuitState::Closed,
    }
}

#[async_trait]
impl CircuitStore for SqlCircuitStore {
    async fn persist(&self, snapshot: &BreakerSnapshot) -> Result<(), CircuitStoreError> {
        let active = entities::breaker_state::ActiveModel {
            provider_id: ActiveValue::Set(snapshot.provider_id),
            state: ActiveValue::Set(state_to_str(snapshot.state).to_string()),
            consecutive_failures: ActiveValue::Set(snapshot.consecutive_failures as i32),
            last_failure_at: ActiveValue::Set(snapshot.last_failure_at),
            opened_at: ActiveValue::Set(snapshot.opened_at),
            total_requests: ActiveValue::Set(snapshot.total_requests as i64),
            total_failures: ActiveValue::Set(snapshot.total_failures as i64),
            total_successes: ActiveValue::Set(snapshot.total_successes as i64),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        };

        entities::BreakerStates::insert(active)
            .on_conflict(
                OnConflict::column(Column::ProviderId)
                    .update_columns([
                        Column::State,
                        Column::ConsecutiveFailures,
                        Column::LastFailureAt,
                        Column::OpenedAt,
                        Column::TotalRequests,
                        Column::TotalFailures,
                        Column::TotalSuccesses,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(|e| CircuitStoreError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<BreakerSnapshot>, CircuitStoreError> {
        let rows = entities::BreakerStates::find().all(&self.db).await.map_err(|e| CircuitStoreError::Backend(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| BreakerSnapshot {
                provider_id: row.provider_id,
                state: str_to_state(&row.state),
                consecutive_failures: row.consecutive_failures.max(0) as u32,
                last_failure_at: row.last_failure_at,
                opened_at: row.opened_at,
                total_requests: row.total_requests.max(0) as u64,
                total_failures: row.total_failures.max(0) as u64,
                total_successes: row.total_successes.max(0) as u64,
                half_open_probe_in_flight: false,
            })
            .collect())
    }
}
