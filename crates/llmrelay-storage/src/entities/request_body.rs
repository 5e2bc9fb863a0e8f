//! The body table. Kept separate from `request_logs` so that
//! the hot metadata queries the admin surface runs constantly never drag the
//! (much larger, rarely read) payload blobs along for the ride.

use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_bodies")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(indexed, unique)]
    pub trace_id: String,
    pub request_body: Vec<u8>,
    pub response_body: Vec<u8>,
    pub created_at: OffsetDateTime,
    #[sea_orm(indexed)]
    pub expires_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
