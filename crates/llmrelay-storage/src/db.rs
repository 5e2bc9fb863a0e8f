//! Database connection handling.
//!
//! Deliberately not a package-level singleton: callers hold the
//! `DatabaseConnection` (cheap to clone, it's a pool handle) and pass it
//! into whichever repository or store wraps it.

use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbErr, Schema};

use crate::entities;

pub async fn connect(dsn: &str) -> Result<DatabaseConnection, DbErr> {
    Database::connect(dsn).await
}

/// Creates the five tables this crate owns if they don't already exist.
/// Used at bootstrap and by tests that spin up an in-memory sqlite.
pub async fn sync_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    for stmt in [
        builder.build(&schema.create_table_from_entity(entities::Providers).if_not_exists()),
        builder.build(&schema.create_table_from_entity(entities::BreakerStates).if_not_exists()),
        builder.build(&schema.create_table_from_entity(entities::RequestLogs).if_not_exists()),
        builder.build(&schema.create_table_from_entity(entities::RequestBodies).if_not_exists()),
        builder.build(&schema.create_table_from_entity(entities::GlobalConfigs).if_not_exists()),
    ] {
        db.execute(stmt).await?;
    }

    Ok(())
}
