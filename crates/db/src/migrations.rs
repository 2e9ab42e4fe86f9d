use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

/// Embedded at compile time from the workspace `migrations/` directory.
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}
