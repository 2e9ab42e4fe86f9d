use async_trait::async_trait;
use sqlx::Row;

use lendroute_core::domain::rule::ApprovalMatrix;
use lendroute_core::errors::ApplicationError;
use lendroute_core::matrix::MatrixSource;

use super::{decode_error, parse_timestamp, RepositoryError};
use crate::DbPool;

/// Every stored version is kept; the highest one is current.
pub struct SqlMatrixRepository {
    pool: DbPool,
}

impl SqlMatrixRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn versions(&self) -> Result<Vec<u32>, RepositoryError> {
        let rows = sqlx::query("SELECT version FROM approval_matrix ORDER BY version")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let version: i64 = row.try_get("version").map_err(decode_error)?;
                u32::try_from(version).map_err(decode_error)
            })
            .collect()
    }

    async fn latest(&self) -> Result<Option<ApprovalMatrix>, RepositoryError> {
        let row = sqlx::query(
            "SELECT version, rules_json, updated_by, updated_at
             FROM approval_matrix ORDER BY version DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let version: i64 = row.try_get("version").map_err(decode_error)?;
        let rules_json: String = row.try_get("rules_json").map_err(decode_error)?;
        let updated_at_raw: String = row.try_get("updated_at").map_err(decode_error)?;

        Ok(Some(ApprovalMatrix {
            version: u32::try_from(version).map_err(decode_error)?,
            updated_at: parse_timestamp("updated_at", &updated_at_raw)?,
            updated_by: row.try_get("updated_by").map_err(decode_error)?,
            rules: serde_json::from_str(&rules_json).map_err(decode_error)?,
        }))
    }

    async fn insert(&self, matrix: &ApprovalMatrix) -> Result<(), RepositoryError> {
        let rules_json = serde_json::to_string(&matrix.rules).map_err(decode_error)?;

        sqlx::query(
            "INSERT INTO approval_matrix (version, rules_json, updated_by, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(version) DO UPDATE SET
                 rules_json = excluded.rules_json,
                 updated_by = excluded.updated_by,
                 updated_at = excluded.updated_at",
        )
        .bind(i64::from(matrix.version))
        .bind(rules_json)
        .bind(&matrix.updated_by)
        .bind(matrix.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl MatrixSource for SqlMatrixRepository {
    async fn load(&self) -> Result<Option<ApprovalMatrix>, ApplicationError> {
        Ok(self.latest().await?)
    }

    async fn store(&self, matrix: &ApprovalMatrix) -> Result<(), ApplicationError> {
        Ok(self.insert(matrix).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lendroute_core::matrix::{default_matrix, ApprovalMatrixStore, MatrixSource};

    use super::SqlMatrixRepository;
    use crate::{connect_with_settings, migrations};

    async fn repository() -> SqlMatrixRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        SqlMatrixRepository::new(pool)
    }

    #[tokio::test]
    async fn empty_table_loads_nothing() {
        let repo = repository().await;
        assert!(repo.load().await.expect("load").is_none());
    }

    #[tokio::test]
    async fn stored_matrix_round_trips_rules() {
        let repo = repository().await;
        let matrix = default_matrix();

        repo.store(&matrix).await.expect("store");
        let loaded = repo.load().await.expect("load").expect("present");

        assert_eq!(loaded.rules, matrix.rules);
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn replacing_through_the_store_keeps_history() {
        let repo = Arc::new(repository().await);
        let store = ApprovalMatrixStore::new(repo.clone());
        let seeded = store.get().await.expect("seed");

        let mut rules = seeded.rules.clone();
        rules.truncate(2);
        store.replace(rules, "u-admin").await.expect("replace");

        assert_eq!(repo.versions().await.expect("versions"), vec![1, 2]);
        let current = repo.load().await.expect("load").expect("present");
        assert_eq!(current.rules.len(), 2);
        assert_eq!(current.updated_by, "u-admin");
    }
}
