use async_trait::async_trait;
use chrono::Utc;
use sqlx::{QueryBuilder, Row, Sqlite};

use lendroute_core::directory::{DirectoryQuery, UserDirectory};
use lendroute_core::domain::approver::{Approver, UserRole};
use lendroute_core::errors::ApplicationError;

use super::{decode_error, RepositoryError};
use crate::DbPool;

pub struct SqlUserDirectory {
    pool: DbPool,
}

impl SqlUserDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, approver: &Approver, active: bool) -> Result<(), RepositoryError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO app_user (id, name, email, role, grade, active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 email = excluded.email,
                 role = excluded.role,
                 grade = excluded.grade,
                 active = excluded.active,
                 updated_at = excluded.updated_at",
        )
        .bind(&approver.id)
        .bind(&approver.name)
        .bind(&approver.email)
        .bind(approver.role.as_str())
        .bind(approver.grade.map(i64::from))
        .bind(active)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query_active(&self, query: &DirectoryQuery) -> Result<Vec<Approver>, RepositoryError> {
        let mut builder: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT id, name, email, role, grade FROM app_user WHERE active = 1");

        if !query.roles.is_empty() {
            builder.push(" AND role IN (");
            let mut roles = builder.separated(", ");
            for role in &query.roles {
                roles.push_bind(role.as_str());
            }
            roles.push_unseparated(")");
        }
        if !query.grades.is_empty() {
            builder.push(" AND grade IN (");
            let mut grades = builder.separated(", ");
            for grade in &query.grades {
                grades.push_bind(i64::from(*grade));
            }
            grades.push_unseparated(")");
        }
        if !query.ids.is_empty() {
            builder.push(" AND id IN (");
            let mut ids = builder.separated(", ");
            for id in &query.ids {
                ids.push_bind(id.as_str());
            }
            ids.push_unseparated(")");
        }
        builder.push(" ORDER BY id");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_approver).collect()
    }

    async fn query_by_id(&self, id: &str) -> Result<Option<Approver>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, name, email, role, grade FROM app_user WHERE id = ? AND active = 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_approver).transpose()
    }
}

fn row_to_approver(row: &sqlx::sqlite::SqliteRow) -> Result<Approver, RepositoryError> {
    let role_raw: String = row.try_get("role").map_err(decode_error)?;
    let grade: Option<i64> = row.try_get("grade").map_err(decode_error)?;

    Ok(Approver {
        id: row.try_get("id").map_err(decode_error)?,
        name: row.try_get("name").map_err(decode_error)?,
        email: row.try_get("email").map_err(decode_error)?,
        role: UserRole::parse(&role_raw)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown user role `{role_raw}`")))?,
        grade: grade.map(u8::try_from).transpose().map_err(decode_error)?,
    })
}

#[async_trait]
impl UserDirectory for SqlUserDirectory {
    async fn find_active(&self, query: &DirectoryQuery) -> Result<Vec<Approver>, ApplicationError> {
        Ok(self.query_active(query).await?)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Approver>, ApplicationError> {
        Ok(self.query_by_id(id).await?)
    }
}
