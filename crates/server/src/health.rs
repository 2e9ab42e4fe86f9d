use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use lendroute_core::matrix::ApprovalMatrixStore;
use lendroute_db::DbPool;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    matrix: Arc<ApprovalMatrixStore>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ComponentCheck {
    pub status: &'static str,
    pub detail: String,
}

impl ComponentCheck {
    fn ready(detail: impl Into<String>) -> Self {
        Self { status: "ready", detail: detail.into() }
    }

    fn degraded(detail: impl Into<String>) -> Self {
        Self { status: "degraded", detail: detail.into() }
    }

    fn is_ready(&self) -> bool {
        self.status == "ready"
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: ComponentCheck,
    pub approval_matrix: ComponentCheck,
    pub checked_at: String,
}

/// Readiness: the database answers and a matrix snapshot can be served.
pub fn router(db_pool: DbPool, matrix: Arc<ApprovalMatrixStore>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool, matrix })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let approval_matrix = if database.is_ready() {
        matrix_check(&state.matrix).await
    } else {
        ComponentCheck::degraded("skipped: database unavailable")
    };
    let ready = database.is_ready() && approval_matrix.is_ready();

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        database,
        approval_matrix,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> ComponentCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => ComponentCheck::ready("database query succeeded"),
        Err(error) => ComponentCheck::degraded(format!("database query failed: {error}")),
    }
}

async fn matrix_check(matrix: &ApprovalMatrixStore) -> ComponentCheck {
    match matrix.get().await {
        Ok(matrix) => ComponentCheck::ready(format!(
            "version {} with {} rules",
            matrix.version,
            matrix.rules.len()
        )),
        Err(error) => ComponentCheck::degraded(format!("approval matrix unavailable: {error}")),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{extract::State, http::StatusCode, Json};
    use lendroute_core::matrix::ApprovalMatrixStore;
    use lendroute_db::{connect_with_settings, migrations, DbPool, SqlMatrixRepository};

    use crate::health::{health, HealthState};

    async fn state() -> (DbPool, HealthState) {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        migrations::run_pending(&pool).await.expect("migrate");
        let matrix =
            Arc::new(ApprovalMatrixStore::new(Arc::new(SqlMatrixRepository::new(pool.clone()))));
        (pool.clone(), HealthState { db_pool: pool, matrix })
    }

    #[tokio::test]
    async fn health_is_ready_with_database_and_seeded_matrix() {
        let (pool, state) = state().await;

        let (status, Json(payload)) = health(State(state)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.database.status, "ready");
        assert!(payload.approval_matrix.detail.starts_with("version 1"));

        pool.close().await;
    }

    #[tokio::test]
    async fn health_degrades_when_database_is_unavailable() {
        let (pool, state) = state().await;
        pool.close().await;

        let (status, Json(payload)) = health(State(state)).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.database.status, "degraded");
        assert_eq!(payload.approval_matrix.status, "degraded");
    }
}
