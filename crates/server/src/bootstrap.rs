use std::sync::Arc;
use std::time::Duration;

use lendroute_core::approvals::ApproverResolver;
use lendroute_core::config::{AppConfig, ConfigError, LoadOptions};
use lendroute_core::matrix::ApprovalMatrixStore;
use lendroute_core::notify::{NotificationError, NotificationPort};
use lendroute_core::token::{ApprovalTokenService, TokenError};
use lendroute_core::workflow::{ApprovalWorkflow, WorkflowSettings};
use lendroute_db::{
    connect_with_config, migrations, DbPool, SqlMatrixRepository, SqlRequestRepository,
    SqlUserDirectory,
};
use thiserror::Error;
use tracing::info;

use crate::approvals::ApprovalsState;
use crate::auth::AuthManager;
use crate::notifier::{LogNotificationPort, WebhookNotificationPort};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub workflow: Arc<ApprovalWorkflow>,
    pub auth: AuthManager,
}

impl Application {
    pub fn approvals_state(&self) -> ApprovalsState {
        ApprovalsState::new(Arc::clone(&self.workflow), self.auth.clone())
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not open the lendroute database: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("could not migrate the lendroute schema: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("approval token service setup failed: {0}")]
    Token(#[from] TokenError),
    #[error("notification adapter setup failed: {0}")]
    Notifier(#[from] NotificationError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "bootstrapping lendroute"
    );

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "sqlite pool ready"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "schema migrations up to date"
    );

    let directory = Arc::new(SqlUserDirectory::new(db_pool.clone()));
    let matrix = ApprovalMatrixStore::with_ttl(
        Arc::new(SqlMatrixRepository::new(db_pool.clone())),
        config.matrix_cache_ttl(),
    );
    let tokens =
        ApprovalTokenService::with_default_ttl(&config.approvals.token_secret, config.token_ttl())?;

    let workflow = ApprovalWorkflow::new(
        Arc::new(SqlRequestRepository::new(db_pool.clone())),
        ApproverResolver::new(directory.clone()),
        tokens,
        notifier(&config)?,
        Arc::new(matrix),
    )
    .with_settings(WorkflowSettings {
        token_ttl: config.token_ttl(),
        public_base_url: config.server.public_base_url.clone(),
    });

    let auth = AuthManager::new(config.portal.api_keys.clone(), directory);

    Ok(Application { config, db_pool, workflow: Arc::new(workflow), auth })
}

fn notifier(config: &AppConfig) -> Result<Arc<dyn NotificationPort>, BootstrapError> {
    match config.notifications.webhook_url.as_deref() {
        Some(url) => {
            let port = WebhookNotificationPort::new(
                url,
                Duration::from_secs(config.notifications.timeout_secs),
            )?;
            info!(
                event_name = "system.bootstrap.notifier",
                correlation_id = "bootstrap",
                transport = "webhook",
                url = %port.url(),
                "notification webhook configured"
            );
            Ok(Arc::new(port))
        }
        None => {
            info!(
                event_name = "system.bootstrap.notifier",
                correlation_id = "bootstrap",
                transport = "log",
                "no notification webhook configured; notifications go to the log"
            );
            Ok(Arc::new(LogNotificationPort))
        }
    }
}

#[cfg(test)]
mod tests {
    use lendroute_core::config::{ConfigOverrides, LoadOptions};
    use lendroute_core::domain::request::RequestId;
    use lendroute_core::workflow::RequestStore;

    use crate::bootstrap::bootstrap;

    fn options(token_secret: Option<&str>) -> LoadOptions {
        LoadOptions {
            config_path: Some("lendroute-test-does-not-exist.toml".into()),
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_owned()),
                token_secret: token_secret.map(str::to_owned),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_without_token_secret() {
        let result = bootstrap(options(None)).await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("token_secret"), "{message}");
    }

    #[tokio::test]
    async fn bootstrap_wires_sql_backed_workflow() {
        let app = bootstrap(options(Some("bootstrap-secret-0123456789abcdefghij")))
            .await
            .expect("bootstrap should succeed with valid overrides");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('app_user', 'loan_request', 'approval_matrix')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("baseline tables");
        assert_eq!(table_count, 3);

        let missing = app.workflow.requests().find_by_id(&RequestId("LR-0".to_owned())).await;
        assert!(missing.expect("query").is_none());

        let matrix = app.workflow.matrix().get().await.expect("seeded matrix");
        assert_eq!(matrix.version, 1);

        app.db_pool.close().await;
    }
}
