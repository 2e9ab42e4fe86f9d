pub mod seed;
pub mod validation;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::domain::rule::{ApprovalMatrix, ApprovalRule};
use crate::errors::ApplicationError;

pub use seed::default_matrix;
pub use validation::{validate_rule, validate_rules, RuleViolation};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Durable home of the current matrix.
#[async_trait]
pub trait MatrixSource: Send + Sync {
    async fn load(&self) -> Result<Option<ApprovalMatrix>, ApplicationError>;
    async fn store(&self, matrix: &ApprovalMatrix) -> Result<(), ApplicationError>;
}

#[derive(Debug, Default)]
pub struct InMemoryMatrixSource {
    matrix: RwLock<Option<ApprovalMatrix>>,
}

impl InMemoryMatrixSource {
    pub fn with_matrix(matrix: ApprovalMatrix) -> Self {
        Self { matrix: RwLock::new(Some(matrix)) }
    }
}

#[async_trait]
impl MatrixSource for InMemoryMatrixSource {
    async fn load(&self) -> Result<Option<ApprovalMatrix>, ApplicationError> {
        Ok(self.matrix.read().await.clone())
    }

    async fn store(&self, matrix: &ApprovalMatrix) -> Result<(), ApplicationError> {
        *self.matrix.write().await = Some(matrix.clone());
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MatrixError {
    #[error("approval matrix rejected: {}", summarize(.0))]
    Validation(Vec<RuleViolation>),
    #[error(transparent)]
    Application(#[from] ApplicationError),
}

fn summarize(violations: &[RuleViolation]) -> String {
    violations.iter().map(RuleViolation::reason).collect::<Vec<_>>().join("; ")
}

struct CachedMatrix {
    matrix: Arc<ApprovalMatrix>,
    loaded_at: Instant,
}

/// Owns the matrix snapshot handed to routing. Reads are served from a TTL
/// cache; replacements validate the whole rule list, persist it, and swap
/// the cached snapshot.
pub struct ApprovalMatrixStore {
    source: Arc<dyn MatrixSource>,
    ttl: Duration,
    cache: RwLock<Option<CachedMatrix>>,
}

impl ApprovalMatrixStore {
    pub fn new(source: Arc<dyn MatrixSource>) -> Self {
        Self::with_ttl(source, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(source: Arc<dyn MatrixSource>, ttl: Duration) -> Self {
        Self { source, ttl, cache: RwLock::new(None) }
    }

    pub async fn get(&self) -> Result<Arc<ApprovalMatrix>, ApplicationError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref().filter(|cached| self.is_fresh(cached)) {
                return Ok(Arc::clone(&cached.matrix));
            }
        }

        let mut cache = self.cache.write().await;
        if let Some(cached) = cache.as_ref().filter(|cached| self.is_fresh(cached)) {
            return Ok(Arc::clone(&cached.matrix));
        }

        let matrix = match self.source.load().await? {
            Some(matrix) => matrix,
            None => {
                let seeded = default_matrix();
                self.source.store(&seeded).await?;
                info!(
                    event_name = "approval.matrix.seeded",
                    version = seeded.version,
                    rule_count = seeded.rules.len(),
                    "approval matrix seeded from defaults"
                );
                seeded
            }
        };

        let matrix = Arc::new(matrix);
        *cache = Some(CachedMatrix { matrix: Arc::clone(&matrix), loaded_at: Instant::now() });
        Ok(matrix)
    }

    /// Validates and installs a complete rule list. Nothing is written when
    /// any rule is invalid.
    pub async fn replace(
        &self,
        rules: Vec<ApprovalRule>,
        updated_by: &str,
    ) -> Result<Arc<ApprovalMatrix>, MatrixError> {
        if let Err(violations) = validate_rules(&rules) {
            warn!(
                event_name = "approval.matrix.rejected",
                updated_by = %updated_by,
                violation_count = violations.len(),
                "approval matrix update rejected"
            );
            return Err(MatrixError::Validation(violations));
        }

        let mut cache = self.cache.write().await;
        let current_version = self.source.load().await?.map(|matrix| matrix.version).unwrap_or(0);
        let matrix = ApprovalMatrix {
            version: current_version.saturating_add(1),
            updated_at: Utc::now(),
            updated_by: updated_by.to_owned(),
            rules,
        };
        self.source.store(&matrix).await?;

        info!(
            event_name = "approval.matrix.replaced",
            version = matrix.version,
            rule_count = matrix.rules.len(),
            updated_by = %updated_by,
            "approval matrix replaced"
        );

        let matrix = Arc::new(matrix);
        *cache = Some(CachedMatrix { matrix: Arc::clone(&matrix), loaded_at: Instant::now() });
        Ok(matrix)
    }

    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    fn is_fresh(&self, cached: &CachedMatrix) -> bool {
        cached.loaded_at.elapsed() < self.ttl
    }
}
