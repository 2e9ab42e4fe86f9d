use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::request::{
    DecisionGuard, DecisionWrite, RequestId, RequestRecord, RequestStatus, ReviewAssignment,
};
use crate::errors::ApplicationError;

/// Persistence of loan requests as seen by the approval workflow.
///
/// The conditional writes are the workflow's only concurrency control:
/// each must check its precondition and apply its change as one atomic step
/// and report whether it changed anything.
#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn find_by_id(&self, id: &RequestId) -> Result<Option<RequestRecord>, ApplicationError>;

    /// The request whose stored token equals `token` byte for byte.
    async fn find_by_token(&self, token: &str) -> Result<Option<RequestRecord>, ApplicationError>;

    async fn save(&self, record: RequestRecord) -> Result<(), ApplicationError>;

    /// Moves a SUBMITTED request to UNDER_REVIEW with its first token.
    /// Returns `false` when the request is missing or not SUBMITTED.
    async fn assign_for_review(
        &self,
        id: &RequestId,
        assignment: &ReviewAssignment,
    ) -> Result<bool, ApplicationError>;

    /// Replaces the approver and token of a request that is still
    /// UNDER_REVIEW; the previous token stops matching in the same write.
    /// Returns `false` when the request is missing or not UNDER_REVIEW.
    async fn reissue_review(
        &self,
        id: &RequestId,
        assignment: &ReviewAssignment,
    ) -> Result<bool, ApplicationError>;

    /// Applies a terminal decision and clears the token in the same write.
    /// Returns `false` when the request is no longer UNDER_REVIEW or, for a
    /// token guard, no longer holds that token.
    async fn apply_decision(
        &self,
        id: &RequestId,
        guard: DecisionGuard<'_>,
        write: &DecisionWrite,
    ) -> Result<bool, ApplicationError>;
}

#[derive(Debug, Default)]
pub struct InMemoryRequestStore {
    records: RwLock<HashMap<RequestId, RequestRecord>>,
}

impl InMemoryRequestStore {
    pub fn with_records(records: impl IntoIterator<Item = RequestRecord>) -> Self {
        let records = records.into_iter().map(|record| (record.id.clone(), record)).collect();
        Self { records: RwLock::new(records) }
    }
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn find_by_id(&self, id: &RequestId) -> Result<Option<RequestRecord>, ApplicationError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<RequestRecord>, ApplicationError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|record| record.approval_token.as_deref() == Some(token))
            .cloned())
    }

    async fn save(&self, record: RequestRecord) -> Result<(), ApplicationError> {
        self.records.write().await.insert(record.id.clone(), record);
        Ok(())
    }

    async fn assign_for_review(
        &self,
        id: &RequestId,
        assignment: &ReviewAssignment,
    ) -> Result<bool, ApplicationError> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(id) else {
            return Ok(false);
        };
        if record.status != RequestStatus::Submitted {
            return Ok(false);
        }

        assignment.apply_to(record);
        Ok(true)
    }

    async fn reissue_review(
        &self,
        id: &RequestId,
        assignment: &ReviewAssignment,
    ) -> Result<bool, ApplicationError> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(id) else {
            return Ok(false);
        };
        if record.status != RequestStatus::UnderReview {
            return Ok(false);
        }

        assignment.apply_to(record);
        Ok(true)
    }

    async fn apply_decision(
        &self,
        id: &RequestId,
        guard: DecisionGuard<'_>,
        write: &DecisionWrite,
    ) -> Result<bool, ApplicationError> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(id) else {
            return Ok(false);
        };
        if record.status != RequestStatus::UnderReview {
            return Ok(false);
        }
        if let DecisionGuard::Token(token) = guard {
            if record.approval_token.as_deref() != Some(token) {
                return Ok(false);
            }
        }

        write.apply_to(record);
        Ok(true)
    }
}
