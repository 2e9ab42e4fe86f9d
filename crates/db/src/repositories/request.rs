use std::str::FromStr;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::Row;

use lendroute_core::domain::request::{
    DecisionGuard, DecisionWrite, RequestId, RequestRecord, RequestStatus, ReviewAssignment,
};
use lendroute_core::errors::ApplicationError;
use lendroute_core::workflow::RequestStore;

use super::{decode_error, parse_optional_timestamp, parse_timestamp, RepositoryError};
use crate::DbPool;

const REQUEST_COLUMNS: &str = "id, applicant_id, applicant_name, applicant_email, total_value,
    applicant_grade, duration_days, asset_categories_json, status, approver_email,
    approved_by_name, approval_token, approval_token_expires_at, approved_at, rejected_reason,
    approval_remarks, created_at, updated_at";

pub struct SqlRequestRepository {
    pool: DbPool,
}

impl SqlRequestRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch_by_id(&self, id: &RequestId) -> Result<Option<RequestRecord>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {REQUEST_COLUMNS} FROM loan_request WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_request).transpose()
    }

    async fn fetch_by_token(&self, token: &str) -> Result<Option<RequestRecord>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM loan_request WHERE approval_token = ?"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_request).transpose()
    }

    async fn upsert(&self, record: &RequestRecord) -> Result<(), RepositoryError> {
        let categories = serde_json::to_string(&record.asset_categories).map_err(decode_error)?;

        sqlx::query(
            "INSERT INTO loan_request (id, applicant_id, applicant_name, applicant_email,
                                       total_value, applicant_grade, duration_days,
                                       asset_categories_json, status, approver_email,
                                       approved_by_name, approval_token,
                                       approval_token_expires_at, approved_at, rejected_reason,
                                       approval_remarks, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 applicant_id = excluded.applicant_id,
                 applicant_name = excluded.applicant_name,
                 applicant_email = excluded.applicant_email,
                 total_value = excluded.total_value,
                 applicant_grade = excluded.applicant_grade,
                 duration_days = excluded.duration_days,
                 asset_categories_json = excluded.asset_categories_json,
                 status = excluded.status,
                 approver_email = excluded.approver_email,
                 approved_by_name = excluded.approved_by_name,
                 approval_token = excluded.approval_token,
                 approval_token_expires_at = excluded.approval_token_expires_at,
                 approved_at = excluded.approved_at,
                 rejected_reason = excluded.rejected_reason,
                 approval_remarks = excluded.approval_remarks,
                 updated_at = excluded.updated_at",
        )
        .bind(&record.id.0)
        .bind(&record.applicant_id)
        .bind(&record.applicant_name)
        .bind(&record.applicant_email)
        .bind(record.total_value.to_string())
        .bind(i64::from(record.applicant_grade))
        .bind(i64::from(record.duration_days))
        .bind(categories)
        .bind(record.status.as_str())
        .bind(&record.approver_email)
        .bind(&record.approved_by_name)
        .bind(&record.approval_token)
        .bind(record.approval_token_expires_at.map(|dt| dt.to_rfc3339()))
        .bind(record.approved_at.map(|dt| dt.to_rfc3339()))
        .bind(&record.rejected_reason)
        .bind(&record.approval_remarks)
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Assignment write guarded by the status the request must still hold.
    async fn write_assignment(
        &self,
        id: &RequestId,
        expected: RequestStatus,
        assignment: &ReviewAssignment,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE loan_request
             SET status = 'under_review',
                 approver_email = ?,
                 approved_by_name = ?,
                 approval_token = ?,
                 approval_token_expires_at = ?,
                 updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(&assignment.approver_email)
        .bind(&assignment.approved_by_name)
        .bind(&assignment.approval_token)
        .bind(assignment.approval_token_expires_at.to_rfc3339())
        .bind(assignment.assigned_at.to_rfc3339())
        .bind(&id.0)
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Status write and token clear share one UPDATE whose WHERE clause is
    /// the guard, so a second redemption finds nothing to change.
    async fn decide(
        &self,
        id: &RequestId,
        guard: DecisionGuard<'_>,
        write: &DecisionWrite,
    ) -> Result<bool, RepositoryError> {
        let (decided_by_name, decided_by_email) = match &write.decided_by {
            Some(decided_by) => (Some(decided_by.name.as_str()), Some(decided_by.email.as_str())),
            None => (None, None),
        };

        let mut tx = self.pool.begin().await?;

        let base = "UPDATE loan_request
             SET status = ?,
                 approved_at = ?,
                 rejected_reason = ?,
                 approval_remarks = ?,
                 approved_by_name = COALESCE(?, approved_by_name),
                 approver_email = COALESCE(?, approver_email),
                 approval_token = NULL,
                 approval_token_expires_at = NULL,
                 updated_at = ?
             WHERE id = ? AND status = 'under_review'";
        let statement = match guard {
            DecisionGuard::Token(_) => format!("{base} AND approval_token = ?"),
            DecisionGuard::Pending => base.to_owned(),
        };

        let mut query = sqlx::query(&statement)
            .bind(write.status.as_str())
            .bind(write.approved_at.map(|dt| dt.to_rfc3339()))
            .bind(&write.rejected_reason)
            .bind(&write.approval_remarks)
            .bind(decided_by_name)
            .bind(decided_by_email)
            .bind(write.decided_at.to_rfc3339())
            .bind(&id.0);
        if let DecisionGuard::Token(token) = guard {
            query = query.bind(token);
        }

        let updated = query.execute(&mut *tx).await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }
}

fn row_to_request(row: &sqlx::sqlite::SqliteRow) -> Result<RequestRecord, RepositoryError> {
    let id: String = row.try_get("id").map_err(decode_error)?;
    let total_value_raw: String = row.try_get("total_value").map_err(decode_error)?;
    let applicant_grade: i64 = row.try_get("applicant_grade").map_err(decode_error)?;
    let duration_days: i64 = row.try_get("duration_days").map_err(decode_error)?;
    let categories_json: String = row.try_get("asset_categories_json").map_err(decode_error)?;
    let status_raw: String = row.try_get("status").map_err(decode_error)?;
    let expires_at_raw: Option<String> =
        row.try_get("approval_token_expires_at").map_err(decode_error)?;
    let approved_at_raw: Option<String> = row.try_get("approved_at").map_err(decode_error)?;
    let created_at_raw: String = row.try_get("created_at").map_err(decode_error)?;
    let updated_at_raw: String = row.try_get("updated_at").map_err(decode_error)?;

    let status = RequestStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown request status `{status_raw}`")))?;

    Ok(RequestRecord {
        id: RequestId(id),
        applicant_id: row.try_get("applicant_id").map_err(decode_error)?,
        applicant_name: row.try_get("applicant_name").map_err(decode_error)?,
        applicant_email: row.try_get("applicant_email").map_err(decode_error)?,
        total_value: Decimal::from_str(&total_value_raw).map_err(decode_error)?,
        applicant_grade: u8::try_from(applicant_grade).map_err(decode_error)?,
        duration_days: u32::try_from(duration_days).map_err(decode_error)?,
        asset_categories: serde_json::from_str(&categories_json).map_err(decode_error)?,
        status,
        approver_email: row.try_get("approver_email").map_err(decode_error)?,
        approved_by_name: row.try_get("approved_by_name").map_err(decode_error)?,
        approval_token: row.try_get("approval_token").map_err(decode_error)?,
        approval_token_expires_at: parse_optional_timestamp(
            "approval_token_expires_at",
            expires_at_raw,
        )?,
        approved_at: parse_optional_timestamp("approved_at", approved_at_raw)?,
        rejected_reason: row.try_get("rejected_reason").map_err(decode_error)?,
        approval_remarks: row.try_get("approval_remarks").map_err(decode_error)?,
        created_at: parse_timestamp("created_at", &created_at_raw)?,
        updated_at: parse_timestamp("updated_at", &updated_at_raw)?,
    })
}

#[async_trait]
impl RequestStore for SqlRequestRepository {
    async fn find_by_id(&self, id: &RequestId) -> Result<Option<RequestRecord>, ApplicationError> {
        Ok(self.fetch_by_id(id).await?)
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<RequestRecord>, ApplicationError> {
        Ok(self.fetch_by_token(token).await?)
    }

    async fn save(&self, record: RequestRecord) -> Result<(), ApplicationError> {
        Ok(self.upsert(&record).await?)
    }

    async fn assign_for_review(
        &self,
        id: &RequestId,
        assignment: &ReviewAssignment,
    ) -> Result<bool, ApplicationError> {
        Ok(self.write_assignment(id, RequestStatus::Submitted, assignment).await?)
    }

    async fn reissue_review(
        &self,
        id: &RequestId,
        assignment: &ReviewAssignment,
    ) -> Result<bool, ApplicationError> {
        Ok(self.write_assignment(id, RequestStatus::UnderReview, assignment).await?)
    }

    async fn apply_decision(
        &self,
        id: &RequestId,
        guard: DecisionGuard<'_>,
        write: &DecisionWrite,
    ) -> Result<bool, ApplicationError> {
        Ok(self.decide(id, guard, write).await?)
    }
}
