use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Submitted,
    UnderReview,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::UnderReview => "under_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "submitted" => Some(Self::Submitted),
            "under_review" => Some(Self::UnderReview),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }

    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (Self::Submitted, Self::UnderReview)
                | (Self::UnderReview, Self::Approved)
                | (Self::UnderReview, Self::Rejected)
        )
    }

    pub fn ensure_transition(&self, next: RequestStatus) -> Result<(), DomainError> {
        if self.can_transition_to(next) {
            return Ok(());
        }
        Err(DomainError::InvalidRequestTransition { from: *self, to: next })
    }
}

/// The attributes of a request that approval rules are evaluated against.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFacts {
    pub total_value: Decimal,
    pub applicant_grade: u8,
    pub duration_days: u32,
    pub asset_categories: Vec<String>,
}

/// A loan request as persisted by the request store.
///
/// The first block of fields is owned by the submitting side; the approval
/// workflow only ever writes the status block below it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: RequestId,
    pub applicant_id: String,
    pub applicant_name: String,
    pub applicant_email: String,
    pub total_value: Decimal,
    pub applicant_grade: u8,
    pub duration_days: u32,
    pub asset_categories: Vec<String>,

    pub status: RequestStatus,
    pub approver_email: Option<String>,
    pub approved_by_name: Option<String>,
    #[serde(skip_serializing)]
    pub approval_token: Option<String>,
    pub approval_token_expires_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_reason: Option<String>,
    pub approval_remarks: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RequestRecord {
    pub fn submitted(
        id: RequestId,
        applicant_id: impl Into<String>,
        applicant_name: impl Into<String>,
        applicant_email: impl Into<String>,
        facts: RequestFacts,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            applicant_id: applicant_id.into(),
            applicant_name: applicant_name.into(),
            applicant_email: applicant_email.into(),
            total_value: facts.total_value,
            applicant_grade: facts.applicant_grade,
            duration_days: facts.duration_days,
            asset_categories: facts.asset_categories,
            status: RequestStatus::Submitted,
            approver_email: None,
            approved_by_name: None,
            approval_token: None,
            approval_token_expires_at: None,
            approved_at: None,
            rejected_reason: None,
            approval_remarks: None,
            created_at,
            updated_at: created_at,
        }
    }

    pub fn facts(&self) -> RequestFacts {
        RequestFacts {
            total_value: self.total_value,
            applicant_grade: self.applicant_grade,
            duration_days: self.duration_days,
            asset_categories: self.asset_categories.clone(),
        }
    }
}

/// Values written when a request is handed to its approver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReviewAssignment {
    pub approver_email: String,
    pub approved_by_name: String,
    pub approval_token: String,
    pub approval_token_expires_at: DateTime<Utc>,
    pub assigned_at: DateTime<Utc>,
}

impl ReviewAssignment {
    pub fn apply_to(&self, record: &mut RequestRecord) {
        record.status = RequestStatus::UnderReview;
        record.approver_email = Some(self.approver_email.clone());
        record.approved_by_name = Some(self.approved_by_name.clone());
        record.approval_token = Some(self.approval_token.clone());
        record.approval_token_expires_at = Some(self.approval_token_expires_at);
        record.updated_at = self.assigned_at;
    }
}

/// Precondition checked inside the same write that applies a decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionGuard<'a> {
    /// The stored token must still equal this value.
    Token(&'a str),
    /// Any pending request may be decided.
    Pending,
}

/// Values written when a request reaches a terminal state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecisionWrite {
    pub status: RequestStatus,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_reason: Option<String>,
    pub approval_remarks: Option<String>,
    /// Replaces the routed approver when the decision comes from someone else.
    pub decided_by: Option<DecidedBy>,
    pub decided_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecidedBy {
    pub name: String,
    pub email: String,
}

impl DecisionWrite {
    pub fn new(approved: bool, remarks: Option<String>, decided_at: DateTime<Utc>) -> Self {
        let remarks = remarks.map(|value| value.trim().to_owned()).filter(|value| !value.is_empty());
        if approved {
            Self {
                status: RequestStatus::Approved,
                approved_at: Some(decided_at),
                rejected_reason: None,
                approval_remarks: remarks,
                decided_by: None,
                decided_at,
            }
        } else {
            Self {
                status: RequestStatus::Rejected,
                approved_at: None,
                rejected_reason: Some(remarks.unwrap_or_else(|| "no reason given".to_owned())),
                approval_remarks: None,
                decided_by: None,
                decided_at,
            }
        }
    }

    pub fn decided_by(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.decided_by = Some(DecidedBy { name: name.into(), email: email.into() });
        self
    }

    /// Applies the write to an in-memory copy of the record.
    pub fn apply_to(&self, record: &mut RequestRecord) {
        record.status = self.status;
        record.approved_at = self.approved_at;
        record.rejected_reason = self.rejected_reason.clone();
        record.approval_remarks = self.approval_remarks.clone();
        if let Some(decided_by) = &self.decided_by {
            record.approved_by_name = Some(decided_by.name.clone());
            record.approver_email = Some(decided_by.email.clone());
        }
        record.approval_token = None;
        record.approval_token_expires_at = None;
        record.updated_at = self.decided_at;
    }
}
