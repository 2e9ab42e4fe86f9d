use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::request::{RequestId, RequestStatus};
use crate::errors::{ApplicationError, InterfaceError, InterfaceErrorKind};
use crate::token::TokenError;

/// Where a decision came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionChannel {
    EmailLink,
    Portal,
}

impl DecisionChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmailLink => "email_link",
            Self::Portal => "portal",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("request {0} not found")]
    RequestNotFound(RequestId),
    #[error("request {request_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition { request_id: RequestId, from: RequestStatus, to: RequestStatus },
    #[error(
        "no approver found for request {request_id} (applicant grade {applicant_grade}, required grade {required_grade})"
    )]
    NoApproverFound { request_id: RequestId, applicant_grade: u8, required_grade: u8 },
    #[error("approval token does not match any pending request")]
    InvalidToken,
    #[error("approval token for request {request_id} has expired")]
    ExpiredToken { request_id: RequestId },
    #[error("request {request_id} has already been decided")]
    AlreadyDecided { request_id: RequestId, channel: DecisionChannel },
    #[error("user {user_id} is not allowed to decide approval requests")]
    NotAuthorized { user_id: String },
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Application(#[from] ApplicationError),
}

impl WorkflowError {
    /// Stable name for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestNotFound(_) => "request_not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NoApproverFound { .. } => "no_approver_found",
            Self::InvalidToken => "invalid_token",
            Self::ExpiredToken { .. } => "expired_token",
            Self::AlreadyDecided { .. } => "already_decided",
            Self::NotAuthorized { .. } => "not_authorized",
            Self::Token(_) => "token",
            Self::Application(_) => "application",
        }
    }

    /// Every email-link failure collapses into one "link no longer valid"
    /// outcome; the precise variant only reaches the logs.
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        use InterfaceErrorKind as Kind;

        let (kind, message) = match self {
            Self::InvalidToken
            | Self::ExpiredToken { .. }
            | Self::AlreadyDecided { channel: DecisionChannel::EmailLink, .. } => {
                (Kind::LinkInvalid, "approval link rejected".to_owned())
            }
            Self::AlreadyDecided { request_id, channel: DecisionChannel::Portal } => {
                (Kind::Conflict, format!("request {request_id} already decided"))
            }
            Self::InvalidTransition { request_id, from, .. } if from.is_terminal() => {
                (Kind::Conflict, format!("request {request_id} already decided"))
            }
            error @ (Self::InvalidTransition { .. } | Self::NoApproverFound { .. }) => {
                (Kind::Unprocessable, error.to_string())
            }
            Self::RequestNotFound(request_id) => {
                (Kind::NotFound, format!("request {request_id} not found"))
            }
            Self::NotAuthorized { user_id } => {
                (Kind::Forbidden, format!("user {user_id} may not decide approvals"))
            }
            Self::Token(error) => (Kind::Internal, error.to_string()),
            Self::Application(error) => return error.into_interface(correlation_id),
        };
        InterfaceError::new(kind, message, correlation_id)
    }
}
