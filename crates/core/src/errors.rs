use thiserror::Error;

use crate::domain::request::RequestStatus;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("loan request cannot move from {from:?} to {to:?}")]
    InvalidRequestTransition { from: RequestStatus, to: RequestStatus },
}

/// Failures raised below the workflow: domain rules and storage.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("storage error: {0}")]
    Persistence(String),
}

/// Client-facing error class. Each kind maps to one HTTP status at the edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InterfaceErrorKind {
    BadRequest,
    Forbidden,
    NotFound,
    Conflict,
    Unprocessable,
    /// Any email-link failure, whatever the underlying reason.
    LinkInvalid,
    ServiceUnavailable,
    Internal,
}

impl InterfaceErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Unprocessable => "unprocessable",
            Self::LinkInvalid => "link_invalid",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Internal => "internal",
        }
    }

    /// Safe to show to end users; never carries internal detail.
    pub fn user_message(self) -> &'static str {
        match self {
            Self::BadRequest => "The request was malformed. Check the submitted values.",
            Self::Forbidden => "Your account may not perform this action.",
            Self::NotFound => "No loan request matches that reference.",
            Self::Conflict => "This loan request has already been decided.",
            Self::Unprocessable => "The loan request cannot be processed in its current state.",
            Self::LinkInvalid => {
                "This approval link is no longer valid. It may have expired or already been used."
            }
            Self::ServiceUnavailable => "Lendroute is temporarily unavailable. Try again shortly.",
            Self::Internal => "Something went wrong on our side.",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{}: {message}", .kind.as_str())]
pub struct InterfaceError {
    pub kind: InterfaceErrorKind,
    /// Operator detail for logs.
    pub message: String,
    pub correlation_id: String,
}

impl InterfaceError {
    pub fn new(
        kind: InterfaceErrorKind,
        message: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self { kind, message: message.into(), correlation_id: correlation_id.into() }
    }

    pub fn user_message(&self) -> &'static str {
        self.kind.user_message()
    }

    /// True for failures operators should hear about.
    pub fn is_server_fault(&self) -> bool {
        matches!(self.kind, InterfaceErrorKind::ServiceUnavailable | InterfaceErrorKind::Internal)
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let kind = match &self {
            // A transition out of a terminal state means someone else decided first.
            Self::Domain(DomainError::InvalidRequestTransition { from, .. }) if from.is_terminal() => {
                InterfaceErrorKind::Conflict
            }
            Self::Domain(_) => InterfaceErrorKind::Unprocessable,
            Self::Persistence(_) => InterfaceErrorKind::ServiceUnavailable,
        };
        InterfaceError::new(kind, self.to_string(), correlation_id)
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::request::RequestStatus;
    use crate::errors::{ApplicationError, DomainError, InterfaceErrorKind};

    #[test]
    fn leaving_a_terminal_state_is_a_conflict() {
        let interface = ApplicationError::from(DomainError::InvalidRequestTransition {
            from: RequestStatus::Approved,
            to: RequestStatus::UnderReview,
        })
        .into_interface("corr-1");

        assert_eq!(interface.kind, InterfaceErrorKind::Conflict);
        assert_eq!(interface.correlation_id, "corr-1");
        assert!(!interface.is_server_fault());
    }

    #[test]
    fn storage_failures_are_reported_as_unavailable_without_detail() {
        let interface =
            ApplicationError::Persistence("database is locked".to_owned()).into_interface("corr-2");

        assert_eq!(interface.kind, InterfaceErrorKind::ServiceUnavailable);
        assert!(interface.is_server_fault());
        assert!(interface.message.contains("database is locked"));
        assert!(!interface.user_message().contains("locked"));
    }

    #[test]
    fn display_names_the_kind() {
        let interface = ApplicationError::Persistence("disk full".to_owned()).into_interface("c");

        assert_eq!(interface.to_string(), "service_unavailable: storage error: disk full");
    }
}
