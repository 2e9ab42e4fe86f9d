pub mod approvals;
pub mod config;
pub mod directory;
pub mod domain;
pub mod errors;
pub mod matrix;
pub mod notify;
pub mod token;
pub mod workflow;

pub use approvals::{
    required_approver_grade, ApproverAssignment, ApproverResolver, CascadeTier, ResolvedApprover,
};
pub use directory::{DirectoryQuery, UserDirectory};
pub use domain::approver::{Approver, UserRole};
pub use domain::request::{RequestFacts, RequestId, RequestRecord, RequestStatus};
pub use domain::rule::{ApprovalMatrix, ApprovalRule, ApproverSpec};
pub use errors::{ApplicationError, DomainError, InterfaceError, InterfaceErrorKind};
pub use matrix::{ApprovalMatrixStore, MatrixError, MatrixSource, RuleViolation};
pub use notify::{NotificationEvent, NotificationPort};
pub use token::{ApprovalTokenService, TokenVerification};
pub use workflow::{
    ApprovalWorkflow, DecisionChannel, DecisionOutcome, RequestStore, RoutedRequest,
    WorkflowError, WorkflowSettings,
};
