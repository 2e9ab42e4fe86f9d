pub mod grade;
pub mod matcher;
pub mod resolver;

pub use grade::{required_approver_grade, TOP_REFERENCE_GRADE};
pub use matcher::matching_rules;
pub use resolver::{
    ApproverAssignment, ApproverResolver, ApproverSource, CascadeTier, ResolveError,
    ResolvedApprover,
};

pub(crate) fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}
