pub mod approver;
pub mod request;
pub mod rule;
