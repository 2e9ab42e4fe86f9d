use chrono::Utc;
use rust_decimal::Decimal;

use crate::domain::approver::UserRole;
use crate::domain::rule::{ApprovalMatrix, ApprovalRule, ApproverSpec};

/// Matrix installed the first time the store finds nothing persisted.
pub fn default_matrix() -> ApprovalMatrix {
    ApprovalMatrix {
        version: 1,
        updated_at: Utc::now(),
        updated_by: "seed".to_owned(),
        rules: vec![
            ApprovalRule {
                id: "standard-low-value".to_owned(),
                name: "Standard loan up to 5,000".to_owned(),
                priority: 10,
                asset_value_min: Some(Decimal::ZERO),
                asset_value_max: Some(Decimal::new(5_000, 0)),
                grade_min: Some(41),
                grade_max: None,
                duration_min: None,
                duration_max: Some(30),
                asset_categories: Vec::new(),
                approvers: ApproverSpec { grades: vec![44, 48], ..ApproverSpec::default() },
                approval_level: 1,
                required: true,
            },
            ApprovalRule {
                id: "standard-mid-value".to_owned(),
                name: "Loan between 5,000 and 20,000".to_owned(),
                priority: 20,
                asset_value_min: Some(Decimal::new(5_000, 0)),
                asset_value_max: Some(Decimal::new(20_000, 0)),
                grade_min: Some(41),
                grade_max: None,
                duration_min: None,
                duration_max: None,
                asset_categories: Vec::new(),
                approvers: ApproverSpec { grades: vec![48, 52], ..ApproverSpec::default() },
                approval_level: 1,
                required: true,
            },
            ApprovalRule {
                id: "high-value".to_owned(),
                name: "Loan above 20,000".to_owned(),
                priority: 30,
                asset_value_min: Some(Decimal::new(20_000, 0)),
                asset_value_max: None,
                grade_min: None,
                grade_max: None,
                duration_min: None,
                duration_max: None,
                asset_categories: Vec::new(),
                approvers: ApproverSpec {
                    roles: vec![UserRole::Admin],
                    grades: vec![54],
                    ..ApproverSpec::default()
                },
                approval_level: 2,
                required: true,
            },
            ApprovalRule {
                id: "long-term".to_owned(),
                name: "Loan longer than 90 days".to_owned(),
                priority: 40,
                asset_value_min: None,
                asset_value_max: None,
                grade_min: None,
                grade_max: None,
                duration_min: Some(91),
                duration_max: None,
                asset_categories: Vec::new(),
                approvers: ApproverSpec { roles: vec![UserRole::Admin], ..ApproverSpec::default() },
                approval_level: 2,
                required: false,
            },
            ApprovalRule {
                id: "junior-applicant".to_owned(),
                name: "Applicant below grade 41".to_owned(),
                priority: 50,
                asset_value_min: None,
                asset_value_max: None,
                grade_min: None,
                grade_max: Some(40),
                duration_min: None,
                duration_max: None,
                asset_categories: Vec::new(),
                approvers: ApproverSpec {
                    roles: vec![UserRole::Superuser],
                    grades: vec![54],
                    ..ApproverSpec::default()
                },
                approval_level: 1,
                required: true,
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::default_matrix;
    use crate::matrix::validate_rules;

    #[test]
    fn default_matrix_is_valid() {
        assert!(validate_rules(&default_matrix().rules).is_ok());
    }
}
