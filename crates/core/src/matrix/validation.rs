use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::domain::rule::ApprovalRule;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleViolation {
    MissingId { index: usize },
    DuplicateId { rule_id: String },
    MissingName { rule_id: String },
    NoApproverMechanism { rule_id: String },
    InvertedRange { rule_id: String, field: String },
    NegativeValueBound { rule_id: String },
    BlankApproverId { rule_id: String },
}

impl RuleViolation {
    pub fn reason(&self) -> String {
        match self {
            Self::MissingId { index } => format!("rule at position {index} has no id"),
            Self::DuplicateId { rule_id } => format!("rule id `{rule_id}` appears more than once"),
            Self::MissingName { rule_id } => format!("rule `{rule_id}` has no name"),
            Self::NoApproverMechanism { rule_id } => {
                format!("rule `{rule_id}` names no approver role, grade or user")
            }
            Self::InvertedRange { rule_id, field } => {
                format!("rule `{rule_id}` has {field}_min greater than {field}_max")
            }
            Self::NegativeValueBound { rule_id } => {
                format!("rule `{rule_id}` has a negative asset value bound")
            }
            Self::BlankApproverId { rule_id } => {
                format!("rule `{rule_id}` lists a blank approver user id")
            }
        }
    }
}

impl std::fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason())
    }
}

/// Checks one rule in isolation.
pub fn validate_rule(rule: &ApprovalRule) -> Vec<RuleViolation> {
    let mut violations = Vec::new();
    let rule_id = rule.id.trim().to_owned();

    if rule.name.trim().is_empty() {
        violations.push(RuleViolation::MissingName { rule_id: rule_id.clone() });
    }

    if rule.approvers.is_empty() {
        violations.push(RuleViolation::NoApproverMechanism { rule_id: rule_id.clone() });
    }

    if rule.approvers.user_ids.iter().any(|id| id.trim().is_empty()) {
        violations.push(RuleViolation::BlankApproverId { rule_id: rule_id.clone() });
    }

    let negative = [rule.asset_value_min, rule.asset_value_max]
        .into_iter()
        .flatten()
        .any(|bound| bound.is_sign_negative());
    if negative {
        violations.push(RuleViolation::NegativeValueBound { rule_id: rule_id.clone() });
    }

    if inverted(rule.asset_value_min, rule.asset_value_max) {
        violations.push(RuleViolation::InvertedRange {
            rule_id: rule_id.clone(),
            field: "asset_value".to_owned(),
        });
    }
    if inverted(rule.grade_min, rule.grade_max) {
        violations
            .push(RuleViolation::InvertedRange { rule_id: rule_id.clone(), field: "grade".to_owned() });
    }
    if inverted(rule.duration_min, rule.duration_max) {
        violations.push(RuleViolation::InvertedRange { rule_id, field: "duration".to_owned() });
    }

    violations
}

/// Checks every rule plus cross-rule constraints. Returns all violations
/// found rather than stopping at the first.
pub fn validate_rules(rules: &[ApprovalRule]) -> Result<(), Vec<RuleViolation>> {
    let mut violations = Vec::new();
    let mut seen = HashSet::new();

    for (index, rule) in rules.iter().enumerate() {
        let rule_id = rule.id.trim();
        if rule_id.is_empty() {
            violations.push(RuleViolation::MissingId { index });
        } else if !seen.insert(rule_id.to_owned()) {
            violations.push(RuleViolation::DuplicateId { rule_id: rule_id.to_owned() });
        }
        violations.extend(validate_rule(rule));
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

fn inverted<T: PartialOrd>(min: Option<T>, max: Option<T>) -> bool {
    matches!((min, max), (Some(min), Some(max)) if min > max)
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{validate_rule, validate_rules, RuleViolation};
    use crate::domain::approver::UserRole;
    use crate::domain::rule::{ApprovalRule, ApproverSpec};

    fn valid_rule(id: &str) -> ApprovalRule {
        ApprovalRule {
            id: id.to_owned(),
            name: "Standard".to_owned(),
            priority: 10,
            asset_value_min: Some(Decimal::ZERO),
            asset_value_max: Some(Decimal::new(5000, 0)),
            grade_min: Some(41),
            grade_max: Some(43),
            duration_min: None,
            duration_max: Some(30),
            asset_categories: vec!["laptop".to_owned()],
            approvers: ApproverSpec { roles: vec![UserRole::Approver], ..ApproverSpec::default() },
            approval_level: 1,
            required: true,
        }
    }

    #[test]
    fn well_formed_rule_passes() {
        assert!(validate_rule(&valid_rule("r-1")).is_empty());
    }

    #[test]
    fn rule_without_approver_mechanism_is_rejected() {
        let mut rule = valid_rule("r-1");
        rule.approvers = ApproverSpec::default();

        assert_eq!(validate_rule(&rule), vec![RuleViolation::NoApproverMechanism {
            rule_id: "r-1".to_owned()
        }]);
    }

    #[test]
    fn equal_bounds_are_allowed_but_inverted_bounds_are_not() {
        let mut rule = valid_rule("r-1");
        rule.grade_min = Some(44);
        rule.grade_max = Some(44);
        assert!(validate_rule(&rule).is_empty());

        rule.duration_min = Some(31);
        rule.asset_value_min = Some(Decimal::new(6000, 0));
        let violations = validate_rule(&rule);
        assert!(violations.contains(&RuleViolation::InvertedRange {
            rule_id: "r-1".to_owned(),
            field: "duration".to_owned(),
        }));
        assert!(violations.contains(&RuleViolation::InvertedRange {
            rule_id: "r-1".to_owned(),
            field: "asset_value".to_owned(),
        }));
    }

    #[test]
    fn matrix_validation_reports_every_problem() {
        let mut broken = valid_rule("r-2");
        broken.approvers = ApproverSpec::default();
        let rules = vec![valid_rule("r-1"), valid_rule("r-1"), broken, valid_rule(" ")];

        let violations = validate_rules(&rules).expect_err("matrix is invalid");

        assert!(violations.contains(&RuleViolation::DuplicateId { rule_id: "r-1".to_owned() }));
        assert!(violations
            .contains(&RuleViolation::NoApproverMechanism { rule_id: "r-2".to_owned() }));
        assert!(violations.contains(&RuleViolation::MissingId { index: 3 }));
    }
}
