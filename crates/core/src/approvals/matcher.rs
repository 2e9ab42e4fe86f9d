use crate::approvals::normalize_key;
use crate::domain::request::RequestFacts;
use crate::domain::rule::{ApprovalMatrix, ApprovalRule};

impl ApprovalRule {
    /// True when every bound the rule declares holds for `facts`. Bounds are
    /// inclusive and an absent bound leaves that side open.
    pub fn matches(&self, facts: &RequestFacts) -> bool {
        if !within(self.asset_value_min, self.asset_value_max, facts.total_value) {
            return false;
        }

        if !within(self.grade_min, self.grade_max, facts.applicant_grade) {
            return false;
        }

        if !within(self.duration_min, self.duration_max, facts.duration_days) {
            return false;
        }

        if !self.asset_categories.is_empty() {
            let overlaps = self.asset_categories.iter().map(|category| normalize_key(category)).any(
                |category| {
                    facts.asset_categories.iter().any(|requested| normalize_key(requested) == category)
                },
            );
            if !overlaps {
                return false;
            }
        }

        true
    }
}

/// Every rule of the matrix that applies to `facts`, in matrix order. All
/// matches are returned; `priority` does not short-circuit.
pub fn matching_rules<'a>(matrix: &'a ApprovalMatrix, facts: &RequestFacts) -> Vec<&'a ApprovalRule> {
    matrix.rules.iter().filter(|rule| rule.matches(facts)).collect()
}

fn within<T: PartialOrd>(min: Option<T>, max: Option<T>, value: T) -> bool {
    if let Some(min) = min {
        if value < min {
            return false;
        }
    }
    if let Some(max) = max {
        if value > max {
            return false;
        }
    }
    true
}
