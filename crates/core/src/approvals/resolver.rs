use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::approvals::grade::{required_approver_grade, TOP_REFERENCE_GRADE};
use crate::approvals::matcher::matching_rules;
use crate::directory::{DirectoryQuery, UserDirectory};
use crate::domain::approver::{Approver, UserRole};
use crate::domain::request::RequestFacts;
use crate::domain::rule::{ApprovalMatrix, ApprovalRule};
use crate::errors::ApplicationError;

/// A rule that contributed an approver to a union resolution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverSource {
    pub rule_id: String,
    pub rule_name: String,
    pub approval_level: u32,
    pub required: bool,
}

/// One approver identity with every matching rule that named them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedApprover {
    pub approver: Approver,
    pub sources: Vec<ApproverSource>,
}

impl ResolvedApprover {
    pub fn levels(&self) -> Vec<u32> {
        let mut levels: Vec<u32> =
            self.sources.iter().map(|source| source.approval_level).collect();
        levels.sort_unstable();
        levels.dedup();
        levels
    }
}

/// Which cascade tier produced the single approver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeTier {
    RequiredGrade,
    TopReferenceGrade,
    AnySuperuser,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverAssignment {
    pub approver: Approver,
    pub required_grade: u8,
    pub tier: CascadeTier,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error(
        "no approver found for applicant grade {applicant_grade} (required grade {required_grade}, top grade and superuser fallbacks exhausted)"
    )]
    NoApproverFound { applicant_grade: u8, required_grade: u8 },
    #[error(transparent)]
    Application(#[from] ApplicationError),
}

#[derive(Clone)]
pub struct ApproverResolver {
    directory: Arc<dyn UserDirectory>,
}

impl ApproverResolver {
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &Arc<dyn UserDirectory> {
        &self.directory
    }

    /// Union of approvers named by every rule of `matrix` that matches
    /// `facts`, one entry per approver identity in first-seen order.
    pub async fn approvers_for_request(
        &self,
        matrix: &ApprovalMatrix,
        facts: &RequestFacts,
    ) -> Result<Vec<ResolvedApprover>, ApplicationError> {
        let mut resolved: Vec<ResolvedApprover> = Vec::new();

        for rule in matching_rules(matrix, facts) {
            let source = ApproverSource {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                approval_level: rule.approval_level,
                required: rule.required,
            };

            for approver in self.approvers_for_rule(rule).await? {
                match resolved.iter_mut().find(|entry| entry.approver.id == approver.id) {
                    Some(entry) => {
                        if !entry.sources.iter().any(|known| known.rule_id == source.rule_id) {
                            entry.sources.push(source.clone());
                        }
                    }
                    None => resolved
                        .push(ResolvedApprover { approver, sources: vec![source.clone()] }),
                }
            }
        }

        Ok(resolved)
    }

    /// Role, grade and explicit-id lookups run as separate directory
    /// queries and their results are concatenated.
    async fn approvers_for_rule(
        &self,
        rule: &ApprovalRule,
    ) -> Result<Vec<Approver>, ApplicationError> {
        let spec = &rule.approvers;
        let mut queries = Vec::new();
        if !spec.roles.is_empty() {
            queries.push(DirectoryQuery::by_roles(spec.roles.clone()));
        }
        if !spec.grades.is_empty() {
            queries.push(DirectoryQuery::by_grades(spec.grades.clone()));
        }
        if !spec.user_ids.is_empty() {
            queries.push(DirectoryQuery::by_ids(spec.user_ids.clone()));
        }

        let mut approvers = Vec::new();
        for query in &queries {
            approvers.extend(self.directory.find_active(query).await?);
        }

        Ok(approvers)
    }

    /// Single approver for the cascading path: the required grade, then the
    /// top reference grade, then any superuser.
    pub async fn determine_approver(
        &self,
        applicant_grade: u8,
        value: Decimal,
    ) -> Result<ApproverAssignment, ResolveError> {
        let required_grade = required_approver_grade(applicant_grade, value);
        let eligible = DirectoryQuery::by_roles(UserRole::APPROVER_ELIGIBLE);

        let tiers = [
            (CascadeTier::RequiredGrade, eligible.clone().with_grades([required_grade])),
            (CascadeTier::TopReferenceGrade, eligible.with_grades([TOP_REFERENCE_GRADE])),
            (CascadeTier::AnySuperuser, DirectoryQuery::by_roles([UserRole::Superuser])),
        ];

        for (tier, query) in tiers {
            let candidates = self.directory.find_active(&query).await?;
            if let Some(approver) = candidates.into_iter().next() {
                debug!(
                    event_name = "approval.resolver.assigned",
                    applicant_grade,
                    required_grade,
                    tier = ?tier,
                    approver_id = %approver.id,
                    "approver resolved"
                );
                return Ok(ApproverAssignment { approver, required_grade, tier });
            }
        }

        warn!(
            event_name = "approval.resolver.no_approver",
            applicant_grade,
            required_grade,
            "no approver found at any cascade tier"
        );
        Err(ResolveError::NoApproverFound { applicant_grade, required_grade })
    }
}
