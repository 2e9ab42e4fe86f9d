use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::approver::UserRole;

/// Who may approve requests matched by a rule. Each mechanism is resolved
/// independently against the user directory.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverSpec {
    #[serde(default)]
    pub roles: Vec<UserRole>,
    #[serde(default)]
    pub grades: Vec<u8>,
    #[serde(default)]
    pub user_ids: Vec<String>,
}

impl ApproverSpec {
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty() && self.grades.is_empty() && self.user_ids.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub id: String,
    pub name: String,
    /// Carried for display; matching and resolution ignore it.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub asset_value_min: Option<Decimal>,
    #[serde(default)]
    pub asset_value_max: Option<Decimal>,
    #[serde(default)]
    pub grade_min: Option<u8>,
    #[serde(default)]
    pub grade_max: Option<u8>,
    #[serde(default)]
    pub duration_min: Option<u32>,
    #[serde(default)]
    pub duration_max: Option<u32>,
    #[serde(default)]
    pub asset_categories: Vec<String>,
    pub approvers: ApproverSpec,
    #[serde(default = "default_level")]
    pub approval_level: u32,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_level() -> u32 {
    1
}

fn default_required() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalMatrix {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
    pub rules: Vec<ApprovalRule>,
}
