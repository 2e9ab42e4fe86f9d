use serde::{Deserialize, Serialize};

/// Directory role of a user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Applicant,
    Approver,
    Admin,
    Superuser,
}

impl UserRole {
    pub const APPROVER_ELIGIBLE: [UserRole; 3] =
        [UserRole::Approver, UserRole::Admin, UserRole::Superuser];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applicant => "applicant",
            Self::Approver => "approver",
            Self::Admin => "admin",
            Self::Superuser => "superuser",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "applicant" | "user" => Some(Self::Applicant),
            "approver" => Some(Self::Approver),
            "admin" => Some(Self::Admin),
            "superuser" => Some(Self::Superuser),
            _ => None,
        }
    }

    /// Any approver-eligible user may decide any pending request.
    pub fn can_decide(&self) -> bool {
        Self::APPROVER_ELIGIBLE.contains(self)
    }

    pub fn can_manage_matrix(&self) -> bool {
        matches!(self, Self::Admin | Self::Superuser)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Approver {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: UserRole,
    pub grade: Option<u8>,
}

#[cfg(test)]
mod tests {
    use super::UserRole;

    #[test]
    fn only_approver_roles_may_decide() {
        assert!(!UserRole::Applicant.can_decide());
        assert!(UserRole::Approver.can_decide());
        assert!(UserRole::Admin.can_decide());
        assert!(UserRole::Superuser.can_decide());
    }

    #[test]
    fn matrix_management_requires_admin() {
        assert!(!UserRole::Approver.can_manage_matrix());
        assert!(UserRole::Admin.can_manage_matrix());
        assert!(UserRole::Superuser.can_manage_matrix());
    }

    #[test]
    fn role_parsing_is_case_insensitive() {
        assert_eq!(UserRole::parse(" Superuser "), Some(UserRole::Superuser));
        assert_eq!(UserRole::parse("user"), Some(UserRole::Applicant));
        assert_eq!(UserRole::parse("auditor"), None);
    }
}
