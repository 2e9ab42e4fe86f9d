use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::domain::approver::{Approver, UserRole};
use crate::errors::ApplicationError;

/// Lookup criteria for active users. Every non-empty criterion must hold; a
/// user satisfies a criterion when any of its values matches.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryQuery {
    pub roles: Vec<UserRole>,
    pub grades: Vec<u8>,
    pub ids: Vec<String>,
}

impl DirectoryQuery {
    pub fn by_roles(roles: impl Into<Vec<UserRole>>) -> Self {
        Self { roles: roles.into(), ..Self::default() }
    }

    pub fn by_grades(grades: impl Into<Vec<u8>>) -> Self {
        Self { grades: grades.into(), ..Self::default() }
    }

    pub fn by_ids(ids: impl Into<Vec<String>>) -> Self {
        Self { ids: ids.into(), ..Self::default() }
    }

    pub fn with_grades(mut self, grades: impl Into<Vec<u8>>) -> Self {
        self.grades = grades.into();
        self
    }

    pub fn matches(&self, approver: &Approver) -> bool {
        if !self.roles.is_empty() && !self.roles.contains(&approver.role) {
            return false;
        }
        if !self.grades.is_empty()
            && !approver.grade.map(|grade| self.grades.contains(&grade)).unwrap_or(false)
        {
            return false;
        }
        if !self.ids.is_empty() && !self.ids.iter().any(|id| id == &approver.id) {
            return false;
        }
        true
    }
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Active users matching `query`, ordered by id. An empty query matches
    /// every active user.
    async fn find_active(&self, query: &DirectoryQuery) -> Result<Vec<Approver>, ApplicationError>;

    /// An active user by id.
    async fn find_by_id(&self, id: &str) -> Result<Option<Approver>, ApplicationError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub approver: Approver,
    pub active: bool,
}

#[derive(Debug, Default)]
pub struct InMemoryUserDirectory {
    entries: RwLock<Vec<DirectoryEntry>>,
}

impl InMemoryUserDirectory {
    pub fn with_active(approvers: Vec<Approver>) -> Self {
        let entries =
            approvers.into_iter().map(|approver| DirectoryEntry { approver, active: true }).collect();
        Self { entries: RwLock::new(entries) }
    }

    pub async fn insert(&self, approver: Approver, active: bool) {
        let mut entries = self.entries.write().await;
        entries.retain(|entry| entry.approver.id != approver.id);
        entries.push(DirectoryEntry { approver, active });
    }

    pub async fn deactivate(&self, id: &str) {
        let mut entries = self.entries.write().await;
        for entry in entries.iter_mut().filter(|entry| entry.approver.id == id) {
            entry.active = false;
        }
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_active(&self, query: &DirectoryQuery) -> Result<Vec<Approver>, ApplicationError> {
        let entries = self.entries.read().await;
        let mut found: Vec<Approver> = entries
            .iter()
            .filter(|entry| entry.active && query.matches(&entry.approver))
            .map(|entry| entry.approver.clone())
            .collect();
        found.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(found)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Approver>, ApplicationError> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .find(|entry| entry.active && entry.approver.id == id)
            .map(|entry| entry.approver.clone()))
    }
}
