use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    /// Sent to the routed approver with the decision link.
    ApprovalRequested,
    /// Sent to the applicant once the request reaches a terminal state.
    ApprovalDecided,
    /// Sent to whoever recorded the decision.
    ApprovalConfirmed,
}

impl NotificationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApprovalRequested => "approval_requested",
            Self::ApprovalDecided => "approval_decided",
            Self::ApprovalConfirmed => "approval_confirmed",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("notification delivery failed: {0}")]
pub struct NotificationError(pub String);

/// Outbound delivery of workflow events. Callers treat delivery as best
/// effort: a returned error is logged and never undoes a state change.
#[async_trait]
pub trait NotificationPort: Send + Sync {
    async fn notify(
        &self,
        event: NotificationEvent,
        payload: Map<String, Value>,
    ) -> Result<(), NotificationError>;
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SentNotification {
    pub event: NotificationEvent,
    pub payload: Map<String, Value>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct InMemoryNotificationPort {
    sent: Arc<Mutex<Vec<SentNotification>>>,
    failing: Arc<Mutex<bool>>,
}

impl InMemoryNotificationPort {
    /// A port that records each attempt and then reports a delivery failure.
    pub fn failing() -> Self {
        let port = Self::default();
        port.set_failing(true);
        port
    }

    pub fn set_failing(&self, failing: bool) {
        match self.failing.lock() {
            Ok(mut flag) => *flag = failing,
            Err(poisoned) => *poisoned.into_inner() = failing,
        }
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn sent_events(&self) -> Vec<NotificationEvent> {
        self.sent().into_iter().map(|notification| notification.event).collect()
    }

    fn is_failing(&self) -> bool {
        match self.failing.lock() {
            Ok(flag) => *flag,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl NotificationPort for InMemoryNotificationPort {
    async fn notify(
        &self,
        event: NotificationEvent,
        payload: Map<String, Value>,
    ) -> Result<(), NotificationError> {
        let notification = SentNotification { event, payload, sent_at: Utc::now() };
        match self.sent.lock() {
            Ok(mut sent) => sent.push(notification),
            Err(poisoned) => poisoned.into_inner().push(notification),
        }

        if self.is_failing() {
            return Err(NotificationError(format!("{} delivery refused", event.as_str())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::{InMemoryNotificationPort, NotificationEvent, NotificationPort};

    #[tokio::test]
    async fn in_memory_port_records_events_in_order() {
        let port = InMemoryNotificationPort::default();
        let mut payload = Map::new();
        payload.insert("request_id".to_owned(), json!("LR-1"));

        port.notify(NotificationEvent::ApprovalDecided, payload.clone()).await.expect("notify");
        port.notify(NotificationEvent::ApprovalConfirmed, payload).await.expect("notify");

        assert_eq!(
            port.sent_events(),
            vec![NotificationEvent::ApprovalDecided, NotificationEvent::ApprovalConfirmed]
        );
        assert_eq!(port.sent()[0].payload["request_id"], json!("LR-1"));
    }

    #[tokio::test]
    async fn failing_port_still_records_attempt() {
        let port = InMemoryNotificationPort::failing();

        let result = port.notify(NotificationEvent::ApprovalRequested, Map::new()).await;

        assert!(result.is_err());
        assert_eq!(port.sent().len(), 1);
    }
}
