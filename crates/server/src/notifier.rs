//! Outbound notification adapters. Delivery is best effort: the workflow logs
//! a returned error and keeps the decision.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lendroute_core::notify::{NotificationError, NotificationEvent, NotificationPort};
use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

/// Emits one structured event per notification. Used when no webhook is
/// configured.
#[derive(Clone, Debug, Default)]
pub struct LogNotificationPort;

#[async_trait]
impl NotificationPort for LogNotificationPort {
    async fn notify(
        &self,
        event: NotificationEvent,
        payload: Map<String, Value>,
    ) -> Result<(), NotificationError> {
        let recipient = payload.get("recipient").and_then(Value::as_str).unwrap_or("approver");
        let request_id = payload
            .get("request")
            .and_then(|request| request.get("id"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");

        info!(
            event_name = "approval.notification.logged",
            notification = event.as_str(),
            request_id = %request_id,
            recipient = %recipient,
            "notification recorded in log"
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookEnvelope<'a> {
    event: NotificationEvent,
    payload: &'a Map<String, Value>,
    event_id: String,
    sent_at: String,
}

#[derive(Clone, Debug)]
pub struct WebhookNotificationPort {
    client: Client,
    url: String,
}

impl WebhookNotificationPort {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotificationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| NotificationError(format!("webhook client setup failed: {error}")))?;
        Ok(Self { client, url: url.into() })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl NotificationPort for WebhookNotificationPort {
    async fn notify(
        &self,
        event: NotificationEvent,
        payload: Map<String, Value>,
    ) -> Result<(), NotificationError> {
        let envelope = WebhookEnvelope {
            event,
            payload: &payload,
            event_id: Uuid::new_v4().to_string(),
            sent_at: Utc::now().to_rfc3339(),
        };

        let response =
            self.client.post(&self.url).json(&envelope).send().await.map_err(|error| {
                NotificationError(format!("webhook request failed: {error}"))
            })?;

        if !response.status().is_success() {
            warn!(
                event_name = "approval.notification.webhook_rejected",
                notification = event.as_str(),
                event_id = %envelope.event_id,
                status = %response.status(),
                "notification webhook returned an error status"
            );
            return Err(NotificationError(format!(
                "webhook returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{http::StatusCode, routing::post, Json, Router};
    use lendroute_core::notify::{NotificationEvent, NotificationPort};
    use serde_json::{json, Map, Value};
    use tokio::sync::mpsc;

    use super::{LogNotificationPort, WebhookNotificationPort};

    fn payload() -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("recipient".to_owned(), json!("ada@lender.test"));
        payload.insert("request".to_owned(), json!({ "id": "LR-1" }));
        payload
    }

    async fn webhook_receiver(status: StatusCode) -> (String, mpsc::UnboundedReceiver<Value>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let app = Router::new().route(
            "/hook",
            post(move |Json(body): Json<Value>| {
                let sender = sender.clone();
                async move {
                    let _ = sender.send(body);
                    status
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{address}/hook"), receiver)
    }

    #[tokio::test]
    async fn log_port_always_succeeds() {
        let port = LogNotificationPort;
        assert!(port.notify(NotificationEvent::ApprovalDecided, payload()).await.is_ok());
    }

    #[tokio::test]
    async fn webhook_posts_event_envelope() {
        let (url, mut received) = webhook_receiver(StatusCode::NO_CONTENT).await;
        let port = WebhookNotificationPort::new(url, Duration::from_secs(5)).expect("port");

        port.notify(NotificationEvent::ApprovalRequested, payload()).await.expect("delivered");

        let body = received.recv().await.expect("body");
        assert_eq!(body["event"], json!("approval_requested"));
        assert_eq!(body["payload"]["request"]["id"], json!("LR-1"));
        assert!(body["event_id"].as_str().is_some_and(|id| !id.is_empty()));
        assert!(body["sent_at"].is_string());
    }

    #[tokio::test]
    async fn webhook_error_status_is_a_failure() {
        let (url, _received) = webhook_receiver(StatusCode::INTERNAL_SERVER_ERROR).await;
        let port = WebhookNotificationPort::new(url, Duration::from_secs(5)).expect("port");

        let error = port
            .notify(NotificationEvent::ApprovalConfirmed, payload())
            .await
            .expect_err("500 is a failure");

        assert!(error.0.contains("500"));
    }

    #[tokio::test]
    async fn unreachable_webhook_is_a_failure() {
        let port = WebhookNotificationPort::new("http://127.0.0.1:9/hook", Duration::from_secs(2))
            .expect("port");

        assert!(port.notify(NotificationEvent::ApprovalDecided, payload()).await.is_err());
    }
}
