//! Notification sink - fire-and-forget collaborator.
//!
//! Delivery failures are logged and swallowed; they never roll back or fail
//! the settlement operation that triggered them.

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    CommissionRateChanged,
    PayoutCompleted,
    RefundIssued,
}

impl TemplateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateKind::CommissionRateChanged => "commission_rate_changed",
            TemplateKind::PayoutCompleted => "payout_completed",
            TemplateKind::RefundIssued => "refund_issued",
        }
    }
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification dispatch failed: {0}")]
    Dispatch(String),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(
        &self,
        recipient: Uuid,
        template: TemplateKind,
        payload: serde_json::Value,
    ) -> Result<(), NotifyError>;
}

/// Send a notification, logging failure instead of propagating it. Returns
/// whether delivery was accepted, so fan-out callers can report counts.
pub async fn notify_best_effort(
    sink: &dyn NotificationSink,
    recipient: Uuid,
    template: TemplateKind,
    payload: serde_json::Value,
) -> bool {
    match sink.notify(recipient, template, payload).await {
        Ok(()) => true,
        Err(e) => {
            warn!(%recipient, template = template.as_str(), error = %e, "Notification dropped");
            false
        }
    }
}

/// Posts notifications to the platform's dispatch service.
pub struct HttpNotifier {
    client: reqwest::Client,
    notify_url: String,
}

impl HttpNotifier {
    pub fn new(notify_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            notify_url,
        }
    }
}

#[async_trait]
impl NotificationSink for HttpNotifier {
    async fn notify(
        &self,
        recipient: Uuid,
        template: TemplateKind,
        payload: serde_json::Value,
    ) -> Result<(), NotifyError> {
        self.client
            .post(&self.notify_url)
            .json(&serde_json::json!({
                "recipient_id": recipient,
                "template": template.as_str(),
                "payload": payload,
            }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| NotifyError::Dispatch(e.to_string()))?;
        Ok(())
    }
}
