//! Request and response bodies for the settlement API.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::models::{JobLock, ProviderOutcome, SettlementEvent};
use crate::settlement::sweep::{SweepReport, SweepStatus};

#[derive(Debug, Serialize)]
pub struct SweepResponse {
    pub status: &'static str,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub pending: usize,
}

impl From<SweepReport> for SweepResponse {
    fn from(report: SweepReport) -> Self {
        Self {
            status: match report.status {
                SweepStatus::Completed => "completed",
                SweepStatus::SkippedAlreadyRunning => "skipped_already_running",
            },
            processed: report.processed,
            succeeded: report.succeeded,
            failed: report.failed,
            pending: report.pending,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LockView {
    pub id: Uuid,
    pub job_name: String,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub booking_ids: Vec<Uuid>,
}

impl From<JobLock> for LockView {
    fn from(lock: JobLock) -> Self {
        Self {
            id: lock.id,
            job_name: lock.job_name,
            locked_by: lock.locked_by,
            locked_at: lock.locked_at,
            expires_at: lock.expires_at,
            booking_ids: lock.booking_ids,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ForceReleaseQuery {
    pub actor: String,
}

#[derive(Debug, Serialize)]
pub struct EventView {
    pub id: Uuid,
    pub event_type: String,
    pub amount: Decimal,
    pub currency: String,
    pub executed_at: DateTime<Utc>,
    pub transaction_reference: Option<String>,
    pub outcome: ProviderOutcome,
    pub attempt: i32,
    pub retry_of: Option<Uuid>,
}

impl From<SettlementEvent> for EventView {
    fn from(event: SettlementEvent) -> Self {
        Self {
            id: event.id,
            event_type: event.event_type.as_str().to_string(),
            amount: event.amount,
            currency: event.currency,
            executed_at: event.executed_at,
            transaction_reference: event.transaction_reference,
            outcome: event.outcome,
            attempt: event.attempt,
            retry_of: event.retry_of,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BookingSettlementResponse {
    pub booking_id: Uuid,
    pub events: Vec<EventView>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeRateRequest {
    pub new_rate: Decimal,
    pub reason: String,
    #[serde(default)]
    pub effective_from: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ChangeRateResponse {
    pub old_rate: Decimal,
    pub new_rate: Decimal,
    pub realtors_notified: usize,
}

#[derive(Debug, Deserialize)]
pub struct PayoutRequest {
    pub payout_reference: String,
}

#[derive(Debug, Serialize)]
pub struct PayoutResponse {
    pub payment_id: Uuid,
    pub event_id: Uuid,
    pub amount: Decimal,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub disposition: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    #[serde(default = "default_window_hours")]
    pub window_hours: i64,
}

fn default_window_hours() -> i64 {
    24
}
