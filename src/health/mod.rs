//! Operational statistics over the recent settlement window.
//!
//! Everything here is derived from the ledger and audit trail; the reporter
//! holds no state of its own.

use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::error::AppResult;
use crate::ledger::models::{AuditEventType, OutcomeKind};
use crate::store::SettlementStore;

#[derive(Debug, Clone, Serialize)]
pub struct TransferStats {
    pub total: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub reversed: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryStats {
    /// Events that are themselves a retry of an earlier attempt.
    pub total_retries: usize,
    /// Fraction of retry events that ended confirmed.
    pub success_rate: f64,
    /// Movements that exhausted the attempt cap in the window.
    pub max_retries_reached: i64,
    /// Mean number of extra attempts across settled movements.
    pub average_retries: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookStats {
    pub total_received: i64,
    pub failed_count: i64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStats {
    pub window_hours: i64,
    pub transfers: TransferStats,
    pub retries: RetryStats,
    pub webhooks: WebhookStats,
    pub active_locks: usize,
}

pub struct HealthReporter {
    store: Arc<dyn SettlementStore>,
}

impl HealthReporter {
    pub fn new(store: Arc<dyn SettlementStore>) -> Self {
        Self { store }
    }

    pub async fn stats(&self, window_hours: i64) -> AppResult<HealthStats> {
        let now = Utc::now();
        let since = now - Duration::hours(window_hours);

        let events = self.store.events_since(since).await?;
        let mut transfers = TransferStats {
            total: events.len(),
            confirmed: 0,
            failed: 0,
            reversed: 0,
            pending: 0,
        };
        let mut total_retries = 0usize;
        let mut confirmed_retries = 0usize;
        let mut terminal_events = 0usize;
        let mut extra_attempts = 0i64;
        for event in &events {
            let kind = event.outcome.kind();
            match kind {
                OutcomeKind::Confirmed => transfers.confirmed += 1,
                OutcomeKind::Failed => transfers.failed += 1,
                OutcomeKind::Reversed => transfers.reversed += 1,
                OutcomeKind::Pending => transfers.pending += 1,
            }
            if event.retry_of.is_some() {
                total_retries += 1;
                if kind == OutcomeKind::Confirmed {
                    confirmed_retries += 1;
                }
            }
            if kind != OutcomeKind::Pending {
                terminal_events += 1;
                extra_attempts += i64::from(event.attempt - 1);
            }
        }

        let retries = RetryStats {
            total_retries,
            success_rate: ratio(confirmed_retries, total_retries),
            max_retries_reached: self
                .store
                .count_audit(AuditEventType::MaxRetriesReached, since)
                .await?,
            average_retries: if terminal_events == 0 {
                0.0
            } else {
                extra_attempts as f64 / terminal_events as f64
            },
        };

        let accepted = self
            .store
            .count_audit(AuditEventType::WebhookReceived, since)
            .await?;
        let rejected = self
            .store
            .count_audit(AuditEventType::WebhookRejected, since)
            .await?;
        let webhooks = WebhookStats {
            total_received: accepted + rejected,
            failed_count: rejected,
            success_rate: ratio(accepted as usize, (accepted + rejected) as usize),
        };

        let active_locks = self.store.active_locks(now).await?.len();

        Ok(HealthStats {
            window_hours,
            transfers,
            retries,
            webhooks,
            active_locks,
        })
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        1.0
    } else {
        part as f64 / whole as f64
    }
}
