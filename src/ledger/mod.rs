//! Event Ledger - append-only source of truth for attempted money movements.
//!
//! Provider webhooks are eventually consistent evidence; the ledger row is the
//! durable fact. Rows transition away from Pending exactly once and are never
//! deleted or destructively rewritten; every successful mutation also lands in
//! `ledger_history`.

pub mod models;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppResult, LedgerError};
use crate::ledger::models::{
    LedgerHistoryEntry, ProviderOutcome, SettlementEvent, SettlementEventType,
    MAX_TRANSFER_ATTEMPTS,
};
use crate::store::SettlementStore;

/// How an `apply_outcome` call resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    /// The event transitioned to the given outcome.
    Applied,
    /// The event already carried an equivalent outcome; replay was a no-op.
    AlreadyApplied,
}

/// Target of an outcome application: reconciliation addresses events by
/// provider reference, internal callers by id.
#[derive(Debug, Clone)]
pub enum EventRef {
    Id(Uuid),
    Reference(String),
}

pub struct Ledger {
    store: Arc<dyn SettlementStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn SettlementStore>) -> Self {
        Self { store }
    }

    /// Record a new pending settlement event. Zero amounts are valid no-op
    /// movements and still recorded; negative amounts are rejected.
    pub async fn record(
        &self,
        booking_id: Uuid,
        event_type: SettlementEventType,
        amount: Decimal,
        currency: &str,
    ) -> AppResult<SettlementEvent> {
        if amount.is_sign_negative() {
            return Err(LedgerError::InvalidAmount(amount).into());
        }

        let event = SettlementEvent {
            id: Uuid::new_v4(),
            booking_id,
            event_type,
            amount,
            currency: currency.to_string(),
            executed_at: Utc::now(),
            transaction_reference: None,
            outcome: ProviderOutcome::Pending,
            attempt: 1,
            retry_of: None,
        };
        self.store.insert_event(&event).await?;
        self.append_history(
            event.id,
            json!({
                "action": "recorded",
                "event_type": event.event_type.as_str(),
                "amount": event.amount.to_string(),
                "currency": event.currency,
            }),
        )
        .await?;

        info!(
            event_id = %event.id,
            booking_id = %booking_id,
            event_type = %event_type,
            amount = %amount,
            "Settlement event recorded"
        );
        Ok(event)
    }

    /// Record a fresh attempt for a failed (or reversed) event. The original
    /// row is never mutated into a different attempt; history must stay able
    /// to distinguish "attempt 1 failed, attempt 2 succeeded" from a single
    /// flip-flopping event.
    pub async fn record_retry(&self, previous: &SettlementEvent) -> AppResult<SettlementEvent> {
        match previous.outcome {
            ProviderOutcome::Failed { .. } | ProviderOutcome::Reversed { .. } => {}
            _ => {
                return Err(LedgerError::NotRetryable {
                    event_id: previous.id,
                    current: previous.outcome.kind(),
                }
                .into())
            }
        }
        if previous.attempt >= MAX_TRANSFER_ATTEMPTS {
            return Err(LedgerError::MaxRetriesReached {
                event_id: previous.id,
                attempts: previous.attempt,
            }
            .into());
        }

        let event = SettlementEvent {
            id: Uuid::new_v4(),
            booking_id: previous.booking_id,
            event_type: previous.event_type,
            amount: previous.amount,
            currency: previous.currency.clone(),
            executed_at: Utc::now(),
            transaction_reference: None,
            outcome: ProviderOutcome::Pending,
            attempt: previous.attempt + 1,
            retry_of: Some(previous.id),
        };
        self.store.insert_event(&event).await?;
        self.append_history(
            event.id,
            json!({
                "action": "retry_recorded",
                "retry_of": previous.id,
                "attempt": event.attempt,
            }),
        )
        .await?;

        info!(
            event_id = %event.id,
            retry_of = %previous.id,
            attempt = event.attempt,
            "Retry settlement event recorded"
        );
        Ok(event)
    }

    /// Attach the provider-assigned reference to a pending event. Idempotent
    /// when re-attaching the same reference; a reference held by a distinct
    /// event is a conflict.
    pub async fn attach_reference(&self, event_id: Uuid, reference: &str) -> AppResult<()> {
        if let Some(holder) = self.store.event_by_reference(reference).await? {
            if holder.id == event_id {
                return Ok(());
            }
            return Err(LedgerError::DuplicateReference(reference.to_string()).into());
        }

        // Two concurrent attaches of the same reference can both pass the
        // pre-check; the loser then trips the unique constraint on
        // `transaction_reference`. That is a conflict, not a storage fault.
        let updated = match self.store.set_event_reference(event_id, reference).await {
            Ok(updated) => updated,
            Err(e) if is_reference_conflict(&e) => {
                return Err(LedgerError::DuplicateReference(reference.to_string()).into());
            }
            Err(e) => return Err(e),
        };
        if updated == 0 {
            let event = self.require_event(event_id).await?;
            return match event.transaction_reference.as_deref() {
                Some(existing) if existing == reference => Ok(()),
                _ => Err(LedgerError::DuplicateReference(reference.to_string()).into()),
            };
        }

        self.append_history(event_id, json!({ "action": "reference_attached", "reference": reference }))
            .await?;
        Ok(())
    }

    /// Apply a provider-reported outcome. This is the only mutation path after
    /// creation. Replaying an equivalent terminal outcome is a no-op; applying
    /// a conflicting outcome over a terminal event is an integrity violation.
    pub async fn apply_outcome(
        &self,
        target: EventRef,
        outcome: ProviderOutcome,
    ) -> AppResult<(SettlementEvent, ApplyResult)> {
        let event = match &target {
            EventRef::Id(id) => self.require_event(*id).await?,
            EventRef::Reference(reference) => self
                .store
                .event_by_reference(reference)
                .await?
                .ok_or_else(|| LedgerError::EventNotFound(reference.clone()))?,
        };

        if event.outcome.is_terminal() {
            if event.outcome.matches(&outcome) {
                return Ok((event, ApplyResult::AlreadyApplied));
            }
            return Err(LedgerError::TerminalStateViolation {
                event_id: event.id,
                current: event.outcome.kind(),
                attempted: outcome.kind(),
            }
            .into());
        }
        if !outcome.is_terminal() {
            // Pending over pending carries no new information.
            return Ok((event, ApplyResult::AlreadyApplied));
        }

        let updated = self
            .store
            .transition_event_outcome(event.id, &outcome)
            .await?;
        if updated == 0 {
            // Lost a race with a concurrent signal for the same event;
            // re-read and judge the replay against what actually landed.
            let current = self.require_event(event.id).await?;
            if current.outcome.matches(&outcome) {
                return Ok((current, ApplyResult::AlreadyApplied));
            }
            return Err(LedgerError::TerminalStateViolation {
                event_id: current.id,
                current: current.outcome.kind(),
                attempted: outcome.kind(),
            }
            .into());
        }

        self.append_history(
            event.id,
            json!({
                "action": "outcome_applied",
                "outcome": serde_json::to_value(&outcome)?,
            }),
        )
        .await?;

        let mut event = event;
        event.outcome = outcome;
        info!(
            event_id = %event.id,
            outcome = ?event.outcome.kind(),
            "Settlement event outcome applied"
        );
        Ok((event, ApplyResult::Applied))
    }

    pub async fn event(&self, id: Uuid) -> AppResult<Option<SettlementEvent>> {
        self.store.event(id).await
    }

    pub async fn event_by_reference(&self, reference: &str) -> AppResult<Option<SettlementEvent>> {
        self.store.event_by_reference(reference).await
    }

    /// Settlement trail for one booking in causal order. Callers emitting new
    /// events read this first so a later event never references a movement
    /// that was never recorded.
    pub async fn events_for_booking(&self, booking_id: Uuid) -> AppResult<Vec<SettlementEvent>> {
        self.store.events_for_booking(booking_id).await
    }

    pub async fn history_for_event(&self, event_id: Uuid) -> AppResult<Vec<LedgerHistoryEntry>> {
        self.store.history_for_event(event_id).await
    }

    async fn require_event(&self, id: Uuid) -> AppResult<SettlementEvent> {
        self.store
            .event(id)
            .await?
            .ok_or_else(|| LedgerError::EventNotFound(id.to_string()).into())
    }

    async fn append_history(&self, event_id: Uuid, detail: serde_json::Value) -> AppResult<()> {
        self.store
            .append_history(&LedgerHistoryEntry {
                id: Uuid::new_v4(),
                event_id,
                recorded_at: Utc::now(),
                detail,
            })
            .await
    }
}

fn is_reference_conflict(error: &crate::error::AppError) -> bool {
    matches!(
        error,
        crate::error::AppError::Database(sqlx::Error::Database(db)) if db.is_unique_violation()
    )
}
