//! Persistence collaborator for the settlement core.
//!
//! The engine consumes storage as a transactional record store behind this
//! trait: `PgStore` is the production implementation, `MemoryStore` backs the
//! test suite. Every predicate-guarded update (`transition_event_outcome`,
//! `mark_commission_paid`, `try_acquire_lock`) must be atomic in the backing
//! store; the callers' idempotence guarantees depend on it.

#[cfg(test)]
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::AppResult;
use crate::ledger::models::{
    AuditEventType, AuditLog, Booking, JobLock, LedgerHistoryEntry, Payment, PlatformSetting,
    ProviderOutcome, RateChangeRecord, SettlementEvent,
};

#[cfg(test)]
pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait SettlementStore: Send + Sync {
    // ----- settlement events -----

    async fn insert_event(&self, event: &SettlementEvent) -> AppResult<()>;

    async fn event(&self, id: Uuid) -> AppResult<Option<SettlementEvent>>;

    async fn event_by_reference(&self, reference: &str) -> AppResult<Option<SettlementEvent>>;

    /// Events for one booking in insertion (causal) order.
    async fn events_for_booking(&self, booking_id: Uuid) -> AppResult<Vec<SettlementEvent>>;

    async fn events_since(&self, since: DateTime<Utc>) -> AppResult<Vec<SettlementEvent>>;

    /// Pending events that already hold a provider reference and were executed
    /// before `older_than`; the reconciliation poll backfills these.
    async fn pending_events_with_reference(
        &self,
        older_than: DateTime<Utc>,
    ) -> AppResult<Vec<SettlementEvent>>;

    /// Attach a reference where none is set. Returns affected row count; 0
    /// means the event is missing or already referenced.
    async fn set_event_reference(&self, event_id: Uuid, reference: &str) -> AppResult<u64>;

    /// Transition an event's outcome, guarded by "still pending". Returns the
    /// affected row count; 0 means the event was already terminal (or missing)
    /// and the caller must re-read to decide between no-op and violation.
    async fn transition_event_outcome(
        &self,
        event_id: Uuid,
        outcome: &ProviderOutcome,
    ) -> AppResult<u64>;

    async fn append_history(&self, entry: &LedgerHistoryEntry) -> AppResult<()>;

    async fn history_for_event(&self, event_id: Uuid) -> AppResult<Vec<LedgerHistoryEntry>>;

    // ----- job locks -----

    /// Insert-if-absent with expiry supersede, atomically. Returns false when
    /// a live lock for the same job name already exists.
    async fn try_acquire_lock(&self, lock: &JobLock) -> AppResult<bool>;

    /// Delete the named lock if `owner` holds it. Returns affected rows.
    async fn delete_lock_by_name(&self, job_name: &str, owner: &str) -> AppResult<u64>;

    async fn lock_by_name(&self, job_name: &str) -> AppResult<Option<JobLock>>;

    async fn lock_by_id(&self, lock_id: Uuid) -> AppResult<Option<JobLock>>;

    async fn delete_lock_by_id(&self, lock_id: Uuid) -> AppResult<u64>;

    async fn active_locks(&self, now: DateTime<Utc>) -> AppResult<Vec<JobLock>>;

    // ----- settings & audit -----

    async fn setting(&self, key: &str) -> AppResult<Option<PlatformSetting>>;

    async fn upsert_setting(&self, setting: &PlatformSetting) -> AppResult<()>;

    async fn insert_audit(&self, entry: &AuditLog) -> AppResult<()>;

    async fn count_audit(
        &self,
        event_type: AuditEventType,
        since: DateTime<Utc>,
    ) -> AppResult<i64>;

    /// Commission-rate changes reconstructed from the audit trail, ordered by
    /// effective instant.
    async fn commission_rate_history(&self) -> AppResult<Vec<RateChangeRecord>>;

    // ----- payments, bookings, realtors -----

    async fn payment(&self, id: Uuid) -> AppResult<Option<Payment>>;

    async fn payment_for_booking(&self, booking_id: Uuid) -> AppResult<Option<Payment>>;

    async fn set_realtor_earnings(&self, payment_id: Uuid, earnings: Decimal) -> AppResult<u64>;

    /// Flip `commission_paid_out` from false to true. Returns affected rows;
    /// 0 means another caller won the race (or the flag was already set).
    async fn mark_commission_paid(&self, payment_id: Uuid) -> AppResult<u64>;

    async fn booking(&self, id: Uuid) -> AppResult<Option<Booking>>;

    /// Bookings whose lifecycle makes them due for automatic settlement and
    /// that are still missing at least one of their due movements.
    async fn eligible_bookings(&self, now: DateTime<Utc>) -> AppResult<Vec<Booking>>;

    async fn active_realtor_ids(&self) -> AppResult<Vec<Uuid>>;
}

/// Parse one audit `details` payload into a rate-change record. Shared by both
/// store implementations so the trail is interpreted identically everywhere.
pub(crate) fn rate_change_from_details(
    details: &serde_json::Value,
    changed_at: DateTime<Utc>,
) -> Option<RateChangeRecord> {
    use std::str::FromStr;

    let rate = details
        .get("new_rate")
        .and_then(|v| v.as_str())
        .and_then(|s| Decimal::from_str(s).ok())?;
    let effective_from = details
        .get("effective_from")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(changed_at);
    Some(RateChangeRecord { rate, effective_from })
}
