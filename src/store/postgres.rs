//! Postgres implementation of the settlement store.
//!
//! Predicate-guarded updates lean on single-statement atomicity:
//! `transition_event_outcome` and `mark_commission_paid` carry their guard in
//! the WHERE clause, and lock acquisition is one upsert whose conflict branch
//! only fires for expired rows. No check-then-act across statements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{rate_change_from_details, SettlementStore};
use crate::error::{AppError, AppResult};
use crate::ledger::models::{
    AuditEventType, AuditLog, Booking, BookingStatus, JobLock, LedgerHistoryEntry, Payment,
    PaymentStatus, PlatformSetting, ProviderOutcome, RateChangeRecord, SettlementEvent,
    SettlementEventType,
};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn event_from_row(row: &PgRow) -> AppResult<SettlementEvent> {
    let event_type_str: String = row.try_get("event_type")?;
    let event_type = SettlementEventType::from_str(&event_type_str)
        .ok_or_else(|| AppError::Internal(format!("Unknown event type in store: {event_type_str}")))?;
    let outcome_json: serde_json::Value = row.try_get("outcome")?;
    let outcome: ProviderOutcome = serde_json::from_value(outcome_json)?;

    Ok(SettlementEvent {
        id: row.try_get("id")?,
        booking_id: row.try_get("booking_id")?,
        event_type,
        amount: row.try_get("amount")?,
        currency: row.try_get("currency")?,
        executed_at: row.try_get("executed_at")?,
        transaction_reference: row.try_get("transaction_reference")?,
        outcome,
        attempt: row.try_get("attempt")?,
        retry_of: row.try_get("retry_of")?,
    })
}

fn lock_from_row(row: &PgRow) -> AppResult<JobLock> {
    Ok(JobLock {
        id: row.try_get("id")?,
        job_name: row.try_get("job_name")?,
        locked_at: row.try_get("locked_at")?,
        locked_by: row.try_get("locked_by")?,
        expires_at: row.try_get("expires_at")?,
        booking_ids: row.try_get("booking_ids")?,
    })
}

fn payment_from_row(row: &PgRow) -> AppResult<Payment> {
    let status_str: String = row.try_get("status")?;
    let status = PaymentStatus::from_str(&status_str)
        .ok_or_else(|| AppError::Internal(format!("Unknown payment status: {status_str}")))?;
    Ok(Payment {
        id: row.try_get("id")?,
        booking_id: row.try_get("booking_id")?,
        realtor_id: row.try_get("realtor_id")?,
        amount: row.try_get("amount")?,
        currency: row.try_get("currency")?,
        status,
        realtor_earnings: row.try_get("realtor_earnings")?,
        commission_paid_out: row.try_get("commission_paid_out")?,
    })
}

fn booking_from_row(row: &PgRow) -> AppResult<Booking> {
    let status_str: String = row.try_get("status")?;
    let status = BookingStatus::from_str(&status_str)
        .ok_or_else(|| AppError::Internal(format!("Unknown booking status: {status_str}")))?;
    Ok(Booking {
        id: row.try_get("id")?,
        guest_id: row.try_get("guest_id")?,
        realtor_id: row.try_get("realtor_id")?,
        status,
        room_fee: row.try_get("room_fee")?,
        deposit: row.try_get("deposit")?,
        currency: row.try_get("currency")?,
        check_in: row.try_get("check_in")?,
        check_out: row.try_get("check_out")?,
    })
}

const EVENT_COLUMNS: &str = "id, booking_id, event_type, amount, currency, executed_at, \
                             transaction_reference, outcome, attempt, retry_of";

#[async_trait]
impl SettlementStore for PgStore {
    async fn insert_event(&self, event: &SettlementEvent) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO settlement_events
                (id, booking_id, event_type, amount, currency, executed_at,
                 transaction_reference, outcome, outcome_kind, attempt, retry_of)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(event.id)
        .bind(event.booking_id)
        .bind(event.event_type.as_str())
        .bind(event.amount)
        .bind(&event.currency)
        .bind(event.executed_at)
        .bind(&event.transaction_reference)
        .bind(serde_json::to_value(&event.outcome)?)
        .bind(event.outcome.kind().as_str())
        .bind(event.attempt)
        .bind(event.retry_of)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn event(&self, id: Uuid) -> AppResult<Option<SettlementEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM settlement_events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(event_from_row).transpose()
    }

    async fn event_by_reference(&self, reference: &str) -> AppResult<Option<SettlementEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM settlement_events WHERE transaction_reference = $1"
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(event_from_row).transpose()
    }

    async fn events_for_booking(&self, booking_id: Uuid) -> AppResult<Vec<SettlementEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM settlement_events \
             WHERE booking_id = $1 ORDER BY executed_at, attempt"
        ))
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn events_since(&self, since: DateTime<Utc>) -> AppResult<Vec<SettlementEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM settlement_events \
             WHERE executed_at >= $1 ORDER BY executed_at"
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn pending_events_with_reference(
        &self,
        older_than: DateTime<Utc>,
    ) -> AppResult<Vec<SettlementEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM settlement_events \
             WHERE outcome_kind = 'pending' \
               AND transaction_reference IS NOT NULL \
               AND executed_at <= $1 \
             ORDER BY executed_at"
        ))
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn set_event_reference(&self, event_id: Uuid, reference: &str) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE settlement_events
            SET transaction_reference = $2
            WHERE id = $1 AND transaction_reference IS NULL
            "#,
        )
        .bind(event_id)
        .bind(reference)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn transition_event_outcome(
        &self,
        event_id: Uuid,
        outcome: &ProviderOutcome,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE settlement_events
            SET outcome = $2, outcome_kind = $3
            WHERE id = $1 AND outcome_kind = 'pending'
            "#,
        )
        .bind(event_id)
        .bind(serde_json::to_value(outcome)?)
        .bind(outcome.kind().as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn append_history(&self, entry: &LedgerHistoryEntry) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_history (id, event_id, recorded_at, detail)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(entry.id)
        .bind(entry.event_id)
        .bind(entry.recorded_at)
        .bind(&entry.detail)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn history_for_event(&self, event_id: Uuid) -> AppResult<Vec<LedgerHistoryEntry>> {
        let rows = sqlx::query(
            "SELECT id, event_id, recorded_at, detail FROM ledger_history \
             WHERE event_id = $1 ORDER BY recorded_at",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(LedgerHistoryEntry {
                    id: row.try_get("id")?,
                    event_id: row.try_get("event_id")?,
                    recorded_at: row.try_get("recorded_at")?,
                    detail: row.try_get("detail")?,
                })
            })
            .collect()
    }

    async fn try_acquire_lock(&self, lock: &JobLock) -> AppResult<bool> {
        // The conflict branch only wins when the existing row has expired, so
        // concurrent acquirers race on a single atomic statement.
        let row = sqlx::query(
            r#"
            INSERT INTO job_locks (id, job_name, locked_at, locked_by, expires_at, booking_ids)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (job_name) DO UPDATE
            SET id = EXCLUDED.id,
                locked_at = EXCLUDED.locked_at,
                locked_by = EXCLUDED.locked_by,
                expires_at = EXCLUDED.expires_at,
                booking_ids = EXCLUDED.booking_ids
            WHERE job_locks.expires_at <= NOW()
            RETURNING id
            "#,
        )
        .bind(lock.id)
        .bind(&lock.job_name)
        .bind(lock.locked_at)
        .bind(&lock.locked_by)
        .bind(lock.expires_at)
        .bind(&lock.booking_ids)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn delete_lock_by_name(&self, job_name: &str, owner: &str) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM job_locks WHERE job_name = $1 AND locked_by = $2")
            .bind(job_name)
            .bind(owner)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn lock_by_name(&self, job_name: &str) -> AppResult<Option<JobLock>> {
        let row = sqlx::query(
            "SELECT id, job_name, locked_at, locked_by, expires_at, booking_ids \
             FROM job_locks WHERE job_name = $1",
        )
        .bind(job_name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(lock_from_row).transpose()
    }

    async fn lock_by_id(&self, lock_id: Uuid) -> AppResult<Option<JobLock>> {
        let row = sqlx::query(
            "SELECT id, job_name, locked_at, locked_by, expires_at, booking_ids \
             FROM job_locks WHERE id = $1",
        )
        .bind(lock_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(lock_from_row).transpose()
    }

    async fn delete_lock_by_id(&self, lock_id: Uuid) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM job_locks WHERE id = $1")
            .bind(lock_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn active_locks(&self, now: DateTime<Utc>) -> AppResult<Vec<JobLock>> {
        let rows = sqlx::query(
            "SELECT id, job_name, locked_at, locked_by, expires_at, booking_ids \
             FROM job_locks WHERE expires_at > $1 ORDER BY locked_at",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(lock_from_row).collect()
    }

    async fn setting(&self, key: &str) -> AppResult<Option<PlatformSetting>> {
        let row = sqlx::query(
            "SELECT key, value, updated_by, updated_at FROM platform_settings WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(PlatformSetting {
                key: row.try_get("key")?,
                value: row.try_get("value")?,
                updated_by: row.try_get("updated_by")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn upsert_setting(&self, setting: &PlatformSetting) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO platform_settings (key, value, updated_by, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value,
                updated_by = EXCLUDED.updated_by,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&setting.key)
        .bind(&setting.value)
        .bind(&setting.updated_by)
        .bind(setting.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_audit(&self, entry: &AuditLog) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (id, event_type, entity_id, actor, details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id)
        .bind(entry.event_type.as_str())
        .bind(entry.entity_id)
        .bind(&entry.actor)
        .bind(&entry.details)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn count_audit(
        &self,
        event_type: AuditEventType,
        since: DateTime<Utc>,
    ) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM audit_log WHERE event_type = $1 AND created_at >= $2",
        )
        .bind(event_type.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn commission_rate_history(&self) -> AppResult<Vec<RateChangeRecord>> {
        let rows = sqlx::query(
            "SELECT details, created_at FROM audit_log \
             WHERE event_type = 'commission_rate_changed' ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut changes: Vec<RateChangeRecord> = rows
            .iter()
            .filter_map(|row| {
                let details: serde_json::Value = row.try_get("details").ok()?;
                let created_at: DateTime<Utc> = row.try_get("created_at").ok()?;
                rate_change_from_details(&details, created_at)
            })
            .collect();
        changes.sort_by_key(|c| c.effective_from);
        Ok(changes)
    }

    async fn payment(&self, id: Uuid) -> AppResult<Option<Payment>> {
        let row = sqlx::query(
            "SELECT id, booking_id, realtor_id, amount, currency, status, \
                    realtor_earnings, commission_paid_out \
             FROM payments WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(payment_from_row).transpose()
    }

    async fn payment_for_booking(&self, booking_id: Uuid) -> AppResult<Option<Payment>> {
        let row = sqlx::query(
            "SELECT id, booking_id, realtor_id, amount, currency, status, \
                    realtor_earnings, commission_paid_out \
             FROM payments WHERE booking_id = $1",
        )
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(payment_from_row).transpose()
    }

    async fn set_realtor_earnings(&self, payment_id: Uuid, earnings: Decimal) -> AppResult<u64> {
        let result = sqlx::query("UPDATE payments SET realtor_earnings = $2 WHERE id = $1")
            .bind(payment_id)
            .bind(earnings)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn mark_commission_paid(&self, payment_id: Uuid) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE payments SET commission_paid_out = TRUE \
             WHERE id = $1 AND commission_paid_out = FALSE",
        )
        .bind(payment_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn booking(&self, id: Uuid) -> AppResult<Option<Booking>> {
        let row = sqlx::query(
            "SELECT id, guest_id, realtor_id, status, room_fee, deposit, currency, \
                    check_in, check_out \
             FROM bookings WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(booking_from_row).transpose()
    }

    async fn eligible_bookings(&self, now: DateTime<Utc>) -> AppResult<Vec<Booking>> {
        let rows = sqlx::query(
            r#"
            SELECT id, guest_id, realtor_id, status, room_fee, deposit, currency,
                   check_in, check_out
            FROM bookings b
            WHERE (b.status = 'checked_out' AND b.check_out <= $1
                   AND (NOT EXISTS (
                            SELECT 1 FROM settlement_events e
                            WHERE e.booking_id = b.id
                              AND e.event_type = 'release_deposit_to_customer')
                        OR NOT EXISTS (
                            SELECT 1 FROM settlement_events e
                            WHERE e.booking_id = b.id
                              AND e.event_type = 'release_room_fee_split')))
               OR (b.status = 'cancelled'
                   AND NOT EXISTS (
                       SELECT 1 FROM settlement_events e
                       WHERE e.booking_id = b.id
                         AND e.event_type = 'refund_room_fee_to_customer'))
            ORDER BY b.check_out
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(booking_from_row).collect()
    }

    async fn active_realtor_ids(&self) -> AppResult<Vec<Uuid>> {
        let ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT id FROM realtors WHERE active = TRUE ORDER BY id")
                .fetch_all(&self.pool)
                .await?;

        Ok(ids)
    }
}
