//! In-memory store used by the test suite. A single mutex over the whole
//! state gives the same atomicity for predicate-guarded updates that the
//! Postgres implementation gets from row-level constraints.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

use super::{rate_change_from_details, SettlementStore};
use crate::error::AppResult;
use crate::ledger::models::{
    AuditEventType, AuditLog, Booking, BookingStatus, JobLock, LedgerHistoryEntry, Payment,
    PlatformSetting, ProviderOutcome, RateChangeRecord, SettlementEvent, SettlementEventType,
};

#[derive(Default)]
struct Inner {
    events: HashMap<Uuid, SettlementEvent>,
    event_order: Vec<Uuid>,
    history: Vec<LedgerHistoryEntry>,
    locks: HashMap<String, JobLock>,
    settings: HashMap<String, PlatformSetting>,
    audit: Vec<AuditLog>,
    payments: HashMap<Uuid, Payment>,
    bookings: HashMap<Uuid, Booking>,
    realtors: Vec<Uuid>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_booking(&self, booking: Booking) {
        self.inner.lock().bookings.insert(booking.id, booking);
    }

    pub fn add_payment(&self, payment: Payment) {
        self.inner.lock().payments.insert(payment.id, payment);
    }

    pub fn add_realtor(&self, realtor_id: Uuid) {
        self.inner.lock().realtors.push(realtor_id);
    }

    pub fn audit_entries(&self) -> Vec<AuditLog> {
        self.inner.lock().audit.clone()
    }
}

fn booking_has_event(inner: &Inner, booking_id: Uuid, event_type: SettlementEventType) -> bool {
    inner
        .events
        .values()
        .any(|e| e.booking_id == booking_id && e.event_type == event_type)
}

#[async_trait]
impl SettlementStore for MemoryStore {
    async fn insert_event(&self, event: &SettlementEvent) -> AppResult<()> {
        let mut inner = self.inner.lock();
        inner.events.insert(event.id, event.clone());
        inner.event_order.push(event.id);
        Ok(())
    }

    async fn event(&self, id: Uuid) -> AppResult<Option<SettlementEvent>> {
        Ok(self.inner.lock().events.get(&id).cloned())
    }

    async fn event_by_reference(&self, reference: &str) -> AppResult<Option<SettlementEvent>> {
        Ok(self
            .inner
            .lock()
            .events
            .values()
            .find(|e| e.transaction_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn events_for_booking(&self, booking_id: Uuid) -> AppResult<Vec<SettlementEvent>> {
        let inner = self.inner.lock();
        Ok(inner
            .event_order
            .iter()
            .filter_map(|id| inner.events.get(id))
            .filter(|e| e.booking_id == booking_id)
            .cloned()
            .collect())
    }

    async fn events_since(&self, since: DateTime<Utc>) -> AppResult<Vec<SettlementEvent>> {
        let inner = self.inner.lock();
        Ok(inner
            .event_order
            .iter()
            .filter_map(|id| inner.events.get(id))
            .filter(|e| e.executed_at >= since)
            .cloned()
            .collect())
    }

    async fn pending_events_with_reference(
        &self,
        older_than: DateTime<Utc>,
    ) -> AppResult<Vec<SettlementEvent>> {
        let inner = self.inner.lock();
        Ok(inner
            .event_order
            .iter()
            .filter_map(|id| inner.events.get(id))
            .filter(|e| {
                e.outcome == ProviderOutcome::Pending
                    && e.transaction_reference.is_some()
                    && e.executed_at <= older_than
            })
            .cloned()
            .collect())
    }

    async fn set_event_reference(&self, event_id: Uuid, reference: &str) -> AppResult<u64> {
        let mut inner = self.inner.lock();
        match inner.events.get_mut(&event_id) {
            Some(event) if event.transaction_reference.is_none() => {
                event.transaction_reference = Some(reference.to_string());
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn transition_event_outcome(
        &self,
        event_id: Uuid,
        outcome: &ProviderOutcome,
    ) -> AppResult<u64> {
        let mut inner = self.inner.lock();
        match inner.events.get_mut(&event_id) {
            Some(event) if event.outcome == ProviderOutcome::Pending => {
                event.outcome = outcome.clone();
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn append_history(&self, entry: &LedgerHistoryEntry) -> AppResult<()> {
        self.inner.lock().history.push(entry.clone());
        Ok(())
    }

    async fn history_for_event(&self, event_id: Uuid) -> AppResult<Vec<LedgerHistoryEntry>> {
        Ok(self
            .inner
            .lock()
            .history
            .iter()
            .filter(|h| h.event_id == event_id)
            .cloned()
            .collect())
    }

    async fn try_acquire_lock(&self, lock: &JobLock) -> AppResult<bool> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        match inner.locks.get(&lock.job_name) {
            Some(existing) if !existing.is_expired(now) => Ok(false),
            _ => {
                inner.locks.insert(lock.job_name.clone(), lock.clone());
                Ok(true)
            }
        }
    }

    async fn delete_lock_by_name(&self, job_name: &str, owner: &str) -> AppResult<u64> {
        let mut inner = self.inner.lock();
        match inner.locks.get(job_name) {
            Some(existing) if existing.locked_by == owner => {
                inner.locks.remove(job_name);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn lock_by_name(&self, job_name: &str) -> AppResult<Option<JobLock>> {
        Ok(self.inner.lock().locks.get(job_name).cloned())
    }

    async fn lock_by_id(&self, lock_id: Uuid) -> AppResult<Option<JobLock>> {
        Ok(self
            .inner
            .lock()
            .locks
            .values()
            .find(|l| l.id == lock_id)
            .cloned())
    }

    async fn delete_lock_by_id(&self, lock_id: Uuid) -> AppResult<u64> {
        let mut inner = self.inner.lock();
        let name = inner
            .locks
            .iter()
            .find(|(_, l)| l.id == lock_id)
            .map(|(name, _)| name.clone());
        match name {
            Some(name) => {
                inner.locks.remove(&name);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn active_locks(&self, now: DateTime<Utc>) -> AppResult<Vec<JobLock>> {
        Ok(self
            .inner
            .lock()
            .locks
            .values()
            .filter(|l| !l.is_expired(now))
            .cloned()
            .collect())
    }

    async fn setting(&self, key: &str) -> AppResult<Option<PlatformSetting>> {
        Ok(self.inner.lock().settings.get(key).cloned())
    }

    async fn upsert_setting(&self, setting: &PlatformSetting) -> AppResult<()> {
        self.inner
            .lock()
            .settings
            .insert(setting.key.clone(), setting.clone());
        Ok(())
    }

    async fn insert_audit(&self, entry: &AuditLog) -> AppResult<()> {
        self.inner.lock().audit.push(entry.clone());
        Ok(())
    }

    async fn count_audit(
        &self,
        event_type: AuditEventType,
        since: DateTime<Utc>,
    ) -> AppResult<i64> {
        Ok(self
            .inner
            .lock()
            .audit
            .iter()
            .filter(|a| a.event_type == event_type && a.created_at >= since)
            .count() as i64)
    }

    async fn commission_rate_history(&self) -> AppResult<Vec<RateChangeRecord>> {
        let inner = self.inner.lock();
        let mut changes: Vec<RateChangeRecord> = inner
            .audit
            .iter()
            .filter(|a| a.event_type == AuditEventType::CommissionRateChanged)
            .filter_map(|a| rate_change_from_details(&a.details, a.created_at))
            .collect();
        changes.sort_by_key(|c| c.effective_from);
        Ok(changes)
    }

    async fn payment(&self, id: Uuid) -> AppResult<Option<Payment>> {
        Ok(self.inner.lock().payments.get(&id).cloned())
    }

    async fn payment_for_booking(&self, booking_id: Uuid) -> AppResult<Option<Payment>> {
        Ok(self
            .inner
            .lock()
            .payments
            .values()
            .find(|p| p.booking_id == booking_id)
            .cloned())
    }

    async fn set_realtor_earnings(&self, payment_id: Uuid, earnings: Decimal) -> AppResult<u64> {
        let mut inner = self.inner.lock();
        match inner.payments.get_mut(&payment_id) {
            Some(payment) => {
                payment.realtor_earnings = Some(earnings);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn mark_commission_paid(&self, payment_id: Uuid) -> AppResult<u64> {
        let mut inner = self.inner.lock();
        match inner.payments.get_mut(&payment_id) {
            Some(payment) if !payment.commission_paid_out => {
                payment.commission_paid_out = true;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn booking(&self, id: Uuid) -> AppResult<Option<Booking>> {
        Ok(self.inner.lock().bookings.get(&id).cloned())
    }

    async fn eligible_bookings(&self, now: DateTime<Utc>) -> AppResult<Vec<Booking>> {
        let inner = self.inner.lock();
        let mut eligible: Vec<Booking> = inner
            .bookings
            .values()
            .filter(|b| match b.status {
                BookingStatus::CheckedOut => {
                    // A checked-out booking stays in the queue until both of
                    // its movements are on the trail; a crash between the
                    // deposit release and the split must not strand the split.
                    b.check_out <= now
                        && (!booking_has_event(
                            &inner,
                            b.id,
                            SettlementEventType::ReleaseDepositToCustomer,
                        ) || !booking_has_event(
                            &inner,
                            b.id,
                            SettlementEventType::ReleaseRoomFeeSplit,
                        ))
                }
                BookingStatus::Cancelled => !booking_has_event(
                    &inner,
                    b.id,
                    SettlementEventType::RefundRoomFeeToCustomer,
                ),
                BookingStatus::CheckedIn => false,
            })
            .cloned()
            .collect();
        eligible.sort_by_key(|b| b.id);
        Ok(eligible)
    }

    async fn active_realtor_ids(&self) -> AppResult<Vec<Uuid>> {
        Ok(self.inner.lock().realtors.clone())
    }
}
