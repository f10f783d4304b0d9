//! The periodic settlement sweep.
//!
//! Finds bookings whose funds are due to move, plans the movements for each,
//! records them in the ledger and initiates the provider transfers. The whole
//! sweep runs under the `settlement_sweep` job lock; individual bookings are
//! settled concurrently but isolated, so one booking's provider trouble never
//! blocks the rest of the batch.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::commission::{commission, compute_earnings, CommissionService};
use crate::error::{AppError, AppResult, LockError};
use crate::ledger::models::{
    Booking, BookingStatus, LedgerHistoryEntry, SettlementEvent, SettlementEventType,
};
use crate::ledger::Ledger;
use crate::locks::JobLockManager;
use crate::provider::PaymentProvider;
use crate::reconcile::{
    destination_for, dispatch_transfer, drive_retries, RetryDrive, TransferDispatch,
};
use crate::store::SettlementStore;

pub const SWEEP_JOB_NAME: &str = "settlement_sweep";

#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Identifies this worker in the job lock row.
    pub owner: String,
    pub lock_ttl: chrono::Duration,
    pub max_concurrency: usize,
    pub provider_timeout: std::time::Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            owner: format!("sweep-{}", Uuid::new_v4()),
            lock_ttl: chrono::Duration::minutes(10),
            max_concurrency: 8,
            provider_timeout: std::time::Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepStatus {
    Completed,
    /// Another worker holds the sweep lock; nothing was processed.
    SkippedAlreadyRunning,
}

#[derive(Debug, Clone, Copy)]
pub struct SweepReport {
    pub status: SweepStatus,
    pub processed: usize,
    /// All transfers for the booking were initiated or terminally confirmed.
    pub succeeded: usize,
    /// At least one transfer was rejected or the booking could not be planned.
    pub failed: usize,
    /// At least one transfer is awaiting provider confirmation.
    pub pending: usize,
}

impl SweepReport {
    fn skipped() -> Self {
        Self {
            status: SweepStatus::SkippedAlreadyRunning,
            processed: 0,
            succeeded: 0,
            failed: 0,
            pending: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BookingOutcome {
    Succeeded,
    Pending,
    Failed,
}

pub struct SettlementEngine {
    store: Arc<dyn SettlementStore>,
    ledger: Arc<Ledger>,
    locks: Arc<JobLockManager>,
    commission: Arc<CommissionService>,
    provider: Arc<dyn PaymentProvider>,
    config: SweepConfig,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        ledger: Arc<Ledger>,
        locks: Arc<JobLockManager>,
        commission: Arc<CommissionService>,
        provider: Arc<dyn PaymentProvider>,
        config: SweepConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            locks,
            commission,
            provider,
            config,
        }
    }

    /// Run one sweep. Safe to invoke from multiple workers; losers of the
    /// lock race report `SkippedAlreadyRunning` and touch nothing.
    pub async fn run_sweep(&self) -> AppResult<SweepReport> {
        let now = Utc::now();
        let eligible = self.store.eligible_bookings(now).await?;
        if eligible.is_empty() {
            return Ok(SweepReport {
                status: SweepStatus::Completed,
                processed: 0,
                succeeded: 0,
                failed: 0,
                pending: 0,
            });
        }

        let booking_ids: Vec<Uuid> = eligible.iter().map(|b| b.id).collect();
        let lock = match self
            .locks
            .acquire(
                SWEEP_JOB_NAME,
                &self.config.owner,
                self.config.lock_ttl,
                booking_ids,
            )
            .await
        {
            Ok(lock) => lock,
            Err(AppError::Lock(LockError::AlreadyLocked { locked_by, .. })) => {
                info!(holder = %locked_by, "Settlement sweep already running elsewhere, skipping");
                return Ok(SweepReport::skipped());
            }
            Err(e) => return Err(e),
        };

        // From here the lock must be released no matter how settling goes.
        let result = self.settle_batch(eligible).await;
        if let Err(e) = self.locks.release(SWEEP_JOB_NAME, &lock.locked_by).await {
            error!(error = %e, "Failed to release sweep lock");
        }
        let report = result?;

        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            pending = report.pending,
            "Settlement sweep finished"
        );
        Ok(report)
    }

    async fn settle_batch(&self, eligible: Vec<Booking>) -> AppResult<SweepReport> {
        let processed = eligible.len();
        let outcomes: Vec<BookingOutcome> = stream::iter(eligible)
            .map(|booking| async move {
                let booking_id = booking.id;
                match self.settle_booking(booking).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(booking_id = %booking_id, error = %e, "Booking settlement errored");
                        BookingOutcome::Failed
                    }
                }
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        let mut report = SweepReport {
            status: SweepStatus::Completed,
            processed,
            succeeded: 0,
            failed: 0,
            pending: 0,
        };
        for outcome in outcomes {
            match outcome {
                BookingOutcome::Succeeded => report.succeeded += 1,
                BookingOutcome::Pending => report.pending += 1,
                BookingOutcome::Failed => report.failed += 1,
            }
        }
        Ok(report)
    }

    /// Settle one booking. Re-entrant: movements already recorded by an
    /// earlier partial sweep are skipped, not duplicated.
    async fn settle_booking(&self, booking: Booking) -> AppResult<BookingOutcome> {
        let trail = self.ledger.events_for_booking(booking.id).await?;

        match booking.status {
            BookingStatus::CheckedOut => self.settle_checkout(&booking, &trail).await,
            BookingStatus::Cancelled => self.settle_cancellation(&booking, &trail).await,
            BookingStatus::CheckedIn => {
                // Not due yet; the eligibility query should not have returned it.
                warn!(booking_id = %booking.id, "Checked-in booking reached the sweep, skipping");
                Ok(BookingOutcome::Succeeded)
            }
        }
    }

    /// Checkout settles two movements: the security deposit back to the guest
    /// and the realtor's share of the room fee. The platform's commission
    /// never leaves the platform account, so only the earnings are transferred.
    async fn settle_checkout(
        &self,
        booking: &Booking,
        trail: &[SettlementEvent],
    ) -> AppResult<BookingOutcome> {
        let mut worst = BookingOutcome::Succeeded;

        if !has_event(trail, SettlementEventType::ReleaseDepositToCustomer) {
            let dispatch = self
                .record_and_dispatch(
                    booking,
                    SettlementEventType::ReleaseDepositToCustomer,
                    booking.deposit,
                    None,
                )
                .await?;
            worst = worst_of(worst, dispatch);
        }

        if !has_event(trail, SettlementEventType::ReleaseRoomFeeSplit) {
            let Some(payment) = self.store.payment_for_booking(booking.id).await? else {
                warn!(booking_id = %booking.id, "Checked-out booking has no payment to split");
                return Ok(BookingOutcome::Failed);
            };

            let rate = self.commission.effective_rate(Utc::now()).await?;
            let earnings = match payment.realtor_earnings {
                Some(earnings) => earnings,
                None => {
                    let earnings = compute_earnings(payment.amount, rate);
                    self.store.set_realtor_earnings(payment.id, earnings).await?;
                    earnings
                }
            };

            let split_detail = json!({
                "room_fee": payment.amount.to_string(),
                "commission_rate": rate.to_string(),
                "commission": commission(payment.amount, rate).to_string(),
                "realtor_earnings": earnings.to_string(),
            });
            let dispatch = self
                .record_and_dispatch(
                    booking,
                    SettlementEventType::ReleaseRoomFeeSplit,
                    earnings,
                    Some(split_detail),
                )
                .await?;

            if dispatch == BookingOutcome::Succeeded {
                // Commission settles once the split transfer is on its way.
                // An unresolved initiation leaves the flag untouched;
                // reconciliation flips it when the transfer confirms.
                self.store.mark_commission_paid(payment.id).await?;
            }
            worst = worst_of(worst, dispatch);
        }

        Ok(worst)
    }

    /// Cancellation refunds the room fee to the guest. The deposit was never
    /// captured for a cancelled stay, so no deposit movement is recorded.
    async fn settle_cancellation(
        &self,
        booking: &Booking,
        trail: &[SettlementEvent],
    ) -> AppResult<BookingOutcome> {
        if has_event(trail, SettlementEventType::RefundRoomFeeToCustomer) {
            return Ok(BookingOutcome::Succeeded);
        }
        self.record_and_dispatch(
            booking,
            SettlementEventType::RefundRoomFeeToCustomer,
            booking.room_fee,
            None,
        )
        .await
    }

    async fn record_and_dispatch(
        &self,
        booking: &Booking,
        event_type: SettlementEventType,
        amount: Decimal,
        detail: Option<serde_json::Value>,
    ) -> AppResult<BookingOutcome> {
        let event = self
            .ledger
            .record(booking.id, event_type, amount, &booking.currency)
            .await?;
        if let Some(detail) = detail {
            self.store
                .append_history(&LedgerHistoryEntry {
                    id: Uuid::new_v4(),
                    event_id: event.id,
                    recorded_at: Utc::now(),
                    detail,
                })
                .await?;
        }

        let destination = destination_for(event_type, booking);
        let dispatch = dispatch_transfer(
            self.provider.as_ref(),
            &self.ledger,
            self.store.as_ref(),
            &event,
            &destination,
            self.config.provider_timeout,
        )
        .await?;

        Ok(match dispatch {
            TransferDispatch::Referenced(_) => BookingOutcome::Succeeded,
            TransferDispatch::StillPending => BookingOutcome::Pending,
            TransferDispatch::Failed(reason) => {
                // Sweep-time rejections go through the same bounded retry
                // machinery as webhook-reported failures; the movement is
                // either re-initiated or parked with a MaxRetriesReached
                // audit entry.
                warn!(booking_id = %booking.id, event_type = %event_type, reason, "Transfer rejected during sweep");
                let failed = self
                    .ledger
                    .event(event.id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("settlement event {}", event.id)))?;
                match drive_retries(
                    self.store.as_ref(),
                    &self.ledger,
                    self.provider.as_ref(),
                    &failed,
                    self.config.provider_timeout,
                )
                .await?
                {
                    RetryDrive::Initiated => BookingOutcome::Pending,
                    RetryDrive::Parked => BookingOutcome::Failed,
                }
            }
        })
    }
}

fn has_event(trail: &[SettlementEvent], event_type: SettlementEventType) -> bool {
    trail.iter().any(|e| e.event_type == event_type)
}

fn worst_of(a: BookingOutcome, b: BookingOutcome) -> BookingOutcome {
    use BookingOutcome::*;
    match (a, b) {
        (Failed, _) | (_, Failed) => Failed,
        (Pending, _) | (_, Pending) => Pending,
        _ => Succeeded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::{
        AuditEventType, OutcomeKind, Payment, PaymentStatus, MAX_TRANSFER_ATTEMPTS,
    };
    use crate::notify::testing::RecordingNotifier;
    use crate::provider::testing::{Script, ScriptedProvider};
    use crate::store::MemoryStore;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    struct Fixture {
        store: Arc<MemoryStore>,
        ledger: Arc<Ledger>,
        locks: Arc<JobLockManager>,
        provider: Arc<ScriptedProvider>,
        engine: SettlementEngine,
    }

    fn fixture() -> Fixture {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let ledger = Arc::new(Ledger::new(store.clone()));
        let locks = Arc::new(JobLockManager::new(store.clone()));
        let provider = Arc::new(ScriptedProvider::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let commission = Arc::new(CommissionService::new(
            store.clone(),
            ledger.clone(),
            notifier,
        ));
        let engine = SettlementEngine::new(
            store.clone(),
            ledger.clone(),
            locks.clone(),
            commission,
            provider.clone(),
            SweepConfig {
                owner: "sweep-test".into(),
                ..SweepConfig::default()
            },
        );
        Fixture {
            store,
            ledger,
            locks,
            provider,
            engine,
        }
    }

    fn checked_out_booking() -> Booking {
        Booking {
            id: Uuid::new_v4(),
            guest_id: Uuid::new_v4(),
            realtor_id: Uuid::new_v4(),
            status: BookingStatus::CheckedOut,
            room_fee: dec!(200.00),
            deposit: dec!(50.00),
            currency: "USD".into(),
            check_in: Utc::now() - Duration::days(3),
            check_out: Utc::now() - Duration::hours(1),
        }
    }

    fn payment_for(booking: &Booking) -> Payment {
        Payment {
            id: Uuid::new_v4(),
            booking_id: booking.id,
            realtor_id: booking.realtor_id,
            amount: booking.room_fee,
            currency: booking.currency.clone(),
            status: PaymentStatus::Completed,
            realtor_earnings: None,
            commission_paid_out: false,
        }
    }

    fn seed_checked_out(f: &Fixture) -> (Booking, Payment) {
        let booking = checked_out_booking();
        let payment = payment_for(&booking);
        f.store.add_booking(booking.clone());
        f.store.add_payment(payment.clone());
        (booking, payment)
    }

    #[tokio::test]
    async fn sweep_settles_checkout_with_deposit_and_split() {
        let f = fixture();
        let (booking, payment) = seed_checked_out(&f);

        let report = f.engine.run_sweep().await.unwrap();
        assert_eq!(report.status, SweepStatus::Completed);
        assert_eq!(report.processed, 1);
        assert_eq!(report.succeeded, 1);

        let trail = f.ledger.events_for_booking(booking.id).await.unwrap();
        assert_eq!(trail.len(), 2);

        let deposit = trail
            .iter()
            .find(|e| e.event_type == SettlementEventType::ReleaseDepositToCustomer)
            .unwrap();
        assert_eq!(deposit.amount, dec!(50.00));
        assert!(deposit.transaction_reference.is_some());
        assert_eq!(deposit.outcome.kind(), OutcomeKind::Pending);

        // Default 10% commission: realtor gets 180, platform keeps 20.
        let split = trail
            .iter()
            .find(|e| e.event_type == SettlementEventType::ReleaseRoomFeeSplit)
            .unwrap();
        assert_eq!(split.amount, dec!(180.00));

        let payment = f.store.payment(payment.id).await.unwrap().unwrap();
        assert_eq!(payment.realtor_earnings, Some(dec!(180.00)));
        assert!(payment.commission_paid_out);

        // Both transfers went to the right parties.
        let initiated = f.provider.initiated.lock().clone();
        assert!(initiated
            .iter()
            .any(|(dest, amount, _)| dest == &format!("guest:{}", booking.guest_id)
                && *amount == dec!(50.00)));
        assert!(initiated
            .iter()
            .any(|(dest, amount, _)| dest == &format!("realtor:{}", booking.realtor_id)
                && *amount == dec!(180.00)));

        assert_eq!(f.locks.active_lock_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn one_slow_provider_does_not_block_the_batch() {
        let f = fixture();
        let (a, a_payment) = seed_checked_out(&f);
        let (b, b_payment) = seed_checked_out(&f);
        let (c, c_payment) = seed_checked_out(&f);

        // Booking B's split transfer times out; its outcome stays pending.
        f.provider
            .script(&format!("realtor:{}", b.realtor_id), Script::Timeout);

        let report = f.engine.run_sweep().await.unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.pending, 1);
        assert_eq!(report.failed, 0);

        for payment_id in [a_payment.id, c_payment.id] {
            let payment = f.store.payment(payment_id).await.unwrap().unwrap();
            assert!(payment.commission_paid_out);
        }
        // B's commission is not settled until its transfer confirms.
        let b_payment = f.store.payment(b_payment.id).await.unwrap().unwrap();
        assert!(!b_payment.commission_paid_out);

        let b_trail = f.ledger.events_for_booking(b.id).await.unwrap();
        let b_split = b_trail
            .iter()
            .find(|e| e.event_type == SettlementEventType::ReleaseRoomFeeSplit)
            .unwrap();
        assert_eq!(b_split.outcome.kind(), OutcomeKind::Pending);
        assert!(b_split.transaction_reference.is_none());

        // A and C settled normally despite B.
        for booking in [&a, &c] {
            let trail = f.ledger.events_for_booking(booking.id).await.unwrap();
            assert_eq!(trail.len(), 2);
            assert!(trail.iter().all(|e| e.transaction_reference.is_some()));
        }

        // The lock was released even though a transfer hung.
        assert_eq!(f.locks.active_lock_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sweep_skips_when_lock_is_held() {
        let f = fixture();
        seed_checked_out(&f);
        f.locks
            .acquire(SWEEP_JOB_NAME, "other-worker", Duration::minutes(5), vec![])
            .await
            .unwrap();

        let report = f.engine.run_sweep().await.unwrap();
        assert_eq!(report.status, SweepStatus::SkippedAlreadyRunning);
        assert_eq!(report.processed, 0);
        assert_eq!(f.provider.initiated_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_booking_refunds_room_fee_only() {
        let f = fixture();
        let mut booking = checked_out_booking();
        booking.status = BookingStatus::Cancelled;
        f.store.add_booking(booking.clone());

        let report = f.engine.run_sweep().await.unwrap();
        assert_eq!(report.succeeded, 1);

        let trail = f.ledger.events_for_booking(booking.id).await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(
            trail[0].event_type,
            SettlementEventType::RefundRoomFeeToCustomer
        );
        assert_eq!(trail[0].amount, booking.room_fee);

        let initiated = f.provider.initiated.lock().clone();
        assert_eq!(initiated.len(), 1);
        assert_eq!(initiated[0].0, format!("guest:{}", booking.guest_id));
    }

    #[tokio::test]
    async fn rejected_transfer_is_retried_then_parked_with_audit() {
        let f = fixture();
        let (booking, _) = seed_checked_out(&f);
        f.provider.script(
            &format!("guest:{}", booking.guest_id),
            Script::Reject("account closed".into()),
        );

        let report = f.engine.run_sweep().await.unwrap();
        assert_eq!(report.failed, 1);

        // Every attempt up to the cap was made and recorded as failed.
        let trail = f.ledger.events_for_booking(booking.id).await.unwrap();
        let deposits: Vec<_> = trail
            .iter()
            .filter(|e| e.event_type == SettlementEventType::ReleaseDepositToCustomer)
            .collect();
        assert_eq!(deposits.len(), MAX_TRANSFER_ATTEMPTS as usize);
        assert!(deposits
            .iter()
            .all(|e| e.outcome.kind() == OutcomeKind::Failed));

        // The exhausted movement is parked for manual intervention.
        let audit = f.store.audit_entries();
        assert!(audit
            .iter()
            .any(|a| a.event_type == AuditEventType::MaxRetriesReached));

        // The split was unaffected by the deposit's trouble.
        let split = trail
            .iter()
            .find(|e| e.event_type == SettlementEventType::ReleaseRoomFeeSplit)
            .unwrap();
        assert!(split.transaction_reference.is_some());
    }

    #[tokio::test]
    async fn partially_settled_checkout_is_revisited() {
        let f = fixture();
        let (booking, payment) = seed_checked_out(&f);

        // An earlier sweep released the deposit and crashed before splitting
        // the room fee.
        f.ledger
            .record(
                booking.id,
                SettlementEventType::ReleaseDepositToCustomer,
                booking.deposit,
                &booking.currency,
            )
            .await
            .unwrap();

        let report = f.engine.run_sweep().await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.succeeded, 1);

        // The deposit movement was not duplicated; the split was backfilled.
        let trail = f.ledger.events_for_booking(booking.id).await.unwrap();
        let deposits = trail
            .iter()
            .filter(|e| e.event_type == SettlementEventType::ReleaseDepositToCustomer)
            .count();
        assert_eq!(deposits, 1);
        let split = trail
            .iter()
            .find(|e| e.event_type == SettlementEventType::ReleaseRoomFeeSplit)
            .unwrap();
        assert_eq!(split.amount, dec!(180.00));

        let payment = f.store.payment(payment.id).await.unwrap().unwrap();
        assert!(payment.commission_paid_out);

        // With both movements on the trail the booking leaves the queue.
        let report = f.engine.run_sweep().await.unwrap();
        assert_eq!(report.processed, 0);
    }

    #[tokio::test]
    async fn second_sweep_does_not_duplicate_movements() {
        let f = fixture();
        let (booking, _) = seed_checked_out(&f);

        f.engine.run_sweep().await.unwrap();
        let report = f.engine.run_sweep().await.unwrap();
        assert_eq!(report.processed, 0);

        let trail = f.ledger.events_for_booking(booking.id).await.unwrap();
        assert_eq!(trail.len(), 2);
    }

    #[tokio::test]
    async fn split_respects_changed_commission_rate() {
        let f = fixture();
        let notifier = Arc::new(RecordingNotifier::new());
        let commission = Arc::new(CommissionService::new(
            f.store.clone(),
            f.ledger.clone(),
            notifier,
        ));
        commission
            .change_rate(dec!(0.15), "seasonal adjustment agreed with partners", None, "admin-1")
            .await
            .unwrap();

        let (booking, payment) = seed_checked_out(&f);
        f.engine.run_sweep().await.unwrap();

        let trail = f.ledger.events_for_booking(booking.id).await.unwrap();
        let split = trail
            .iter()
            .find(|e| e.event_type == SettlementEventType::ReleaseRoomFeeSplit)
            .unwrap();
        assert_eq!(split.amount, dec!(170.0000));

        let payment = f.store.payment(payment.id).await.unwrap().unwrap();
        // Earnings plus commission reconstruct the full room fee.
        assert_eq!(
            payment.realtor_earnings.unwrap() + commission_amount(dec!(200.00), dec!(0.15)),
            dec!(200.00)
        );
    }

    fn commission_amount(amount: Decimal, rate: Decimal) -> Decimal {
        super::commission(amount, rate)
    }
}
