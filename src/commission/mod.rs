//! Commission & Payout Calculator.
//!
//! The commission rate is a versioned setting: the current value is a
//! projection, the history lives in the append-only audit trail, and
//! `effective_rate` resolves against that trail so a future-dated change
//! never retroactively alters earnings computed in the past.
//!
//! All money math is `rust_decimal`; no floats touch amounts anywhere.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppResult, PayoutError, RateError};
use crate::ledger::models::{
    AuditEventType, AuditLog, PaymentStatus, PlatformSetting, SettlementEventType,
    COMMISSION_RATE_KEY,
};
use crate::ledger::Ledger;
use crate::notify::{notify_best_effort, NotificationSink, TemplateKind};
use crate::store::SettlementStore;

pub const DEFAULT_COMMISSION_RATE: Decimal = dec!(0.10);
pub const MAX_COMMISSION_RATE: Decimal = dec!(0.5);
pub const MIN_REASON_LENGTH: usize = 10;

/// Realtor earnings for a payment amount at the given commission rate.
/// `earnings + commission(amount, rate) == amount` exactly; nothing is
/// rounded away.
pub fn compute_earnings(amount: Decimal, rate: Decimal) -> Decimal {
    amount - commission(amount, rate)
}

/// The platform's retained share.
pub fn commission(amount: Decimal, rate: Decimal) -> Decimal {
    amount * rate
}

#[derive(Debug, Clone)]
pub struct RateChange {
    pub old_rate: Decimal,
    pub new_rate: Decimal,
    pub realtors_notified: usize,
}

#[derive(Debug, Clone)]
pub struct ProcessedPayout {
    pub payment_id: Uuid,
    pub event_id: Uuid,
    pub amount: Decimal,
    pub processed_at: DateTime<Utc>,
}

pub struct CommissionService {
    store: Arc<dyn SettlementStore>,
    ledger: Arc<Ledger>,
    notifier: Arc<dyn NotificationSink>,
}

impl CommissionService {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        ledger: Arc<Ledger>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            ledger,
            notifier,
        }
    }

    /// Commission rate in force at `at`: the latest audited change whose
    /// effective instant is not after `at`, defaulting to 0.10 when the rate
    /// was never configured.
    pub async fn effective_rate(&self, at: DateTime<Utc>) -> AppResult<Decimal> {
        let history = self.store.commission_rate_history().await?;
        Ok(history
            .iter()
            .rev()
            .find(|change| change.effective_from <= at)
            .map(|change| change.rate)
            .unwrap_or(DEFAULT_COMMISSION_RATE))
    }

    /// Change the commission rate. The setting write plus audit entry is the
    /// durable fact; realtor notification is best-effort fan-out and a
    /// delivery failure never rolls the change back.
    pub async fn change_rate(
        &self,
        new_rate: Decimal,
        reason: &str,
        effective_from: Option<DateTime<Utc>>,
        actor: &str,
    ) -> AppResult<RateChange> {
        if new_rate.is_sign_negative() || new_rate > MAX_COMMISSION_RATE {
            return Err(RateError::InvalidRate(new_rate).into());
        }
        if reason.trim().len() < MIN_REASON_LENGTH {
            return Err(RateError::MissingReason {
                min: MIN_REASON_LENGTH,
            }
            .into());
        }

        let now = Utc::now();
        let old_rate = self.effective_rate(now).await?;
        let effective = effective_from.unwrap_or(now);

        self.store
            .upsert_setting(&PlatformSetting {
                key: COMMISSION_RATE_KEY.to_string(),
                value: json!({
                    "rate": new_rate.to_string(),
                    "effective_from": effective.to_rfc3339(),
                }),
                updated_by: actor.to_string(),
                updated_at: now,
            })
            .await?;
        self.store
            .insert_audit(&AuditLog::new(
                AuditEventType::CommissionRateChanged,
                None,
                Some(actor.to_string()),
                json!({
                    "old_rate": old_rate.to_string(),
                    "new_rate": new_rate.to_string(),
                    "reason": reason,
                    "effective_from": effective.to_rfc3339(),
                }),
            ))
            .await?;

        info!(%old_rate, %new_rate, actor, "Commission rate changed");

        let mut notified = 0;
        for realtor_id in self.store.active_realtor_ids().await? {
            let delivered = notify_best_effort(
                self.notifier.as_ref(),
                realtor_id,
                TemplateKind::CommissionRateChanged,
                json!({
                    "old_rate": old_rate.to_string(),
                    "new_rate": new_rate.to_string(),
                    "effective_from": effective.to_rfc3339(),
                }),
            )
            .await;
            if delivered {
                notified += 1;
            }
        }

        Ok(RateChange {
            old_rate,
            new_rate,
            realtors_notified: notified,
        })
    }

    /// Pay a realtor their earned share for a completed payment. Safe to call
    /// exactly once per payment: the paid-out flag flips atomically, so a
    /// second call (or a concurrent duplicate) fails with `AlreadyPaidOut`
    /// instead of double-paying.
    pub async fn process_payout(
        &self,
        payment_id: Uuid,
        payout_reference: &str,
        actor: &str,
    ) -> AppResult<ProcessedPayout> {
        let payment = self
            .store
            .payment(payment_id)
            .await?
            .ok_or(PayoutError::PaymentNotFound(payment_id))?;

        if payment.status != PaymentStatus::Completed {
            return Err(PayoutError::NotEligible {
                payment_id,
                reason: format!("payment status is {}", payment.status.as_str()),
            }
            .into());
        }
        let earnings = payment.realtor_earnings.ok_or_else(|| PayoutError::NotEligible {
            payment_id,
            reason: "realtor earnings not yet computed".to_string(),
        })?;
        if payment.commission_paid_out {
            return Err(PayoutError::AlreadyPaidOut(payment_id).into());
        }

        // The flag flip is the at-most-once gate; it must precede the ledger
        // write so two racing callers cannot both record a payout event.
        let flipped = self.store.mark_commission_paid(payment_id).await?;
        if flipped == 0 {
            return Err(PayoutError::AlreadyPaidOut(payment_id).into());
        }

        let event = self
            .ledger
            .record(
                payment.booking_id,
                SettlementEventType::PayRealtorFromDeposit,
                earnings,
                &payment.currency,
            )
            .await?;
        self.ledger.attach_reference(event.id, payout_reference).await?;

        let processed_at = Utc::now();
        self.store
            .insert_audit(&AuditLog::new(
                AuditEventType::PayoutProcessed,
                Some(payment_id),
                Some(actor.to_string()),
                json!({
                    "event_id": event.id,
                    "amount": earnings.to_string(),
                    "currency": payment.currency,
                    "payout_reference": payout_reference,
                }),
            ))
            .await?;

        notify_best_effort(
            self.notifier.as_ref(),
            payment.realtor_id,
            TemplateKind::PayoutCompleted,
            json!({
                "payment_id": payment_id,
                "amount": earnings.to_string(),
                "currency": payment.currency,
            }),
        )
        .await;

        info!(%payment_id, amount = %earnings, "Realtor payout processed");
        Ok(ProcessedPayout {
            payment_id,
            event_id: event.id,
            amount: earnings,
            processed_at,
        })
    }
}
