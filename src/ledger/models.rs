use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum number of transfer attempts for one logical money movement.
/// Once the third attempt fails the event is surfaced for manual admin
/// intervention instead of being retried again.
pub const MAX_TRANSFER_ATTEMPTS: i32 = 3;

/// Closed set of money movements the platform performs for a booking.
/// Never extended at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementEventType {
    ReleaseRoomFeeSplit,
    ReleaseDepositToCustomer,
    PayRealtorFromDeposit,
    RefundRoomFeeToCustomer,
}

impl SettlementEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementEventType::ReleaseRoomFeeSplit => "release_room_fee_split",
            SettlementEventType::ReleaseDepositToCustomer => "release_deposit_to_customer",
            SettlementEventType::PayRealtorFromDeposit => "pay_realtor_from_deposit",
            SettlementEventType::RefundRoomFeeToCustomer => "refund_room_fee_to_customer",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "release_room_fee_split" => Some(SettlementEventType::ReleaseRoomFeeSplit),
            "release_deposit_to_customer" => Some(SettlementEventType::ReleaseDepositToCustomer),
            "pay_realtor_from_deposit" => Some(SettlementEventType::PayRealtorFromDeposit),
            "refund_room_fee_to_customer" => Some(SettlementEventType::RefundRoomFeeToCustomer),
            _ => None,
        }
    }
}

impl fmt::Display for SettlementEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Provider-reported outcome of a transfer, as a tagged union rather than an
/// open-ended payload. Reconciliation pattern-matches over this exhaustively.
///
/// Confirmed, Failed and Reversed are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderOutcome {
    Pending,
    Confirmed {
        reference: String,
        confirmed_at: DateTime<Utc>,
    },
    Failed {
        reason: String,
        retry_count: i32,
    },
    Reversed {
        reversed_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Pending,
    Confirmed,
    Failed,
    Reversed,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Pending => "pending",
            OutcomeKind::Confirmed => "confirmed",
            OutcomeKind::Failed => "failed",
            OutcomeKind::Reversed => "reversed",
        }
    }
}

impl ProviderOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            ProviderOutcome::Pending => OutcomeKind::Pending,
            ProviderOutcome::Confirmed { .. } => OutcomeKind::Confirmed,
            ProviderOutcome::Failed { .. } => OutcomeKind::Failed,
            ProviderOutcome::Reversed { .. } => OutcomeKind::Reversed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProviderOutcome::Pending)
    }

    /// Whether a replayed signal carries the same meaning as this outcome.
    /// Timestamps are ignored: the same webhook delivered twice may be parsed
    /// at different instants but still reports the same fact.
    pub fn matches(&self, other: &ProviderOutcome) -> bool {
        match (self, other) {
            (ProviderOutcome::Pending, ProviderOutcome::Pending) => true,
            (
                ProviderOutcome::Confirmed { reference: a, .. },
                ProviderOutcome::Confirmed { reference: b, .. },
            ) => a == b,
            (
                ProviderOutcome::Failed { reason: a, .. },
                ProviderOutcome::Failed { reason: b, .. },
            ) => a == b,
            (ProviderOutcome::Reversed { .. }, ProviderOutcome::Reversed { .. }) => true,
            _ => false,
        }
    }
}

/// One recorded attempt to move money for a booking. Rows are never deleted;
/// the outcome is the only field that transitions after creation, and only
/// away from `Pending`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub event_type: SettlementEventType,
    pub amount: Decimal,
    pub currency: String,
    pub executed_at: DateTime<Utc>,
    /// Provider-assigned identifier, unique across distinct events once set.
    pub transaction_reference: Option<String>,
    pub outcome: ProviderOutcome,
    /// 1-based attempt number for this logical movement.
    pub attempt: i32,
    /// The failed or reversed event this one retries/compensates, if any.
    pub retry_of: Option<Uuid>,
}

impl SettlementEvent {
    pub fn is_terminal(&self) -> bool {
        self.outcome.is_terminal()
    }
}

/// Append-only trail of successful ledger mutations. No settlement event row
/// is ever overwritten destructively; each change lands here as evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerHistoryEntry {
    pub id: Uuid,
    pub event_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub detail: serde_json::Value,
}

/// Exclusive ownership of a named recurring job. At most one non-expired lock
/// per `job_name` exists at any instant; an expired lock is implicitly
/// unlocked and acquisition supersedes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLock {
    pub id: Uuid,
    pub job_name: String,
    pub locked_at: DateTime<Utc>,
    pub locked_by: String,
    pub expires_at: DateTime<Utc>,
    /// Working set the lock covers, kept for observability and so an operator
    /// can judge whether a stuck lock's coverage is safe to abandon.
    pub booking_ids: Vec<Uuid>,
}

impl JobLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Versioned configuration value. History is preserved through the audit log,
/// never by row-versioning the setting itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSetting {
    pub key: String,
    pub value: serde_json::Value,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

pub const COMMISSION_RATE_KEY: &str = "commission_rate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    CommissionRateChanged,
    PayoutProcessed,
    LockForceReleased,
    WebhookReceived,
    WebhookRejected,
    MaxRetriesReached,
    CompensationRecorded,
    /// A provider transfer was accepted but the reference could not be
    /// attached to its ledger event; the poll cannot reconcile it, so the
    /// row needs manual repair.
    OrphanedTransfer,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::CommissionRateChanged => "commission_rate_changed",
            AuditEventType::PayoutProcessed => "payout_processed",
            AuditEventType::LockForceReleased => "lock_force_released",
            AuditEventType::WebhookReceived => "webhook_received",
            AuditEventType::WebhookRejected => "webhook_rejected",
            AuditEventType::MaxRetriesReached => "max_retries_reached",
            AuditEventType::CompensationRecorded => "compensation_recorded",
            AuditEventType::OrphanedTransfer => "orphaned_transfer",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Uuid,
    pub event_type: AuditEventType,
    pub entity_id: Option<Uuid>,
    pub actor: Option<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditLog {
    pub fn new(
        event_type: AuditEventType,
        entity_id: Option<Uuid>,
        actor: Option<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            entity_id,
            actor,
            details,
            created_at: Utc::now(),
        }
    }
}

/// One effective commission-rate change, reconstructed from the audit trail.
#[derive(Debug, Clone)]
pub struct RateChangeRecord {
    pub rate: Decimal,
    pub effective_from: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "completed" => Some(PaymentStatus::Completed),
            "refunded" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }
}

/// Payment record owned by the booking flow; the settlement core only writes
/// back `realtor_earnings` and `commission_paid_out`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub realtor_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub realtor_earnings: Option<Decimal>,
    pub commission_paid_out: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    CheckedIn,
    CheckedOut,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::CheckedIn => "checked_in",
            BookingStatus::CheckedOut => "checked_out",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "checked_in" => Some(BookingStatus::CheckedIn),
            "checked_out" => Some(BookingStatus::CheckedOut),
            "cancelled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }
}

/// Booking snapshot consumed by the eligibility scan. The settlement core
/// never mutates bookings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub guest_id: Uuid,
    pub realtor_id: Uuid,
    pub status: BookingStatus,
    pub room_fee: Decimal,
    pub deposit: Decimal,
    pub currency: String,
    pub check_in: DateTime<Utc>,
    pub check_out: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn outcome_terminality() {
        assert!(!ProviderOutcome::Pending.is_terminal());
        assert!(ProviderOutcome::Confirmed {
            reference: "trf_1".into(),
            confirmed_at: Utc::now(),
        }
        .is_terminal());
        assert!(ProviderOutcome::Reversed { reversed_at: Utc::now() }.is_terminal());
    }

    #[test]
    fn replayed_confirmation_matches_despite_timestamp() {
        let first = ProviderOutcome::Confirmed {
            reference: "trf_1".into(),
            confirmed_at: Utc::now(),
        };
        let replay = ProviderOutcome::Confirmed {
            reference: "trf_1".into(),
            confirmed_at: Utc::now() + chrono::Duration::seconds(30),
        };
        assert!(first.matches(&replay));

        let other = ProviderOutcome::Confirmed {
            reference: "trf_2".into(),
            confirmed_at: Utc::now(),
        };
        assert!(!first.matches(&other));
        assert!(!first.matches(&ProviderOutcome::Reversed { reversed_at: Utc::now() }));
    }

    #[test]
    fn event_type_round_trips_through_storage_form() {
        for ty in [
            SettlementEventType::ReleaseRoomFeeSplit,
            SettlementEventType::ReleaseDepositToCustomer,
            SettlementEventType::PayRealtorFromDeposit,
            SettlementEventType::RefundRoomFeeToCustomer,
        ] {
            assert_eq!(SettlementEventType::from_str(ty.as_str()), Some(ty));
        }
        assert_eq!(SettlementEventType::from_str("mint_tokens"), None);
    }

    #[test]
    fn outcome_serializes_tagged() {
        let outcome = ProviderOutcome::Failed {
            reason: "insufficient provider balance".into(),
            retry_count: 2,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["kind"], "failed");
        assert_eq!(json["retry_count"], 2);
        let back: ProviderOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(back, outcome);
    }

    #[test]
    fn zero_amount_is_representable() {
        let event = SettlementEvent {
            id: Uuid::new_v4(),
            booking_id: Uuid::new_v4(),
            event_type: SettlementEventType::ReleaseDepositToCustomer,
            amount: dec!(0),
            currency: "USD".into(),
            executed_at: Utc::now(),
            transaction_reference: None,
            outcome: ProviderOutcome::Pending,
            attempt: 1,
            retry_of: None,
        };
        assert!(!event.is_terminal());
    }
}
