use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::models::*;
use crate::{
    commission::CommissionService,
    error::AppResult,
    health::{HealthReporter, HealthStats},
    ledger::Ledger,
    locks::JobLockManager,
    reconcile::{Reconciler, WebhookDisposition},
    settlement::sweep::SettlementEngine,
};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger>,
    pub locks: Arc<JobLockManager>,
    pub commission: Arc<CommissionService>,
    pub engine: Arc<SettlementEngine>,
    pub reconciler: Arc<Reconciler>,
    pub health: Arc<HealthReporter>,
}

const ACTOR_HEADER: &str = "x-actor";

fn actor_from(headers: &HeaderMap) -> String {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("api")
        .to_string()
}

/// Liveness probe
/// GET /health
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Trigger a settlement sweep immediately
/// POST /api/v1/settlement/sweep
pub async fn run_sweep(State(state): State<AppState>) -> AppResult<Json<SweepResponse>> {
    let report = state.engine.run_sweep().await?;
    Ok(Json(report.into()))
}

/// List currently held job locks
/// GET /api/v1/locks
pub async fn list_locks(State(state): State<AppState>) -> AppResult<Json<Vec<LockView>>> {
    let locks = state.locks.active_locks().await?;
    Ok(Json(locks.into_iter().map(LockView::from).collect()))
}

/// Force-release a stuck job lock (audited)
/// DELETE /api/v1/locks/:id
pub async fn force_release_lock(
    State(state): State<AppState>,
    Path(lock_id): Path<Uuid>,
    Query(query): Query<ForceReleaseQuery>,
) -> AppResult<Json<LockView>> {
    let released = state.locks.force_release(lock_id, &query.actor).await?;
    Ok(Json(released.into()))
}

/// Settlement trail for one booking
/// GET /api/v1/bookings/:id/settlement
pub async fn booking_settlement(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
) -> AppResult<Json<BookingSettlementResponse>> {
    let events = state.ledger.events_for_booking(booking_id).await?;
    Ok(Json(BookingSettlementResponse {
        booking_id,
        events: events.into_iter().map(EventView::from).collect(),
    }))
}

/// Change the platform commission rate
/// PUT /api/v1/settings/commission-rate
pub async fn change_commission_rate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChangeRateRequest>,
) -> AppResult<Json<ChangeRateResponse>> {
    let actor = actor_from(&headers);
    info!(new_rate = %request.new_rate, actor, "Commission rate change requested");
    let change = state
        .commission
        .change_rate(
            request.new_rate,
            &request.reason,
            request.effective_from,
            &actor,
        )
        .await?;
    Ok(Json(ChangeRateResponse {
        old_rate: change.old_rate,
        new_rate: change.new_rate,
        realtors_notified: change.realtors_notified,
    }))
}

/// Pay a realtor their share for a completed payment
/// POST /api/v1/payments/:id/payout
pub async fn process_payout(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<PayoutRequest>,
) -> AppResult<Json<PayoutResponse>> {
    let actor = actor_from(&headers);
    let payout = state
        .commission
        .process_payout(payment_id, &request.payout_reference, &actor)
        .await?;
    Ok(Json(PayoutResponse {
        payment_id: payout.payment_id,
        event_id: payout.event_id,
        amount: payout.amount,
        processed_at: payout.processed_at,
    }))
}

/// Provider outcome webhook. The raw body is consumed as bytes so the
/// signature is verified over exactly what was sent.
/// POST /api/v1/webhook/provider
pub async fn provider_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookAck>> {
    let signature = headers
        .get("x-webhook-signature")
        .and_then(|v| v.to_str().ok());
    let disposition = state.reconciler.handle_webhook(&body, signature).await?;
    Ok(Json(WebhookAck {
        disposition: match disposition {
            WebhookDisposition::Applied => "applied",
            WebhookDisposition::Duplicate => "duplicate",
            WebhookDisposition::Ignored => "ignored",
        },
    }))
}

/// Settlement statistics over a recent window
/// GET /api/v1/health/stats?window_hours=24
pub async fn settlement_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> AppResult<Json<HealthStats>> {
    let window = query.window_hours.clamp(1, 24 * 30);
    let stats = state.health.stats(window).await?;
    Ok(Json(stats))
}
