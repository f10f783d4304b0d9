use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::api::handler::{
    booking_settlement, change_commission_rate, force_release_lock, health_check, list_locks,
    process_payout, provider_webhook, run_sweep, settlement_stats, AppState,
};

pub fn create_app(state: AppState) -> Router {
    info!("Setting up HTTP routes");

    Router::new()
        // Public liveness probe
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Settlement engine
                .route("/settlement/sweep", post(run_sweep))
                .route("/locks", get(list_locks))
                .route("/locks/:id", delete(force_release_lock))
                // Booking trail
                .route("/bookings/:id/settlement", get(booking_settlement))
                // Platform settings
                .route("/settings/commission-rate", put(change_commission_rate))
                // Payouts
                .route("/payments/:id/payout", post(process_payout))
                // Provider callbacks
                .route("/webhook/provider", post(provider_webhook))
                // Operational statistics
                .route("/health/stats", get(settlement_stats)),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_server(app: Router, bind_address: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!(%bind_address, "HTTP server listening");
    axum::serve(listener, app).await
}
