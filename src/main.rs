mod api;
mod bootstrap;
mod commission;
mod config;
mod error;
mod health;
mod ledger;
mod locks;
mod notify;
mod provider;
mod reconcile;
mod server;
mod settlement;
mod store;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,escrow_backend=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    dotenv::dotenv().ok();

    info!("Starting escrow settlement backend");

    let config = config::Config::from_env()?;
    let app = bootstrap::initialize_app(&config).await?;

    // Background settlement sweeps and reconciliation polls.
    let _scheduler_handle = app.scheduler.start();

    let router = server::create_app(app.state);
    server::run_server(router, &config.bind_address).await?;

    Ok(())
}
