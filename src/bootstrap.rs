use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};
use tracing::info;

use crate::{
    api::handler::AppState,
    commission::CommissionService,
    config::Config,
    error::AppResult,
    health::HealthReporter,
    ledger::Ledger,
    locks::JobLockManager,
    notify::HttpNotifier,
    provider::HttpProvider,
    reconcile::Reconciler,
    settlement::{ScheduleConfig, SettlementEngine, SettlementScheduler, SweepConfig},
    store::{PgStore, SettlementStore},
};

pub struct App {
    pub state: AppState,
    pub scheduler: SettlementScheduler,
}

pub async fn initialize_app(config: &Config) -> AppResult<App> {
    info!("Initializing application components");

    let pool = initialize_database(&config.database_url).await?;
    let store: Arc<dyn SettlementStore> = Arc::new(PgStore::new(pool));

    let ledger = Arc::new(Ledger::new(store.clone()));
    let locks = Arc::new(JobLockManager::new(store.clone()));
    let notifier = Arc::new(HttpNotifier::new(config.notify_url.clone()));
    let provider = Arc::new(HttpProvider::new(
        config.provider_base_url.clone(),
        Duration::from_secs(config.provider_timeout_secs),
    ));

    let commission = Arc::new(CommissionService::new(
        store.clone(),
        ledger.clone(),
        notifier.clone(),
    ));
    let engine = Arc::new(SettlementEngine::new(
        store.clone(),
        ledger.clone(),
        locks.clone(),
        commission.clone(),
        provider.clone(),
        SweepConfig {
            lock_ttl: chrono::Duration::minutes(config.lock_ttl_minutes),
            max_concurrency: config.sweep_concurrency,
            provider_timeout: Duration::from_secs(config.provider_timeout_secs),
            ..SweepConfig::default()
        },
    ));
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        ledger.clone(),
        provider,
        notifier,
        config.webhook_secret.clone(),
        Duration::from_secs(config.provider_timeout_secs),
        chrono::Duration::seconds(config.poll_grace_secs),
    ));
    let health = Arc::new(HealthReporter::new(store));

    let scheduler = SettlementScheduler::new(
        ScheduleConfig {
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
        },
        engine.clone(),
        reconciler.clone(),
    );

    info!("Application components initialized");
    Ok(App {
        state: AppState {
            ledger,
            locks,
            commission,
            engine,
            reconciler,
            health,
        },
        scheduler,
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("Connecting to database");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied");
    Ok(pool)
}
