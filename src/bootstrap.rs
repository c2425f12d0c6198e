use std::{sync::Arc, time::Duration};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::{info, warn};
use crate::{
    api::handler::AppState,
    config::{AppConfig, StorageBackend},
    error::AppResult,
    ingest::{HttpStatementSource, StatementSource, StoredStatementSource},
    ledger::{MemoryLedger, PgLedgerRepository, ReconStore},
    reconciliation::{ReconciliationScheduler, Reconciler, ResolutionDesk},
    settlement::{LoggingNotifier, SettlementAggregator, SettlementLifecycle, SettlementNotifier},
};

pub async fn initialize_app_state(config: AppConfig) -> AppResult<AppState> {
    info!("Initializing application components ...");

    let store: Arc<dyn ReconStore> = match config.storage()? {
        StorageBackend::Postgres => {
            let pool = initialize_database(&config.database_url).await?;
            Arc::new(PgLedgerRepository::new(pool))
        }
        StorageBackend::Memory => {
            warn!("⚠️  STORAGE_BACKEND=memory - state is lost on restart");
            Arc::new(MemoryLedger::new())
        }
    };

    // Uploaded statements serve every gateway without a pull URL
    let stored: Arc<dyn StatementSource> = Arc::new(StoredStatementSource::new(store.clone()));
    let urls = config.statement_urls()?;
    let source: Arc<dyn StatementSource> = if urls.is_empty() {
        info!("✅ Statement source: uploads only");
        stored
    } else {
        info!(
            "✅ Statement source: HTTP pull for {:?}, uploads for the rest",
            urls.keys().collect::<Vec<_>>()
        );
        Arc::new(HttpStatementSource::new(
            urls,
            Duration::from_secs(config.statement_fetch_timeout_secs),
            Some(stored),
        )?)
    };

    let notifier: Arc<dyn SettlementNotifier> = Arc::new(LoggingNotifier);
    let state = assemble_state(config, store, source, notifier);

    if state.config.scheduler_enabled {
        let schedule = state.config.schedule_config()?;
        info!(
            "⏰ Reconciliation scheduler: {} minute windows, {} minute settle delay, gateways {:?}",
            state.config.scheduler_window_minutes,
            state.config.scheduler_settle_delay_minutes,
            schedule.gateways
        );
        ReconciliationScheduler::new(schedule, state.reconciler.clone()).start();
        info!("✅ Reconciliation scheduler started");
    } else {
        info!("Reconciliation scheduler disabled; runs are on demand");
    }

    Ok(state)
}

/// Wire the engine components over a store and a statement source
pub fn assemble_state(
    config: AppConfig,
    store: Arc<dyn ReconStore>,
    source: Arc<dyn StatementSource>,
    notifier: Arc<dyn SettlementNotifier>,
) -> AppState {
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        source,
        config.reconciler_settings(),
    ));
    let desk = Arc::new(ResolutionDesk::new(store.clone()));
    let aggregator = Arc::new(SettlementAggregator::new(
        store.clone(),
        notifier.clone(),
        config.default_currency.clone(),
        config.default_refund_lookback_days,
    ));
    let lifecycle = Arc::new(SettlementLifecycle::new(
        store.clone(),
        notifier,
        config.statement_base_url.clone(),
    ));

    AppState {
        store,
        reconciler,
        desk,
        aggregator,
        lifecycle,
        config: Arc::new(config),
    }
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(50)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: 50 max connections");

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
