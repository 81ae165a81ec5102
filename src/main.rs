use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use mongodb::Database;

mod config;
mod database;
mod dtos;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use config::{AppConfig, LedgerBackend};
use database::connection::get_db_client;
use database::ledger::{InMemoryLedger, TransactionLedger};
use database::mongo_ledger::MongoLedger;
use database::reconciliation_store::{
    InMemoryReconciliationStore, MongoReconciliationStore, ReconciliationStore,
};
use services::callback_auth::CallbackAuthenticator;
use services::mpesa_service::MpesaService;
use services::payment_service::PaymentService;
use services::reconciliation_service::ReconciliationService;
use services::status_poller::PollerRegistry;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .init();

    let (db, ledger, store) = initialize_storage(&config).await?;
    let app_state = initialize_app_state(&config, db, ledger, store).await?;

    let app = routes::build_router(app_state);
    start_server(&config, app).await
}

async fn initialize_storage(
    config: &AppConfig,
) -> anyhow::Result<(
    Option<Database>,
    Arc<dyn TransactionLedger>,
    Arc<dyn ReconciliationStore>,
)> {
    match config.ledger_backend {
        LedgerBackend::Mongo => {
            let db = get_db_client(&config.database_url, &config.database_name)
                .await
                .context("failed to connect to MongoDB")?;

            let ledger = MongoLedger::new(&db);
            ledger
                .ensure_indexes()
                .await
                .context("failed to create ledger indexes")?;

            tracing::info!("🗄️ Using MongoDB ledger ({})", config.database_name);
            Ok((
                Some(db.clone()),
                Arc::new(ledger),
                Arc::new(MongoReconciliationStore::new(&db)),
            ))
        }
        LedgerBackend::Memory => {
            tracing::warn!("⚠️ Using in-memory ledger; payments are lost on restart");
            Ok((
                None,
                Arc::new(InMemoryLedger::new()),
                Arc::new(InMemoryReconciliationStore::new()),
            ))
        }
    }
}

async fn initialize_app_state(
    config: &AppConfig,
    db: Option<Database>,
    ledger: Arc<dyn TransactionLedger>,
    store: Arc<dyn ReconciliationStore>,
) -> anyhow::Result<AppState> {
    let reconciliation = Arc::new(ReconciliationService::new(
        store,
        config.variance_tolerance_percent,
    ));
    let app_state = AppState::new(db, ledger.clone(), reconciliation);

    let Some(mpesa_config) = config.mpesa.clone() else {
        tracing::warn!("MPESA_CONSUMER_KEY not set; M-Pesa payments are disabled");
        return Ok(app_state);
    };

    tracing::info!("🔧 Initializing M-Pesa service...");
    tracing::info!("📱 Short code: {}", mpesa_config.short_code);
    tracing::info!("🌐 Environment: {}", mpesa_config.environment);

    let mpesa_service = Arc::new(MpesaService::new(mpesa_config.clone())?);

    // Credential check only; every push fetches its own token.
    match mpesa_service.get_access_token().await {
        Ok(_) => tracing::info!("✅ M-Pesa access token obtained"),
        Err(e) => {
            tracing::error!("❌ Failed to get M-Pesa access token: {}", e);
            tracing::warn!("M-Pesa pushes will fail until the credentials are fixed");
        }
    }

    let callback_auth = Arc::new(
        CallbackAuthenticator::new(&mpesa_config.callback_secret)
            .context("invalid M-Pesa callback secret")?,
    );

    let payments = Arc::new(PaymentService::new(
        mpesa_service,
        ledger,
        Arc::new(PollerRegistry::new()),
        config.payment_timeout,
        config.poll_interval,
        mpesa_config.http_timeout,
    ));

    match payments.resume_pending().await {
        Ok(count) => tracing::info!("✅ M-Pesa service ready ({} pending payments resumed)", count),
        Err(e) => tracing::error!("❌ Failed to resume pending payments: {}", e),
    }

    let signature_header = mpesa_config.signature_header.clone();
    Ok(app_state
        .with_payments(payments, callback_auth, &signature_header)
        .with_mpesa_config(mpesa_config))
}

async fn start_server(config: &AppConfig, app: axum::Router) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.host, config.port))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    tracing::info!("🚀 Server starting on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("👋 Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
