use paysession_backend::api::{self, AppState};
use paysession_backend::cache::{init_cache_pool, CacheConfig, RedisCache};
use paysession_backend::config::AppConfig;
use paysession_backend::database::ledger_repository::{IdempotencyLedger, PgLedgerRepository};
use paysession_backend::database::memory::{
    MemoryAuditLog, MemoryLedger, MemoryOrderBook, MemorySessionStore,
};
use paysession_backend::database::order_repository::PgOrderRepository;
use paysession_backend::database::session_repository::PgSessionRepository;
use paysession_backend::database::webhook_audit_repository::{
    PgWebhookAuditRepository, WebhookAuditLog,
};
use paysession_backend::database::{init_pool_from_config, run_migrations};
use paysession_backend::health::HealthChecker;
use paysession_backend::locking::{DistributedLock, MemoryLock, RedisLock};
use paysession_backend::logging::init_tracing;
use paysession_backend::payments::gateway::PaymentGateway;
use paysession_backend::payments::providers::qr_gateway::QrGatewayClient;
use paysession_backend::services::order_materializer::OrderMaterializer;
use paysession_backend::services::receipt::ReceiptIssuer;
use paysession_backend::services::{PaymentVerifier, WebhookIngress};
use paysession_backend::sessions::service::{SessionService, SessionServiceConfig};
use paysession_backend::sessions::store::{CachedSessionStore, SessionStore};
use paysession_backend::workers::{
    CleanupConfig, CleanupWorker, ReconciliationConfig, ReconciliationWorker,
};
use dotenv::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Storage and lock backends the services are wired against.
struct Backends {
    sessions: Arc<dyn SessionStore>,
    ledger: Arc<dyn IdempotencyLedger>,
    audit: Arc<dyn WebhookAuditLog>,
    orders: Arc<dyn OrderMaterializer>,
    lock: Arc<dyn DistributedLock>,
    health: HealthChecker,
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

fn in_process_backends() -> Backends {
    Backends {
        sessions: Arc::new(MemorySessionStore::new()),
        ledger: Arc::new(MemoryLedger::new()),
        audit: Arc::new(MemoryAuditLog::new()),
        orders: Arc::new(MemoryOrderBook::new()),
        lock: Arc::new(MemoryLock::new()),
        health: HealthChecker::default(),
    }
}

async fn external_backends(config: &AppConfig) -> anyhow::Result<Backends> {
    let pool = init_pool_from_config(&config.database).await?;
    run_migrations(&pool).await?;

    let cache_config = CacheConfig {
        redis_url: config.cache.redis_url.clone(),
        max_connections: config.cache.max_connections,
        ..Default::default()
    };
    let redis_pool = init_cache_pool(cache_config).await?;
    let session_ttl = Duration::from_secs(config.cache.session_ttl);
    let redis_cache = RedisCache::new(redis_pool.clone(), session_ttl);

    let sessions = CachedSessionStore::new(
        Arc::new(PgSessionRepository::new(pool.clone())),
        Arc::new(redis_cache.clone()),
        session_ttl,
    );

    Ok(Backends {
        sessions: Arc::new(sessions),
        ledger: Arc::new(PgLedgerRepository::new(pool.clone())),
        audit: Arc::new(PgWebhookAuditRepository::new(pool.clone())),
        orders: Arc::new(PgOrderRepository::new(pool.clone())),
        lock: Arc::new(RedisLock::new(redis_pool)),
        health: HealthChecker::new(Some(pool), Some(redis_cache)),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env may carry RUST_LOG and LOG_FORMAT
    dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env().map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;
    config.validate().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;

    let skip_externals = std::env::var("SKIP_EXTERNALS")
        .unwrap_or_else(|_| "false".to_string())
        .to_lowercase()
        == "true";

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        skip_externals,
        "Starting payment session service"
    );

    let backends = if skip_externals {
        warn!("SKIP_EXTERNALS=true: sessions, ledger and locks are kept in process memory");
        in_process_backends()
    } else {
        external_backends(&config).await?
    };

    let gateway: Arc<dyn PaymentGateway> = Arc::new(QrGatewayClient::from_config(&config.gateway)?);

    let mut verifier = PaymentVerifier::new(
        backends.sessions.clone(),
        backends.ledger.clone(),
        gateway.clone(),
        backends.orders.clone(),
        config.sweeps.claim_lease,
    );
    if config.gateway.receipt_enabled {
        info!(
            receiver_type = %config.gateway.receipt_receiver_type,
            "Tax receipt issuance enabled"
        );
        verifier = verifier.with_receipts(Arc::new(ReceiptIssuer::new(
            gateway.clone(),
            backends.sessions.clone(),
            config.gateway.receipt_receiver_type.clone(),
        )));
    }
    let verifier = Arc::new(verifier);

    let session_service = SessionService::new(
        backends.sessions.clone(),
        backends.ledger.clone(),
        gateway.clone(),
        verifier.clone(),
        SessionServiceConfig {
            settlement: config.settlement.clone(),
            callback_base_url: config.webhook.public_callback_base_url.clone(),
            check_cooldown: config.sweeps.check_cooldown,
        },
    );
    let ingress = WebhookIngress::new(
        verifier.clone(),
        backends.sessions.clone(),
        backends.ledger.clone(),
        backends.audit.clone(),
    );

    // Background sweeps
    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let mut worker_handles: Vec<JoinHandle<()>> = Vec::new();

    if config.sweeps.reconcile_enabled {
        let worker = ReconciliationWorker::new(
            backends.sessions.clone(),
            verifier.clone(),
            backends.lock.clone(),
            ReconciliationConfig::from(&config.sweeps),
        );
        worker_handles.push(tokio::spawn(worker.run(worker_shutdown_rx.clone())));
    } else {
        info!("Reconciliation sweep disabled (RECONCILE_ENABLED=false)");
    }

    if config.sweeps.cleanup_enabled {
        let worker = CleanupWorker::new(
            backends.sessions.clone(),
            backends.ledger.clone(),
            backends.audit.clone(),
            backends.lock.clone(),
            CleanupConfig::from(&config.sweeps),
        );
        worker_handles.push(tokio::spawn(worker.run(worker_shutdown_rx.clone())));
    } else {
        info!("Cleanup sweep disabled (CLEANUP_ENABLED=false)");
    }

    let app = api::router(AppState {
        sessions: Arc::new(session_service),
        webhooks: Arc::new(ingress),
        health: backends.health,
        internal_token: Arc::from(config.webhook.internal_token.as_str()),
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(address = %addr, error = %e, "Failed to bind listener");
        e
    })?;
    info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx.clone()))
        .await?;

    let _ = worker_shutdown_tx.send(true);
    for handle in worker_handles {
        if tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .is_err()
        {
            error!("Timed out waiting for sweep shutdown");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
