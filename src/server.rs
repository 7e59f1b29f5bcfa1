//! HTTP server bootstrap for the sync middleware.
//!
//! This module wires together:
//! - configuration
//! - the SQLite store and list catalog
//! - core services (router, scheduler, ingest, reconcile, admin)
//! - the Axum router

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::admin::AdminService;
use crate::auth::{admin_auth_middleware, AdminSecret};
use crate::collaborators::{ExternalSystems, InMemorySystems};
use crate::domain::EventSource;
use crate::handlers::{ContactSyncHandler, MessageSyncHandler};
use crate::infra::{EventLedger, JobQueue, Result, Store, SyncError};
use crate::ingest::IngestService;
use crate::membership::{CatalogCache, CatalogSource, MembershipReconciler};
use crate::reconcile::{ReconcileConfig, ReconcileRunner};
use crate::router::{Router as EventRouter, DEFAULT_ECHO_WINDOW, DEFAULT_HANDLER_TIMEOUT};
use crate::scheduler::{Scheduler, SchedulerConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL.
    pub database_url: String,
    /// Server listen address.
    pub listen_addr: SocketAddr,
    /// Maximum database connections.
    pub max_connections: u32,
    /// Secret expected in `x-admin-secret`; the server refuses to start without it.
    pub admin_secret: Option<AdminSecret>,
    /// Upper bound on one handler call.
    pub handler_timeout: Duration,
    /// How long an origin marker on an inbound event counts as our own echo.
    pub echo_window: Duration,
    pub scheduler: SchedulerConfig,
    pub reconcile: ReconcileConfig,
    pub catalog: CatalogSource,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://df_middleware.db".to_string());

        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let listen_addr: SocketAddr = format!("{host}:{port}").parse().map_err(|e| {
            SyncError::Configuration(format!("invalid listen address {host}:{port}: {e}"))
        })?;

        let max_connections: u32 = std::env::var("MAX_DB_CONNECTIONS")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8);

        let admin_secret = std::env::var("ADMIN_SECRET")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(|s| AdminSecret::new(&s))
            .transpose()?;

        let handler_timeout = std::env::var("HANDLER_TIMEOUT_MS")
            .ok()
            .and_then(|p| p.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_HANDLER_TIMEOUT);

        let echo_window = std::env::var("ECHO_WINDOW_SECS")
            .ok()
            .and_then(|p| p.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_ECHO_WINDOW);

        Ok(Self {
            database_url,
            listen_addr,
            max_connections,
            admin_secret,
            handler_timeout,
            echo_window,
            scheduler: SchedulerConfig::from_env(),
            reconcile: ReconcileConfig::from_env(),
            catalog: CatalogSource::from_env(),
        })
    }

    /// The configured admin secret
    pub fn admin_secret(&self) -> Result<AdminSecret> {
        self.admin_secret
            .clone()
            .ok_or_else(|| SyncError::Configuration("ADMIN_SECRET is not set".to_string()))
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn EventLedger>,
    pub ingest: Arc<IngestService>,
    pub admin: Arc<AdminService>,
}

/// Everything `run` starts, exposed so tests can drive the same wiring
pub struct Services {
    pub store: Store,
    pub scheduler: Arc<Scheduler>,
    pub reconcile: Arc<ReconcileRunner>,
    pub state: AppState,
}

/// Build the service graph on an open store.
///
/// Handlers talk to `systems`; the binary passes [`InMemorySystems`].
pub async fn build_services(
    store: Store,
    systems: Arc<dyn ExternalSystems>,
    config: &Config,
) -> Result<Services> {
    let catalog = Arc::new(CatalogCache::new(config.catalog.clone()));
    catalog.init().await?;

    let ledger: Arc<dyn EventLedger> = Arc::new(store.ledger());
    let jobs: Arc<dyn JobQueue> = Arc::new(store.jobs());
    let reconciler = Arc::new(MembershipReconciler::new(
        store.memberships(),
        catalog.clone(),
    ));

    let mut router = EventRouter::new(ledger.clone(), store.sync_log(), reconciler.clone())
        .with_handler_timeout(config.handler_timeout)
        .with_echo_window(config.echo_window);
    register_handlers(&mut router, systems.clone(), &store);

    let scheduler = Arc::new(Scheduler::new(
        Arc::new(router),
        jobs,
        config.scheduler.clone(),
    ));

    let reconcile = Arc::new(ReconcileRunner::new(
        scheduler.clone(),
        reconciler,
        systems,
        store.reconcile_runs(),
        config.reconcile.clone(),
    ));

    let ingest = Arc::new(IngestService::new(ledger.clone(), scheduler.clone()));
    let admin = Arc::new(
        AdminService::new(ledger.clone(), scheduler.clone(), store.sync_log(), catalog)
            .with_reconcile(reconcile.clone()),
    );

    Ok(Services {
        store,
        scheduler,
        reconcile,
        state: AppState {
            ledger,
            ingest,
            admin,
        },
    })
}

fn register_handlers(router: &mut EventRouter, systems: Arc<dyn ExternalSystems>, store: &Store) {
    let contacts = Arc::new(ContactSyncHandler::new(systems.clone(), store.mappings()));
    router.register(EventSource::Crm, "contact.*", contacts.clone());
    router.register(EventSource::Dialer, "contact.*", contacts.clone());
    router.register(EventSource::Dialer, "lead.*", contacts);

    let messages = Arc::new(MessageSyncHandler::new(systems));
    router.register(EventSource::Messaging, "message.*", messages);
}

/// Build the HTTP router.
pub fn build_router(state: AppState, secret: AdminSecret) -> Router {
    let admin = crate::api::admin_router().layer(axum::middleware::from_fn_with_state(
        Arc::new(secret),
        admin_auth_middleware,
    ));

    Router::new()
        .merge(crate::api::webhook_router())
        .nest("/admin", admin)
        .route("/health", get(crate::api::health_check))
        .route("/ready", get(crate::api::readiness_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server and background workers.
pub async fn run(config: Config) -> anyhow::Result<()> {
    info!("Starting df-middleware v{}", env!("CARGO_PKG_VERSION"));

    let secret = config.admin_secret()?;
    info!("Configuration loaded");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Max connections: {}", config.max_connections);
    info!("  Admin secret fingerprint: {}", secret.fingerprint());

    info!("Opening SQLite store...");
    let store = Store::connect(&config.database_url, config.max_connections).await?;
    info!("Store ready, migrations applied");

    let systems: Arc<dyn ExternalSystems> = Arc::new(InMemorySystems::new(store.mappings()));
    let services = build_services(store, systems, &config).await?;

    services.scheduler.start().await;
    let periodic = services
        .reconcile
        .clone()
        .spawn_periodic(services.scheduler.shutdown_signal());

    let app = build_router(services.state.clone(), secret);

    info!("Starting HTTP server on {}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;

    info!("df-middleware is ready to accept connections");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, draining workers");
    services.scheduler.stop().await;
    if let Some(task) = periodic {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Reconcile task panicked");
        }
    }
    services.store.pool().close().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
