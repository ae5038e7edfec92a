use anyhow::{Context, Result};
use axum::Router;
use bundle_service::{
    AppState,
    config::{AppConfig, StagingBackend},
    db, routes,
    services::{
        bundle_repo::BundleRepository,
        bundle_service::BundleService,
        bundler::Bundler,
        chain::{ChainClient, MemoryLedger},
        object_repo::ObjectRepository,
        packer::BundlePacker,
        staging::{LocalStaging, RemoteStaging, StagingStorage},
    },
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting bundle-service with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    // Create parent directory if needed
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let db = Arc::new(
        db::connect(db_url, 5)
            .await
            .with_context(|| format!("connecting to {}", db_url))?,
    );
    db::run_migrations(&db).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Staging backend ---
    let staging: Arc<dyn StagingStorage> = match cfg.staging_backend {
        StagingBackend::Local => Arc::new(LocalStaging::new(
            Path::new(&cfg.storage_dir).join("staging"),
        )),
        StagingBackend::Remote => {
            let endpoint = cfg
                .remote_endpoint
                .clone()
                .context("remote staging endpoint is not configured")?;
            Arc::new(RemoteStaging::new(endpoint, cfg.remote_bucket.clone())?)
        }
    };

    // --- Chain clients, one per bundler account ---
    let ledger = MemoryLedger::new();
    ledger.set_auto_seal(cfg.auto_seal);
    tracing::warn!("Using the in-process chain ledger; bundles are not persisted beyond this process");
    let chains: Vec<Arc<dyn ChainClient>> = cfg
        .bundler_accounts
        .iter()
        .map(|account| Arc::new(ledger.client(account.clone())) as Arc<dyn ChainClient>)
        .collect();

    // --- Initialize core services ---
    let service = BundleService::new(
        db.clone(),
        staging.clone(),
        &chains,
        cfg.default_policy,
        cfg.max_object_size,
    );
    for account in &cfg.bundler_accounts {
        service.accounts().register(account).await?;
        tracing::info!("Registered bundler account {}", account);
    }

    let objects = ObjectRepository::new(db.clone());
    let packer = BundlePacker::new(
        objects.clone(),
        staging.clone(),
        Path::new(&cfg.storage_dir).join("work"),
    );
    let bundler = Bundler::new(
        BundleRepository::new(db.clone()),
        objects,
        packer,
        staging.clone(),
        cfg.bundler_settings(),
    );

    let shutdown = CancellationToken::new();
    let workers = bundler.spawn(chains, shutdown.clone());

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(AppState {
        service,
        db,
        staging,
    });

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // Loops finish their current tick, then exit.
    shutdown.cancel();
    for worker in workers {
        if let Err(err) = worker.await {
            tracing::warn!("bundler worker ended abnormally: {}", err);
        }
    }
    tracing::info!("Shutdown complete.");

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for Ctrl-C: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
    shutdown.cancel();
}
