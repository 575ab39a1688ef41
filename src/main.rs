use anyhow::Result;
use axum::{Router, extract::DefaultBodyLimit};
use filedrop::{
    config::AppConfig,
    handlers::AppState,
    routes,
    services::retention_store::{RetentionPolicy, RetentionStore},
};
use std::{fs, io::ErrorKind, path::Path};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config ---
    let cfg = AppConfig::from_env_and_args()?;
    tracing::info!("Starting filedrop with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize core service ---
    let store = RetentionStore::new(
        cfg.storage_dir.clone(),
        RetentionPolicy {
            retention: cfg.retention,
            delete_on_download: cfg.delete_on_download,
            max_size_bytes: cfg.max_upload_bytes,
            allowed_extensions: cfg.allowed_extensions.clone(),
        },
    );

    // --- Optional background sweep (lazy sweep remains authoritative) ---
    if let Some(interval) = cfg.sweep_interval {
        let sweeper = store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match sweeper.sweep_expired().await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "background sweep removed objects"),
                    Err(err) => tracing::warn!(error = %err, "background sweep failed"),
                }
            }
        });
    }

    // --- Build router ---
    let state = AppState {
        store,
        admin_token: cfg.admin_token.clone(),
        public_base_url: cfg.public_base_url.clone(),
    };
    let body_limit = usize::try_from(cfg.max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(64 * 1024);
    let app: Router = routes::routes::routes()
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state);

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
    axum::serve(listener, app).await?;

    Ok(())
}
