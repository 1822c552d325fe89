use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use notez_api::AppStateInner;
use notez_db::Database;
use notez_gateway::{Gateway, Services};
use notez_server::cleanup;
use notez_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notez=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;
    if config.uses_placeholder_secret() {
        warn!("NOTEZ_JWT_SECRET is unset or still a placeholder; set a real secret outside development");
    }

    let db = Arc::new(Database::open(&config.db_path)?);
    let gateway = Gateway::new(
        Services::from_database(db.clone()),
        &config.jwt_secret,
        config.gateway(),
    );
    let app_state = AppStateInner::new(db.clone(), config.jwt_secret.clone());

    let shutdown = CancellationToken::new();
    let cleanup_task = tokio::spawn(cleanup::run_cleanup_loop(
        db,
        config.cleanup_interval,
        shutdown.clone(),
    ));

    let app = notez_server::router(app_state, gateway.clone());

    let addr = config.addr()?;
    info!("Notez server listening on {}", addr);
    info!(
        "Backlog {} messages, notification cleanup every {}s",
        config.backlog_size,
        config.cleanup_interval.as_secs()
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    gateway.shutdown();
    shutdown.cancel();
    let _ = cleanup_task.await;
    info!("Notez server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
