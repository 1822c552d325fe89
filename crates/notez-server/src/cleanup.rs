use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use notez_db::Database;

/// Background task that prunes expired notifications until `shutdown` fires.
pub async fn run_cleanup_loop(db: Arc<Database>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        match prune_expired(&db).await {
            Ok(count) => {
                if count > 0 {
                    info!("Cleanup: pruned {} expired notifications", count);
                }
            }
            Err(e) => {
                warn!("Cleanup error: {:#}", e);
            }
        }
    }
}

pub async fn prune_expired(db: &Arc<Database>) -> anyhow::Result<usize> {
    let db = db.clone();
    tokio::task::spawn_blocking(move || db.delete_expired_notifications(Utc::now())).await?
}
