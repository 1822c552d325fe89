use std::sync::Arc;

use axum::http::StatusCode;
use tracing::error;

use notez_db::Database;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub jwt_secret: String,
}

impl AppStateInner {
    pub fn new(db: Arc<Database>, jwt_secret: impl Into<String>) -> AppState {
        Arc::new(Self {
            db,
            jwt_secret: jwt_secret.into(),
        })
    }

    /// Run a database call off the async runtime. Failures are logged and
    /// surface as 500.
    pub async fn db_call<F, T>(&self, what: &'static str, f: F) -> Result<T, StatusCode>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error ({}): {}", what, e);
                StatusCode::INTERNAL_SERVER_ERROR
            })?
            .map_err(|e| {
                error!("{} failed: {:#}", what, e);
                StatusCode::INTERNAL_SERVER_ERROR
            })
    }
}
