//! Postgres connection pool.

use secrecy::ExposeSecret;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::WorkerConfig;

/// Connect the shared pool used by the job and project stores.
pub async fn connect(config: &WorkerConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(config.database_url.expose_secret())
        .await
}
