use anyhow::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::Config;

/// Connect to Postgres. The pool is created once at startup and handed to
/// every component that touches the metadata store.
pub async fn connect(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db.max_connections)
        .connect(&config.db.connection_string)
        .await?;

    Ok(pool)
}
