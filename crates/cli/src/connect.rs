//! Connection pool construction from configuration.

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::str::FromStr;
use steward_core::DatabaseConfig;

/// Build a pool for one database target. A `url` takes precedence over the
/// individual fields; `statement_timeout` is applied to every pooled session
/// so stray maintenance queries cannot hang forever (operations that need
/// longer lift it explicitly).
pub async fn pool(config: &DatabaseConfig) -> Result<PgPool> {
    let mut opts = if let Some(url) = &config.url {
        PgConnectOptions::from_str(url).context("invalid database url")?
    } else {
        let host = config
            .host
            .as_deref()
            .context("database config missing 'host'")?;
        let database = config
            .database
            .as_deref()
            .context("database config missing 'database'")?;
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(config.port.unwrap_or(5432))
            .database(database);
        if let Some(username) = &config.username {
            opts = opts.username(username);
        }
        if let Some(password) = &config.password {
            opts = opts.password(password);
        }
        opts
    };

    if let Some(timeout_ms) = config.statement_timeout_ms {
        opts = opts.options([("statement_timeout", format!("{timeout_ms}ms"))]);
    }

    // Log connection info without credentials.
    tracing::info!(
        host = config.host.as_deref().unwrap_or("<from url>"),
        database = config.database.as_deref().unwrap_or("<from url>"),
        max_connections = config.max_connections,
        "connecting to PostgreSQL"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(opts)
        .await
        .context("failed to connect to PostgreSQL")?;
    Ok(pool)
}
