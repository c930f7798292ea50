//! Shared PostgreSQL test harness.
//!
//! Every test gets its own throwaway PostgreSQL container. Set
//! SKIP_POSTGRES_TESTS=1 to skip, or have Docker unavailable. Only
//! container-start failures cause a skip; schema or connection errors still
//! panic so real regressions are not silently swallowed.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use steward_core::{RetryPolicy, RetryStep};
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

/// Stable prefix for Docker/container startup failures.
/// Tests use this marker to decide whether to skip due to unavailable Docker.
pub const POSTGRES_CONTAINER_START_ERR_PREFIX: &str = "postgres-container-start:";

/// A disposable PostgreSQL instance plus a connection pool into it.
pub struct TestDb {
    pub pool: PgPool,
    pub url: String,
    _container: ContainerAsync<Postgres>,
}

impl TestDb {
    pub async fn new() -> Result<Self, String> {
        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .map_err(|e| {
                format!(
                    "{POSTGRES_CONTAINER_START_ERR_PREFIX} failed to start PostgreSQL container: {e}"
                )
            })?;

        let host = container.get_host().await.map_err(|e| e.to_string())?;
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .map_err(|e| e.to_string())?;
        let url = format!("postgres://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| format!("failed to connect: {e}"))?;

        Ok(Self {
            pool,
            url,
            _container: container,
        })
    }

    /// A second pool into the same database, e.g. a single-connection pool
    /// for observing session state.
    #[allow(dead_code)]
    pub async fn pool_with(&self, max_connections: u32) -> PgPool {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(&self.url)
            .await
            .expect("failed to open extra pool")
    }
}

/// Start a test database, skipping the test when Docker is unavailable or
/// SKIP_POSTGRES_TESTS is set.
pub async fn db_or_skip() -> Option<TestDb> {
    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return None;
    }
    match TestDb::new().await {
        Ok(db) => Some(db),
        Err(msg) if msg.starts_with(POSTGRES_CONTAINER_START_ERR_PREFIX) => {
            eprintln!("Skipping PostgreSQL test (Docker unavailable): {msg}");
            None
        }
        Err(msg) => panic!("PostgreSQL test setup failed: {msg}"),
    }
}

/// A three-step schedule short enough for tests to exhaust quickly.
#[allow(dead_code)]
pub fn short_retry_policy() -> RetryPolicy {
    RetryPolicy::new(vec![RetryStep::from_millis(50, 10); 3])
}
