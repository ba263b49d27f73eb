// Connection pool management for the three backing stores.

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::config::StoreConfig;
use crate::domain::Result;

/// Which store a pool backs; selects the migration set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Config,
    Telemetry,
    Queue,
}

impl StoreKind {
    fn migrator(&self) -> sqlx::migrate::Migrator {
        match self {
            StoreKind::Config => sqlx::migrate!("./migrations/config"),
            StoreKind::Telemetry => sqlx::migrate!("./migrations/telemetry"),
            StoreKind::Queue => sqlx::migrate!("./migrations/queue"),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            StoreKind::Config => "config",
            StoreKind::Telemetry => "telemetry",
            StoreKind::Queue => "queue",
        }
    }
}

/// Open a pool for the given store and run its migrations.
pub async fn connect(kind: StoreKind, config: &StoreConfig) -> Result<Pool<Sqlite>> {
    info!(store = kind.name(), url = %config.url, "Opening store pool");

    let options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(config.connection_timeout_secs))
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true);

    // An in-memory database exists per connection; a larger pool would
    // hand out empty databases.
    let max_connections = if config.url.contains(":memory:") {
        1
    } else {
        config.max_connections
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(config.connection_timeout_secs))
        .connect_with(options)
        .await?;

    kind.migrator()
        .run(&pool)
        .await
        .map_err(|e| crate::domain::AgentTraceError::internal(format!("migration failed: {e}")))?;

    info!(store = kind.name(), "Store pool ready");
    Ok(pool)
}

/// Health probe used by the readiness endpoint.
pub async fn health_check(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
