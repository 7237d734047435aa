use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::repositories::Repositories;

/// Opens (creating if needed) the SQLite database at `database_url` and runs
/// migrations.
///
/// # Errors
///
/// Returns an error if the parent directory cannot be created, the connection
/// fails, or migrations fail.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    if let Some(file_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(file_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("Invalid database url {database_url}"))?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database {database_url}"))?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    info!(url = database_url, "Database ready");
    Ok(pool)
}

/// An in-memory database with the full schema, for tests and dry runs.
///
/// Limited to one connection: every `:memory:` connection is its own database.
/// The connection is never reaped, so the pool runs no background timers.
///
/// # Errors
///
/// Returns an error if the connection or migrations fail.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Handle to every repository, cheap to clone across tasks.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    repos: Repositories,
}

impl Database {
    /// # Errors
    ///
    /// See [`connect`].
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        Ok(Self::from_pool(connect(database_url, max_connections).await?))
    }

    /// # Errors
    ///
    /// See [`connect_in_memory`].
    pub async fn in_memory() -> Result<Self> {
        Ok(Self::from_pool(connect_in_memory().await?))
    }

    #[must_use]
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            repos: Repositories::new(pool.clone()),
            pool,
        }
    }

    #[must_use]
    pub const fn repos(&self) -> &Repositories {
        &self.repos
    }

    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes every pooled connection. Writes are committed per statement.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
