use log::info;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::config::settings::SqliteConfig;
use crate::storage::migrations::DatabaseMigrations;
use crate::utils::error::GatewayError;

/// Owns the SQLite pool shared by the buffer and the configuration store.
#[derive(Clone)]
pub struct SqliteManager {
    pool: SqlitePool,
}

impl SqliteManager {
    pub async fn new(config: &SqliteConfig) -> Result<Self, GatewayError> {
        if let Some(parent) = Path::new(&config.database_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    GatewayError::Database(format!("Failed to create database directory: {}", e))
                })?;
            }
        }

        info!("🗄️  Initializing SQLite database: {}", config.database_path);

        let options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .journal_mode(if config.enable_wal {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            })
            .synchronous(match config.sync_mode.as_str() {
                "OFF" => SqliteSynchronous::Off,
                "FULL" => SqliteSynchronous::Full,
                _ => SqliteSynchronous::Normal,
            });

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to connect to SQLite: {}", e)))?;

        Self::from_pool(pool).await
    }

    /// Private in-memory database on a single connection.
    pub async fn in_memory() -> Result<Self, GatewayError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, GatewayError> {
        DatabaseMigrations::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        info!("🔒 Closing SQLite database connections");
        self.pool.close().await;
    }
}
