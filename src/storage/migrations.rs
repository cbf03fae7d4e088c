use log::info;
use sqlx::SqlitePool;

use crate::utils::error::GatewayError;

pub struct DatabaseMigrations;

impl DatabaseMigrations {
    pub async fn run_migrations(pool: &SqlitePool) -> Result<(), GatewayError> {
        info!("🔄 Running database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS migrations (
                id INTEGER PRIMARY KEY,
                version TEXT NOT NULL UNIQUE,
                applied_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
        "#,
        )
        .execute(pool)
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to create migrations table: {}", e)))?;

        Self::apply_migration_v1(pool).await?;
        Self::apply_migration_v2(pool).await?;
        Self::apply_migration_v3(pool).await?;

        info!("✅ All migrations completed");
        Ok(())
    }

    async fn is_applied(pool: &SqlitePool, version: &str) -> Result<bool, GatewayError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM migrations WHERE version = ?)")
            .bind(version)
            .fetch_one(pool)
            .await?;
        Ok(exists)
    }

    async fn apply_migration_v1(pool: &SqlitePool) -> Result<(), GatewayError> {
        if Self::is_applied(pool, "v1").await? {
            return Ok(());
        }
        info!("📦 Applying migration v1: buffer and configuration tables");

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS buffered_readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sensor_id INTEGER NOT NULL,
                sensor_name TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                value REAL NOT NULL,
                raw_value REAL NOT NULL,
                synced BOOLEAN NOT NULL DEFAULT 0,
                synced_at_ms INTEGER
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sensors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                protocol TEXT NOT NULL,
                connection TEXT NOT NULL,
                formula TEXT NOT NULL DEFAULT 'val',
                unit TEXT,
                poll_interval_ms INTEGER NOT NULL,
                timeout_ms INTEGER NOT NULL,
                enabled BOOLEAN NOT NULL DEFAULT 1,
                twin_attribute TEXT,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS automation_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                condition TEXT NOT NULL,
                target_sensor_id INTEGER NOT NULL,
                target_value REAL NOT NULL,
                cooldown_s INTEGER NOT NULL DEFAULT 60,
                enabled BOOLEAN NOT NULL DEFAULT 1,
                last_triggered_ms INTEGER
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS report_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                interval_minutes INTEGER NOT NULL,
                sensor_ids TEXT NOT NULL,
                stat_types TEXT NOT NULL,
                enabled BOOLEAN NOT NULL DEFAULT 1,
                next_run_at_ms INTEGER NOT NULL,
                last_run_at_ms INTEGER,
                last_error TEXT
            )
            "#,
        ];

        let mut tx = pool.begin().await?;
        for sql in statements {
            sqlx::query(sql).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT INTO migrations (version) VALUES ('v1')")
            .execute(&mut *tx)
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to record migration v1: {}", e)))?;
        tx.commit().await?;
        Ok(())
    }

    async fn apply_migration_v2(pool: &SqlitePool) -> Result<(), GatewayError> {
        if Self::is_applied(pool, "v2").await? {
            return Ok(());
        }
        info!("📦 Applying migration v2: buffer indexes");

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_buffer_synced ON buffered_readings(synced, id)",
            "CREATE INDEX IF NOT EXISTS idx_buffer_sensor_time ON buffered_readings(sensor_id, timestamp_ms)",
        ];
        for sql in indexes {
            sqlx::query(sql).execute(pool).await?;
        }

        sqlx::query("INSERT INTO migrations (version) VALUES ('v2')")
            .execute(pool)
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to record migration v2: {}", e)))?;
        Ok(())
    }

    async fn apply_migration_v3(pool: &SqlitePool) -> Result<(), GatewayError> {
        if Self::is_applied(pool, "v3").await? {
            return Ok(());
        }
        info!("📦 Applying migration v3: rejected readings");

        let mut tx = pool.begin().await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rejected_readings (
                id INTEGER PRIMARY KEY,
                sensor_id INTEGER NOT NULL,
                sensor_name TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                value REAL NOT NULL,
                raw_value REAL NOT NULL,
                reason TEXT NOT NULL,
                rejected_at_ms INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT INTO migrations (version) VALUES ('v3')")
            .execute(&mut *tx)
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to record migration v3: {}", e)))?;
        tx.commit().await?;
        Ok(())
    }
}
