use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::config::settings::{BufferConfig, OverflowPolicy};
use crate::sensors::models::Reading;
use crate::storage::models::{BufferCounts, BufferedRecord};
use crate::utils::error::GatewayError;

/// Durable store & forward queue. Ids come from an autoincrement column, so
/// ordering by id is append order for every sensor.
#[derive(Debug)]
pub struct BufferStore {
    pool: SqlitePool,
    max_records: u64,
    policy: OverflowPolicy,
    // capacity check and insert must not interleave between writers
    append_lock: Mutex<()>,
}

impl BufferStore {
    pub fn new(pool: SqlitePool, config: &BufferConfig) -> Self {
        Self {
            pool,
            max_records: config.max_records.max(1),
            policy: config.overflow_policy,
            append_lock: Mutex::new(()),
        }
    }

    pub async fn append(&self, reading: &Reading) -> Result<i64, GatewayError> {
        if !reading.value.is_finite() || !reading.raw_value.is_finite() {
            return Err(GatewayError::Validation(format!(
                "non-finite reading from sensor {} not buffered",
                reading.sensor_id
            )));
        }
        let _guard = self.append_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM buffered_readings")
            .fetch_one(&mut *tx)
            .await?;

        if total as u64 >= self.max_records {
            let evicted = sqlx::query(
                "DELETE FROM buffered_readings WHERE id = (SELECT id FROM buffered_readings WHERE synced = 1 ORDER BY id LIMIT 1)",
            )
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if evicted == 0 {
                match self.policy {
                    OverflowPolicy::RejectNew => {
                        return Err(GatewayError::BufferFull(format!(
                            "{} unsynced records, reading from sensor {} rejected",
                            total, reading.sensor_id
                        )));
                    }
                    OverflowPolicy::EvictOldestUnsynced => {
                        sqlx::query(
                            "DELETE FROM buffered_readings WHERE id = (SELECT id FROM buffered_readings ORDER BY id LIMIT 1)",
                        )
                        .execute(&mut *tx)
                        .await?;
                        warn!("⚠️  Buffer full, evicted oldest unsynced record");
                    }
                }
            }
        }

        let id = sqlx::query(
            r#"
            INSERT INTO buffered_readings (sensor_id, sensor_name, timestamp_ms, value, raw_value, synced)
            VALUES (?, ?, ?, ?, ?, 0)
        "#,
        )
        .bind(reading.sensor_id)
        .bind(&reading.sensor_name)
        .bind(reading.timestamp.timestamp_millis())
        .bind(reading.value)
        .bind(reading.raw_value)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        tx.commit().await?;
        Ok(id)
    }

    /// Oldest unsynced records first.
    pub async fn fetch_unsynced(&self, limit: usize) -> Result<Vec<BufferedRecord>, GatewayError> {
        let records = sqlx::query_as::<_, BufferedRecord>(
            "SELECT * FROM buffered_readings WHERE synced = 0 ORDER BY id ASC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Marks records as synced in one transaction. Returns how many changed state.
    pub async fn mark_synced(&self, ids: &[i64]) -> Result<u64, GatewayError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;
        for id in ids {
            updated += sqlx::query("UPDATE buffered_readings SET synced = 1, synced_at_ms = ? WHERE id = ? AND synced = 0")
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        debug!("Marked {} buffered records as synced", updated);
        Ok(updated)
    }

    pub async fn counts(&self) -> Result<BufferCounts, GatewayError> {
        let (unsynced, synced): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN synced = 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN synced = 1 THEN 1 ELSE 0 END), 0)
            FROM buffered_readings
        "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(BufferCounts { unsynced, synced })
    }

    /// Moves an unsynced record the sink refuses to accept out of the queue,
    /// keeping it with the refusal reason.
    pub async fn quarantine(&self, id: i64, reason: &str) -> Result<bool, GatewayError> {
        let mut tx = self.pool.begin().await?;
        let moved = sqlx::query(
            r#"
            INSERT INTO rejected_readings (id, sensor_id, sensor_name, timestamp_ms, value, raw_value, reason, rejected_at_ms)
            SELECT id, sensor_id, sensor_name, timestamp_ms, value, raw_value, ?, ?
            FROM buffered_readings WHERE id = ? AND synced = 0
        "#,
        )
        .bind(reason)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        sqlx::query("DELETE FROM buffered_readings WHERE id = ? AND synced = 0")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        if moved > 0 {
            warn!("🚫 Buffered record {} quarantined: {}", id, reason);
        }
        Ok(moved > 0)
    }

    pub async fn rejected_count(&self) -> Result<i64, GatewayError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rejected_readings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Deletes synced records that were synced before `cutoff`.
    pub async fn prune_synced(&self, cutoff: DateTime<Utc>) -> Result<u64, GatewayError> {
        let result = sqlx::query("DELETE FROM buffered_readings WHERE synced = 1 AND synced_at_ms < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            info!("🧹 Pruned {} synced records", result.rows_affected());
        }
        Ok(result.rows_affected())
    }
}
