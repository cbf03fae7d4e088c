use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::automation::models::{AutomationRule, RuleDefinition};
use crate::reports::models::{ReportJob, ReportJobDefinition, StatType};
use crate::sensors::models::{ConnectionParams, SensorDefinition};
use crate::storage::models::millis_to_datetime;
use crate::utils::error::GatewayError;

/// Persistence for the configuration entities.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn list_sensors(&self) -> Result<Vec<(i64, SensorDefinition)>, GatewayError>;
    async fn insert_sensor(&self, definition: &SensorDefinition) -> Result<i64, GatewayError>;
    async fn update_sensor(&self, id: i64, definition: &SensorDefinition) -> Result<(), GatewayError>;
    async fn delete_sensor(&self, id: i64) -> Result<(), GatewayError>;

    async fn list_rules(&self) -> Result<Vec<AutomationRule>, GatewayError>;
    async fn insert_rule(&self, definition: &RuleDefinition) -> Result<i64, GatewayError>;
    async fn update_rule(&self, id: i64, definition: &RuleDefinition) -> Result<(), GatewayError>;
    async fn set_rule_triggered(&self, id: i64, at: DateTime<Utc>) -> Result<(), GatewayError>;
    async fn delete_rule(&self, id: i64) -> Result<(), GatewayError>;

    async fn list_report_jobs(&self) -> Result<Vec<ReportJob>, GatewayError>;
    async fn insert_report_job(
        &self,
        definition: &ReportJobDefinition,
        next_run_at: DateTime<Utc>,
    ) -> Result<i64, GatewayError>;
    async fn update_report_job(&self, job: &ReportJob) -> Result<(), GatewayError>;
    async fn delete_report_job(&self, id: i64) -> Result<(), GatewayError>;
}

pub struct SqliteConfigStore {
    pool: SqlitePool,
}

impl SqliteConfigStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn map_unique(err: sqlx::Error, what: &str) -> GatewayError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            GatewayError::Conflict(format!("{} already exists", what))
        }
        _ => GatewayError::from(err),
    }
}

fn require_row(affected: u64, what: &str, id: i64) -> Result<(), GatewayError> {
    if affected == 0 {
        Err(GatewayError::NotFound(format!("{} {}", what, id)))
    } else {
        Ok(())
    }
}

fn sensor_from_row(row: &SqliteRow) -> Result<(i64, SensorDefinition), GatewayError> {
    let connection: String = row.try_get("connection")?;
    let connection: ConnectionParams = serde_json::from_str(&connection)?;
    let poll_interval_ms: i64 = row.try_get("poll_interval_ms")?;
    let timeout_ms: i64 = row.try_get("timeout_ms")?;
    Ok((
        row.try_get("id")?,
        SensorDefinition {
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            connection,
            formula: row.try_get("formula")?,
            unit: row.try_get("unit")?,
            poll_interval_ms: poll_interval_ms.max(0) as u64,
            timeout_ms: timeout_ms.max(0) as u64,
            enabled: row.try_get("enabled")?,
            twin_attribute: row.try_get("twin_attribute")?,
        },
    ))
}

fn rule_from_row(row: &SqliteRow) -> Result<AutomationRule, GatewayError> {
    let cooldown_s: i64 = row.try_get("cooldown_s")?;
    let last_triggered: Option<i64> = row.try_get("last_triggered_ms")?;
    Ok(AutomationRule {
        id: row.try_get("id")?,
        definition: RuleDefinition {
            name: row.try_get("name")?,
            condition: row.try_get("condition")?,
            target_sensor_id: row.try_get("target_sensor_id")?,
            target_value: row.try_get("target_value")?,
            cooldown_s: cooldown_s.max(0) as u64,
            enabled: row.try_get("enabled")?,
        },
        last_triggered: last_triggered.map(millis_to_datetime),
    })
}

fn job_from_row(row: &SqliteRow) -> Result<ReportJob, GatewayError> {
    let sensor_ids: String = row.try_get("sensor_ids")?;
    let stat_types: String = row.try_get("stat_types")?;
    let interval_minutes: i64 = row.try_get("interval_minutes")?;
    let last_run_at: Option<i64> = row.try_get("last_run_at_ms")?;
    Ok(ReportJob {
        id: row.try_get("id")?,
        definition: ReportJobDefinition {
            name: row.try_get("name")?,
            interval_minutes: interval_minutes.clamp(1, i64::from(u32::MAX)) as u32,
            sensor_ids: serde_json::from_str(&sensor_ids)?,
            stat_types: serde_json::from_str::<Vec<StatType>>(&stat_types)?,
            enabled: row.try_get("enabled")?,
        },
        next_run_at: millis_to_datetime(row.try_get("next_run_at_ms")?),
        last_run_at: last_run_at.map(millis_to_datetime),
        last_error: row.try_get("last_error")?,
    })
}

#[async_trait]
impl ConfigStore for SqliteConfigStore {
    async fn list_sensors(&self) -> Result<Vec<(i64, SensorDefinition)>, GatewayError> {
        let rows = sqlx::query("SELECT * FROM sensors ORDER BY id").fetch_all(&self.pool).await?;
        rows.iter().map(sensor_from_row).collect()
    }

    async fn insert_sensor(&self, definition: &SensorDefinition) -> Result<i64, GatewayError> {
        let result = sqlx::query(
            r#"
            INSERT INTO sensors (name, description, protocol, connection, formula, unit,
                                 poll_interval_ms, timeout_ms, enabled, twin_attribute)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        )
        .bind(&definition.name)
        .bind(&definition.description)
        .bind(definition.protocol().as_str())
        .bind(serde_json::to_string(&definition.connection)?)
        .bind(&definition.formula)
        .bind(&definition.unit)
        .bind(definition.poll_interval_ms as i64)
        .bind(definition.timeout_ms as i64)
        .bind(definition.enabled)
        .bind(&definition.twin_attribute)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, &format!("sensor '{}'", definition.name)))?;
        Ok(result.last_insert_rowid())
    }

    async fn update_sensor(&self, id: i64, definition: &SensorDefinition) -> Result<(), GatewayError> {
        let result = sqlx::query(
            r#"
            UPDATE sensors SET name = ?, description = ?, protocol = ?, connection = ?, formula = ?,
                               unit = ?, poll_interval_ms = ?, timeout_ms = ?, enabled = ?, twin_attribute = ?
            WHERE id = ?
        "#,
        )
        .bind(&definition.name)
        .bind(&definition.description)
        .bind(definition.protocol().as_str())
        .bind(serde_json::to_string(&definition.connection)?)
        .bind(&definition.formula)
        .bind(&definition.unit)
        .bind(definition.poll_interval_ms as i64)
        .bind(definition.timeout_ms as i64)
        .bind(definition.enabled)
        .bind(&definition.twin_attribute)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, &format!("sensor '{}'", definition.name)))?;
        require_row(result.rows_affected(), "sensor", id)
    }

    async fn delete_sensor(&self, id: i64) -> Result<(), GatewayError> {
        let result = sqlx::query("DELETE FROM sensors WHERE id = ?").bind(id).execute(&self.pool).await?;
        require_row(result.rows_affected(), "sensor", id)
    }

    async fn list_rules(&self) -> Result<Vec<AutomationRule>, GatewayError> {
        let rows = sqlx::query("SELECT * FROM automation_rules ORDER BY id").fetch_all(&self.pool).await?;
        rows.iter().map(rule_from_row).collect()
    }

    async fn insert_rule(&self, definition: &RuleDefinition) -> Result<i64, GatewayError> {
        let result = sqlx::query(
            r#"
            INSERT INTO automation_rules (name, condition, target_sensor_id, target_value, cooldown_s, enabled)
            VALUES (?, ?, ?, ?, ?, ?)
        "#,
        )
        .bind(&definition.name)
        .bind(&definition.condition)
        .bind(definition.target_sensor_id)
        .bind(definition.target_value)
        .bind(definition.cooldown_s as i64)
        .bind(definition.enabled)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn update_rule(&self, id: i64, definition: &RuleDefinition) -> Result<(), GatewayError> {
        let result = sqlx::query(
            r#"
            UPDATE automation_rules SET name = ?, condition = ?, target_sensor_id = ?, target_value = ?,
                                        cooldown_s = ?, enabled = ?
            WHERE id = ?
        "#,
        )
        .bind(&definition.name)
        .bind(&definition.condition)
        .bind(definition.target_sensor_id)
        .bind(definition.target_value)
        .bind(definition.cooldown_s as i64)
        .bind(definition.enabled)
        .bind(id)
        .execute(&self.pool)
        .await?;
        require_row(result.rows_affected(), "rule", id)
    }

    async fn set_rule_triggered(&self, id: i64, at: DateTime<Utc>) -> Result<(), GatewayError> {
        sqlx::query("UPDATE automation_rules SET last_triggered_ms = ? WHERE id = ?")
            .bind(at.timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_rule(&self, id: i64) -> Result<(), GatewayError> {
        let result = sqlx::query("DELETE FROM automation_rules WHERE id = ?").bind(id).execute(&self.pool).await?;
        require_row(result.rows_affected(), "rule", id)
    }

    async fn list_report_jobs(&self) -> Result<Vec<ReportJob>, GatewayError> {
        let rows = sqlx::query("SELECT * FROM report_jobs ORDER BY id").fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn insert_report_job(
        &self,
        definition: &ReportJobDefinition,
        next_run_at: DateTime<Utc>,
    ) -> Result<i64, GatewayError> {
        let result = sqlx::query(
            r#"
            INSERT INTO report_jobs (name, interval_minutes, sensor_ids, stat_types, enabled, next_run_at_ms)
            VALUES (?, ?, ?, ?, ?, ?)
        "#,
        )
        .bind(&definition.name)
        .bind(i64::from(definition.interval_minutes))
        .bind(serde_json::to_string(&definition.sensor_ids)?)
        .bind(serde_json::to_string(&definition.stat_types)?)
        .bind(definition.enabled)
        .bind(next_run_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn update_report_job(&self, job: &ReportJob) -> Result<(), GatewayError> {
        let result = sqlx::query(
            r#"
            UPDATE report_jobs SET name = ?, interval_minutes = ?, sensor_ids = ?, stat_types = ?, enabled = ?,
                                   next_run_at_ms = ?, last_run_at_ms = ?, last_error = ?
            WHERE id = ?
        "#,
        )
        .bind(&job.definition.name)
        .bind(i64::from(job.definition.interval_minutes))
        .bind(serde_json::to_string(&job.definition.sensor_ids)?)
        .bind(serde_json::to_string(&job.definition.stat_types)?)
        .bind(job.definition.enabled)
        .bind(job.next_run_at.timestamp_millis())
        .bind(job.last_run_at.map(|t| t.timestamp_millis()))
        .bind(&job.last_error)
        .bind(job.id)
        .execute(&self.pool)
        .await?;
        require_row(result.rows_affected(), "report job", job.id)
    }

    async fn delete_report_job(&self, id: i64) -> Result<(), GatewayError> {
        let result = sqlx::query("DELETE FROM report_jobs WHERE id = ?").bind(id).execute(&self.pool).await?;
        require_row(result.rows_affected(), "report job", id)
    }
}
