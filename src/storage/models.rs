use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

use crate::sensors::models::Reading;

/// A reading persisted in the store & forward buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedRecord {
    pub id: i64,
    pub sensor_id: i64,
    pub sensor_name: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub raw_value: f64,
    pub synced: bool,
    pub synced_at: Option<DateTime<Utc>>,
}

impl BufferedRecord {
    /// Unsaved record for a reading; `id` is assigned on append.
    pub fn from_reading(reading: &Reading) -> Self {
        Self {
            id: 0,
            sensor_id: reading.sensor_id,
            sensor_name: reading.sensor_name.clone(),
            timestamp: reading.timestamp,
            value: reading.value,
            raw_value: reading.raw_value,
            synced: false,
            synced_at: None,
        }
    }
}

pub(crate) fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

impl<'r> FromRow<'r, SqliteRow> for BufferedRecord {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let synced_at: Option<i64> = row.try_get("synced_at_ms")?;
        Ok(Self {
            id: row.try_get("id")?,
            sensor_id: row.try_get("sensor_id")?,
            sensor_name: row.try_get("sensor_name")?,
            timestamp: millis_to_datetime(row.try_get("timestamp_ms")?),
            value: row.try_get("value")?,
            raw_value: row.try_get("raw_value")?,
            synced: row.try_get("synced")?,
            synced_at: synced_at.map(millis_to_datetime),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferCounts {
    pub unsynced: i64,
    pub synced: i64,
}
