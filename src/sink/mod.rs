//! Remote time-series storage for synced readings.

pub mod influx;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::models::BufferedRecord;
use crate::utils::error::SyncError;

pub use influx::InfluxSink;
pub use memory::MemorySink;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub sensor_id: i64,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Writes must be idempotent per (sensor_id, timestamp): re-sending a record
/// that already reached the sink leaves the sink unchanged.
#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    async fn write(&self, records: &[BufferedRecord]) -> Result<(), SyncError>;

    async fn query(
        &self,
        sensor_ids: &[i64],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>, SyncError>;

    fn name(&self) -> &str;
}
