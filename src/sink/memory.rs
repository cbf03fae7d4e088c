use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{Sample, TimeSeriesSink};
use crate::storage::models::{millis_to_datetime, BufferedRecord};
use crate::utils::error::SyncError;

/// In-process sink keyed by (sensor_id, timestamp). Reachability can be
/// toggled to simulate outages, and sensors can be refused to simulate
/// points the server will never accept.
pub struct MemorySink {
    points: Mutex<BTreeMap<(i64, i64), f64>>,
    arrival: Mutex<Vec<(i64, i64)>>,
    refused: Mutex<HashSet<i64>>,
    available: AtomicBool,
    write_calls: AtomicUsize,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            points: Mutex::new(BTreeMap::new()),
            arrival: Mutex::new(Vec::new()),
            refused: Mutex::new(HashSet::new()),
            available: AtomicBool::new(true),
            write_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Batches containing a record of `sensor_id` are rejected as a whole.
    pub fn refuse_sensor(&self, sensor_id: i64) {
        if let Ok(mut refused) = self.refused.lock() {
            refused.insert(sensor_id);
        }
    }

    pub fn len(&self) -> usize {
        self.points.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Keys in the order they were first written.
    pub fn arrival_order(&self) -> Vec<(i64, i64)> {
        self.arrival.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn insert(&self, sample: Sample) {
        if let Ok(mut points) = self.points.lock() {
            points.insert((sample.sensor_id, sample.timestamp.timestamp_millis()), sample.value);
        }
    }
}

#[async_trait]
impl TimeSeriesSink for MemorySink {
    async fn write(&self, records: &[BufferedRecord]) -> Result<(), SyncError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(SyncError::Unreachable("memory sink offline".to_string()));
        }
        let refused = self
            .refused
            .lock()
            .map_err(|_| SyncError::Unreachable("memory sink poisoned".to_string()))?;
        if let Some(bad) = records.iter().find(|r| refused.contains(&r.sensor_id)) {
            return Err(SyncError::Rejected(format!("sensor {} refused", bad.sensor_id)));
        }
        drop(refused);
        let mut points = self
            .points
            .lock()
            .map_err(|_| SyncError::Unreachable("memory sink poisoned".to_string()))?;
        let mut arrival = self
            .arrival
            .lock()
            .map_err(|_| SyncError::Unreachable("memory sink poisoned".to_string()))?;
        for record in records {
            let key = (record.sensor_id, record.timestamp.timestamp_millis());
            if points.insert(key, record.value).is_none() {
                arrival.push(key);
            }
        }
        Ok(())
    }

    async fn query(
        &self,
        sensor_ids: &[i64],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>, SyncError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(SyncError::Unreachable("memory sink offline".to_string()));
        }
        let points = self
            .points
            .lock()
            .map_err(|_| SyncError::Unreachable("memory sink poisoned".to_string()))?;
        let (from, to) = (start.timestamp_millis(), end.timestamp_millis());
        Ok(points
            .iter()
            .filter(|((id, ts), _)| sensor_ids.contains(id) && *ts >= from && *ts <= to)
            .map(|((id, ts), value)| Sample { sensor_id: *id, timestamp: millis_to_datetime(*ts), value: *value })
            .collect())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(sensor_id: i64, ts: DateTime<Utc>, value: f64) -> BufferedRecord {
        BufferedRecord {
            id: 0,
            sensor_id,
            sensor_name: "s".into(),
            timestamp: ts,
            value,
            raw_value: value,
            synced: false,
            synced_at: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_writes_are_noops() {
        let sink = MemorySink::new();
        let t = Utc::now();
        let batch = vec![record(1, t, 1.0), record(1, t + Duration::seconds(1), 2.0)];
        sink.write(&batch).await.unwrap();
        sink.write(&batch).await.unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.arrival_order().len(), 2);
    }

    #[tokio::test]
    async fn test_offline_sink_fails() {
        let sink = MemorySink::new();
        sink.set_available(false);
        assert!(matches!(sink.write(&[record(1, Utc::now(), 1.0)]).await, Err(SyncError::Unreachable(_))));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_query_filters_by_sensor_and_window() {
        let sink = MemorySink::new();
        let t = Utc::now();
        sink.write(&[record(1, t, 1.0), record(2, t, 5.0), record(1, t - Duration::hours(2), 9.0)])
            .await
            .unwrap();
        let samples = sink.query(&[1], t - Duration::hours(1), t).await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 1.0);
    }
}
