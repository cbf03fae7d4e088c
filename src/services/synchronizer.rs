use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use crate::config::settings::BufferConfig;
use crate::services::twin::TwinForwarder;
use crate::sink::TimeSeriesSink;
use crate::storage::models::BufferedRecord;
use crate::storage::BufferStore;
use crate::utils::error::{GatewayError, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStatus {
    pub unsynced_count: i64,
    pub synced_count: i64,
    pub rejected_count: i64,
    pub cloud_available: bool,
}

/// Pushes unsynced buffer records to the sink, oldest first.
pub struct Synchronizer {
    buffer: Arc<BufferStore>,
    sink: Arc<dyn TimeSeriesSink>,
    twin: Option<Arc<TwinForwarder>>,
    config: BufferConfig,
    cloud_available: AtomicBool,
    // one drain at a time, so batches reach the sink in id order
    flush_lock: Mutex<()>,
}

impl Synchronizer {
    pub fn new(
        buffer: Arc<BufferStore>,
        sink: Arc<dyn TimeSeriesSink>,
        twin: Option<Arc<TwinForwarder>>,
        config: BufferConfig,
    ) -> Self {
        Self {
            buffer,
            sink,
            twin,
            config,
            cloud_available: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn cloud_available(&self) -> bool {
        self.cloud_available.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> Result<BufferStatus, GatewayError> {
        let counts = self.buffer.counts().await?;
        Ok(BufferStatus {
            unsynced_count: counts.unsynced,
            synced_count: counts.synced,
            rejected_count: self.buffer.rejected_count().await?,
            cloud_available: self.cloud_available(),
        })
    }

    /// Drains the buffer in batches and returns how many records were newly
    /// synced. A sink failure stops the drain; records synced before it are
    /// still counted, and it is only an error when nothing got through.
    pub async fn flush(&self) -> Result<u64, GatewayError> {
        let _guard = self.flush_lock.lock().await;
        let batch_size = self.config.batch_size.max(1);
        let mut synced = 0u64;

        loop {
            let batch = self.buffer.fetch_unsynced(batch_size).await?;
            if batch.is_empty() {
                break;
            }
            let fetched = batch.len();

            let (accepted, refused) = match self.write_batch(batch).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    if self.cloud_available.swap(false, Ordering::SeqCst) {
                        warn!("☁️  {} sink unreachable: {}", self.sink.name(), e);
                    }
                    if synced == 0 {
                        return Err(e.into());
                    }
                    break;
                }
            };
            if !self.cloud_available.swap(true, Ordering::SeqCst) {
                info!("☁️  {} sink reachable", self.sink.name());
            }

            for (id, reason) in &refused {
                self.buffer.quarantine(*id, reason).await?;
            }
            if !accepted.is_empty() {
                let ids: Vec<i64> = accepted.iter().map(|r| r.id).collect();
                synced += self.buffer.mark_synced(&ids).await?;
                if let Some(twin) = &self.twin {
                    twin.forward(&accepted).await;
                }
            }

            if fetched < batch_size {
                break;
            }
        }

        if synced > 0 {
            debug!("Synced {} buffered records", synced);
        }
        Ok(synced)
    }

    /// Writes one batch. When the sink refuses the batch, its records are
    /// retried one by one so a single bad point cannot hold back the rest;
    /// the refused ones come back with their reason.
    async fn write_batch(&self, batch: Vec<BufferedRecord>) -> Result<(Vec<BufferedRecord>, Vec<(i64, String)>), SyncError> {
        let reason = match self.sink.write(&batch).await {
            Ok(()) => return Ok((batch, Vec::new())),
            Err(SyncError::Rejected(reason)) => reason,
            Err(e) => return Err(e),
        };
        if let [single] = batch.as_slice() {
            return Ok((Vec::new(), vec![(single.id, reason)]));
        }
        warn!("🚫 {} refused a batch of {} records ({}), isolating", self.sink.name(), batch.len(), reason);

        let mut accepted = Vec::with_capacity(batch.len());
        let mut refused = Vec::new();
        for record in batch {
            match self.sink.write(std::slice::from_ref(&record)).await {
                Ok(()) => accepted.push(record),
                Err(SyncError::Rejected(reason)) => refused.push((record.id, reason)),
                Err(e) => return Err(e),
            }
        }
        Ok((accepted, refused))
    }

    async fn prune(&self) {
        let cutoff = Utc::now() - ChronoDuration::hours(self.config.retention_hours as i64);
        if let Err(e) = self.buffer.prune_synced(cutoff).await {
            warn!("⚠️  Buffer pruning failed: {}", e);
        }
    }

    /// Periodic sync until `shutdown` flips. Failed attempts back off
    /// exponentially up to `max_backoff_ms`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_millis(self.config.sync_interval_ms.max(1));
        let max_backoff = Duration::from_millis(self.config.max_backoff_ms).max(interval);
        let mut delay = interval;

        info!("🔁 Synchronizer started (every {:?})", interval);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                res = shutdown.changed() => if res.is_err() { break },
            }
            if *shutdown.borrow() {
                break;
            }

            match self.flush().await {
                Ok(_) => {
                    delay = interval;
                    self.prune().await;
                }
                Err(e) => {
                    delay = (delay * 2).min(max_backoff);
                    debug!("Sync attempt failed, next in {:?}: {}", delay, e);
                }
            }
        }
        info!("🔁 Synchronizer stopped");
    }
}
