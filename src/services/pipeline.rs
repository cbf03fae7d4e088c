use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

use crate::automation::AutomationEngine;
use crate::drivers::{DriverEvent, DriverEventKind};
use crate::sensors::models::Reading;
use crate::sensors::{SensorRegistry, SensorStatus};
use crate::storage::BufferStore;
use crate::utils::error::{FormulaError, GatewayError};

/// Pushed to live subscribers for every processed driver event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveEvent {
    pub sensor_id: i64,
    pub value: Option<f64>,
    pub status: SensorStatus,
    pub timestamp: DateTime<Utc>,
}

/// Turns driver events into readings: formula, sensor state, buffer,
/// automation and live fan-out.
pub struct ReadingPipeline {
    registry: Arc<SensorRegistry>,
    buffer: Arc<BufferStore>,
    automation: Option<Arc<AutomationEngine>>,
    live: broadcast::Sender<LiveEvent>,
}

impl ReadingPipeline {
    pub fn new(
        registry: Arc<SensorRegistry>,
        buffer: Arc<BufferStore>,
        automation: Option<Arc<AutomationEngine>>,
        live_capacity: usize,
    ) -> Self {
        let (live, _) = broadcast::channel(live_capacity.max(1));
        Self { registry, buffer, automation, live }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.live.subscribe()
    }

    fn publish(&self, event: LiveEvent) {
        // no subscribers is fine
        let _ = self.live.send(event);
    }

    /// Handles one event. Returns the stored reading, if any.
    pub async fn process(&self, event: DriverEvent) -> Option<Reading> {
        let Some(active) = self.registry.active(event.sensor_id, event.generation).await else {
            debug!("Dropping event of replaced driver for sensor {}", event.sensor_id);
            return None;
        };

        match event.kind {
            DriverEventKind::Value(raw) => {
                let outcome = if raw.is_finite() {
                    active.formula.apply(raw)
                } else {
                    Err(FormulaError::Domain(format!("raw value {} is not finite", raw)))
                };
                let value = match outcome {
                    Ok(value) => value,
                    Err(e) => {
                        warn!("⚠️  Formula of sensor '{}' failed on {}: {}", active.name, raw, e);
                        if let Some(automation) = &self.automation {
                            automation.sensor_unavailable(&active.name);
                        }
                        self.registry
                            .mark_failure(event.sensor_id, event.generation, SensorStatus::Error, e.to_string())
                            .await;
                        self.publish(LiveEvent {
                            sensor_id: event.sensor_id,
                            value: None,
                            status: SensorStatus::Error,
                            timestamp: event.timestamp,
                        });
                        return None;
                    }
                };

                if !self
                    .registry
                    .mark_online(event.sensor_id, event.generation, value, raw, event.timestamp)
                    .await
                {
                    return None;
                }
                let reading = Reading {
                    sensor_id: event.sensor_id,
                    sensor_name: active.name,
                    timestamp: event.timestamp,
                    raw_value: raw,
                    value,
                };

                match self.buffer.append(&reading).await {
                    Ok(_) => {}
                    Err(GatewayError::BufferFull(msg)) => warn!("🧺 Reading of sensor {} rejected: {}", reading.sensor_id, msg),
                    Err(e) => warn!("⚠️  Could not buffer reading of sensor {}: {}", reading.sensor_id, e),
                }
                if let Some(automation) = &self.automation {
                    automation.observe(&reading);
                }
                self.publish(LiveEvent {
                    sensor_id: reading.sensor_id,
                    value: Some(value),
                    status: SensorStatus::Online,
                    timestamp: reading.timestamp,
                });
                Some(reading)
            }
            DriverEventKind::Failure(error) => {
                let status = if error.is_connection_level() { SensorStatus::Offline } else { SensorStatus::Error };
                if let Some(automation) = &self.automation {
                    automation.sensor_unavailable(&active.name);
                }
                self.registry
                    .mark_failure(event.sensor_id, event.generation, status, error.to_string())
                    .await;
                self.publish(LiveEvent { sensor_id: event.sensor_id, value: None, status, timestamp: event.timestamp });
                None
            }
        }
    }

    /// Consumes events until `stop` flips, then closes the queue and drains
    /// whatever is still in it.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<DriverEvent>, mut stop: watch::Receiver<bool>) {
        info!("🚰 Reading pipeline started");
        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                biased;
                res = stop.changed() => if res.is_err() { break },
                event = events.recv() => match event {
                    Some(event) => { self.process(event).await; }
                    None => break,
                },
            }
        }

        events.close();
        let mut drained = 0usize;
        while let Some(event) = events.recv().await {
            self.process(event).await;
            drained += 1;
        }
        info!("🚰 Reading pipeline stopped ({} queued events drained)", drained);
    }
}
