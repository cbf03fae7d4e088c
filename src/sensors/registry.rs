use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use log::{info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::config::settings::DriverConfig;
use crate::drivers::{spawn_driver, Driver, DriverEvent, DriverFactory, DriverHandle, RunnerSettings};
use crate::formula::Formula;
use crate::sensors::models::{Sensor, SensorDefinition, SensorState, SensorStatus};
use crate::utils::error::GatewayError;

struct SensorEntry {
    sensor: Sensor,
    formula: Arc<Formula>,
    handle: Option<DriverHandle>,
    // survives `stop_all`, so events queued before shutdown still match
    generation: Option<u64>,
}

impl SensorEntry {
    fn new(sensor: Sensor, formula: Arc<Formula>, handle: Option<DriverHandle>) -> Self {
        let generation = handle.as_ref().map(|h| h.generation);
        Self { sensor, formula, handle, generation }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation == Some(generation)
    }
}

/// What the pipeline needs to transform an event of a running driver.
#[derive(Clone)]
pub struct ActiveSensor {
    pub name: String,
    pub formula: Arc<Formula>,
}

/// Single source of truth for sensor definitions, runtime state and the
/// driver task of each sensor.
///
/// Reads go through the `RwLock`. Add, update and remove additionally hold
/// `mutations`, so hot reloads are applied one at a time and a sensor never
/// has two drivers.
pub struct SensorRegistry {
    sensors: RwLock<HashMap<i64, SensorEntry>>,
    mutations: Mutex<()>,
    generation: AtomicU64,
    factory: Arc<dyn DriverFactory>,
    driver_config: DriverConfig,
    events: mpsc::Sender<DriverEvent>,
}

impl SensorRegistry {
    pub fn new(factory: Arc<dyn DriverFactory>, driver_config: DriverConfig, events: mpsc::Sender<DriverEvent>) -> Self {
        Self {
            sensors: RwLock::new(HashMap::new()),
            mutations: Mutex::new(()),
            generation: AtomicU64::new(0),
            factory,
            driver_config,
            events,
        }
    }

    fn runner_settings(&self, definition: &SensorDefinition) -> RunnerSettings {
        let poll_interval = Duration::from_millis(definition.poll_interval_ms);
        RunnerSettings {
            poll_interval,
            io_timeout: Duration::from_millis(definition.timeout_ms),
            max_backoff: Duration::from_millis(self.driver_config.max_backoff_ms).max(poll_interval),
            command_queue: self.driver_config.command_queue,
        }
    }

    fn build_driver(&self, id: i64, definition: &SensorDefinition) -> Result<Option<Box<dyn Driver>>, GatewayError> {
        if !definition.enabled {
            return Ok(None);
        }
        self.factory.create(id, definition).map(Some)
    }

    fn spawn(&self, id: i64, definition: &SensorDefinition, driver: Option<Box<dyn Driver>>) -> Option<DriverHandle> {
        let driver = driver?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Some(spawn_driver(id, generation, driver, self.runner_settings(definition), self.events.clone()))
    }

    async fn ensure_unique_name(&self, name: &str, except: Option<i64>) -> Result<(), GatewayError> {
        let sensors = self.sensors.read().await;
        if sensors.values().any(|e| e.sensor.name() == name && Some(e.sensor.id) != except) {
            return Err(GatewayError::Conflict(format!("sensor '{}' already exists", name)));
        }
        Ok(())
    }

    /// Registers a sensor and starts its driver when enabled.
    pub async fn add(&self, id: i64, definition: SensorDefinition) -> Result<Sensor, GatewayError> {
        definition.validate()?;
        let formula = Arc::new(Formula::parse(&definition.formula)?);
        let _guard = self.mutations.lock().await;

        if self.sensors.read().await.contains_key(&id) {
            return Err(GatewayError::Conflict(format!("sensor {} already registered", id)));
        }
        self.ensure_unique_name(&definition.name, None).await?;

        let driver = self.build_driver(id, &definition)?;
        let handle = self.spawn(id, &definition, driver);
        let sensor = Sensor { id, definition, state: SensorState::default() };
        info!("➕ Sensor {} '{}' ({}) registered", id, sensor.name(), sensor.protocol().as_str());
        self.sensors
            .write()
            .await
            .insert(id, SensorEntry::new(sensor.clone(), formula, handle));
        Ok(sensor)
    }

    /// Stops the driver, waits until its connection is released, then drops the sensor.
    pub async fn remove(&self, id: i64) -> Result<Sensor, GatewayError> {
        let _guard = self.mutations.lock().await;
        self.stop_driver(id).await?;
        let entry = self
            .sensors
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| GatewayError::NotFound(format!("sensor {}", id)))?;
        info!("➖ Sensor {} '{}' removed", id, entry.sensor.name());
        Ok(entry.sensor)
    }

    /// Remove-then-add under one mutation: the old driver is fully stopped
    /// before the replacement starts with a new generation.
    pub async fn update(&self, id: i64, definition: SensorDefinition) -> Result<Sensor, GatewayError> {
        self.update_persisted(id, definition, async { Ok(()) }).await
    }

    /// Like [`update`](Self::update), with `persist` awaited under the same
    /// mutation lock once the new driver is built and before the old one is
    /// stopped. Any failure up to that point leaves the running sensor as it was.
    pub async fn update_persisted<F>(&self, id: i64, definition: SensorDefinition, persist: F) -> Result<Sensor, GatewayError>
    where
        F: Future<Output = Result<(), GatewayError>> + Send,
    {
        definition.validate()?;
        let formula = Arc::new(Formula::parse(&definition.formula)?);
        let _guard = self.mutations.lock().await;

        if !self.sensors.read().await.contains_key(&id) {
            return Err(GatewayError::NotFound(format!("sensor {}", id)));
        }
        self.ensure_unique_name(&definition.name, Some(id)).await?;
        let driver = self.build_driver(id, &definition)?;
        persist.await?;

        self.stop_driver(id).await?;
        let handle = self.spawn(id, &definition, driver);
        let sensor = Sensor { id, definition, state: SensorState::default() };
        info!("🔄 Sensor {} '{}' reloaded", id, sensor.name());
        self.sensors
            .write()
            .await
            .insert(id, SensorEntry::new(sensor.clone(), formula, handle));
        Ok(sensor)
    }

    async fn stop_driver(&self, id: i64) -> Result<(), GatewayError> {
        let handle = {
            let mut sensors = self.sensors.write().await;
            let entry = sensors
                .get_mut(&id)
                .ok_or_else(|| GatewayError::NotFound(format!("sensor {}", id)))?;
            entry.handle.take()
        };
        if let Some(handle) = handle {
            handle.stop().await;
        }
        Ok(())
    }

    /// Cancels every driver and waits for all of them to disconnect.
    pub async fn stop_all(&self) {
        let _guard = self.mutations.lock().await;
        let handles: Vec<DriverHandle> = {
            let mut sensors = self.sensors.write().await;
            sensors.values_mut().filter_map(|e| e.handle.take()).collect()
        };
        let count = handles.len();
        join_all(handles.into_iter().map(|h| h.stop())).await;
        info!("⏹️  Stopped {} driver(s)", count);
    }

    pub async fn list(&self) -> Vec<Sensor> {
        let mut sensors: Vec<Sensor> = self.sensors.read().await.values().map(|e| e.sensor.clone()).collect();
        sensors.sort_by_key(|s| s.id);
        sensors
    }

    pub async fn get(&self, id: i64) -> Option<Sensor> {
        self.sensors.read().await.get(&id).map(|e| e.sensor.clone())
    }

    pub async fn find_by_name(&self, name: &str) -> Option<Sensor> {
        self.sensors
            .read()
            .await
            .values()
            .find(|e| e.sensor.name() == name)
            .map(|e| e.sensor.clone())
    }

    /// Formula and name for an event, or `None` if the event comes from a
    /// driver generation that is no longer running.
    pub async fn active(&self, id: i64, generation: u64) -> Option<ActiveSensor> {
        let sensors = self.sensors.read().await;
        let entry = sensors.get(&id).filter(|e| e.is_current(generation))?;
        Some(ActiveSensor { name: entry.sensor.name().to_string(), formula: Arc::clone(&entry.formula) })
    }

    pub async fn mark_online(&self, id: i64, generation: u64, value: f64, raw_value: f64, at: DateTime<Utc>) -> bool {
        let mut sensors = self.sensors.write().await;
        match sensors.get_mut(&id).filter(|e| e.is_current(generation)) {
            Some(entry) => {
                entry.sensor.state.mark_online(value, raw_value, at);
                true
            }
            None => false,
        }
    }

    pub async fn mark_failure(&self, id: i64, generation: u64, status: SensorStatus, error: String) -> bool {
        let mut sensors = self.sensors.write().await;
        match sensors.get_mut(&id).filter(|e| e.is_current(generation)) {
            Some(entry) => {
                entry.sensor.state.mark_failure(status, error);
                true
            }
            None => false,
        }
    }

    /// Sends a value to a write-capable sensor through its driver task.
    pub async fn write(&self, id: i64, value: f64) -> Result<(), GatewayError> {
        let writer = {
            let sensors = self.sensors.read().await;
            let entry = sensors.get(&id).ok_or_else(|| GatewayError::NotFound(format!("sensor {}", id)))?;
            if !entry.sensor.definition.connection.is_writable() {
                return Err(GatewayError::Validation(format!("sensor '{}' is not writable", entry.sensor.name())));
            }
            entry
                .handle
                .as_ref()
                .map(|h| h.writer())
                .ok_or_else(|| GatewayError::ServiceNotAvailable(format!("sensor '{}' has no running driver", entry.sensor.name())))?
        };
        writer.write(value).await.map_err(|e| {
            warn!("⚠️  Write of {} to sensor {} failed: {}", value, id, e);
            GatewayError::from(e)
        })
    }

    pub async fn is_writable(&self, id: i64) -> Result<bool, GatewayError> {
        self.sensors
            .read()
            .await
            .get(&id)
            .map(|e| e.sensor.definition.connection.is_writable())
            .ok_or_else(|| GatewayError::NotFound(format!("sensor {}", id)))
    }
}
