use chrono::{Duration as ChronoDuration, Utc};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::automation::{AutomationEngine, AutomationRule, RuleDefinition};
use crate::config::settings::Config;
use crate::drivers::{DefaultDriverFactory, DriverEvent, DriverFactory};
use crate::formula::{self, FormulaTestResult};
use crate::reports::{ReportJob, ReportJobDefinition, ReportScheduler};
use crate::sensors::{Sensor, SensorDefinition, SensorRegistry};
use crate::services::command_listener::CommandListener;
use crate::services::pipeline::{LiveEvent, ReadingPipeline};
use crate::services::synchronizer::{BufferStatus, Synchronizer};
use crate::services::twin::{DeviceProfile, MqttTwinPublisher, TwinForwarder, TwinPublisher};
use crate::sink::{InfluxSink, MemorySink, TimeSeriesSink};
use crate::storage::{BufferStore, ConfigStore, SqliteConfigStore, SqliteManager};
use crate::utils::error::GatewayError;

struct Running {
    shutdown: watch::Sender<bool>,
    pipeline_stop: watch::Sender<bool>,
    pipeline: JoinHandle<()>,
    synchronizer: JoinHandle<()>,
    automation: Option<JoinHandle<()>>,
    command_listener: Option<CommandListener>,
}

/// Owns every component and exposes the management operations.
pub struct Gateway {
    config: Config,
    database: SqliteManager,
    store: Arc<dyn ConfigStore>,
    registry: Arc<SensorRegistry>,
    synchronizer: Arc<Synchronizer>,
    automation: Arc<AutomationEngine>,
    reports: Arc<ReportScheduler>,
    pipeline: Arc<ReadingPipeline>,
    twin_client: Option<Arc<MqttTwinPublisher>>,
    events: Mutex<Option<mpsc::Receiver<DriverEvent>>>,
    running: Mutex<Option<Running>>,
}

impl Gateway {
    /// Opens the database and connects the configured sink and twin broker.
    pub async fn open(config: Config) -> Result<Self, GatewayError> {
        config.validate()?;
        info!("🚀 Initializing gateway '{}'", config.gateway.name);
        let database = SqliteManager::new(&config.database).await?;

        let sink: Arc<dyn TimeSeriesSink> = if config.influxdb.enabled {
            Arc::new(InfluxSink::new(config.influxdb.clone())?)
        } else {
            info!("📝 InfluxDB disabled, readings stay in the local sink");
            Arc::new(MemorySink::new())
        };

        let twin_client = config
            .digital_twin
            .enabled
            .then(|| Arc::new(MqttTwinPublisher::connect(&config.digital_twin)));
        let twin_publisher = twin_client.clone().map(|c| c as Arc<dyn TwinPublisher>);

        let mut gateway = Self::assemble(config, database, sink, twin_publisher, Arc::new(DefaultDriverFactory));
        gateway.twin_client = twin_client;
        Ok(gateway)
    }

    /// Wires the components around an open database.
    pub fn assemble(
        config: Config,
        database: SqliteManager,
        sink: Arc<dyn TimeSeriesSink>,
        twin: Option<Arc<dyn TwinPublisher>>,
        factory: Arc<dyn DriverFactory>,
    ) -> Self {
        let pool = database.pool().clone();
        let store: Arc<dyn ConfigStore> = Arc::new(SqliteConfigStore::new(pool.clone()));
        let buffer = Arc::new(BufferStore::new(pool, &config.buffer));

        let (events_tx, events_rx) = mpsc::channel(config.pipeline.queue_capacity.max(1));
        let registry = Arc::new(SensorRegistry::new(factory, config.drivers.clone(), events_tx));

        let forwarder = twin.map(|publisher| {
            Arc::new(TwinForwarder::new(publisher, Arc::clone(&registry), config.digital_twin.topic.clone()))
        });
        let synchronizer = Arc::new(Synchronizer::new(
            Arc::clone(&buffer),
            Arc::clone(&sink),
            forwarder,
            config.buffer.clone(),
        ));

        let automation = Arc::new(AutomationEngine::new(
            Arc::clone(&registry) as Arc<dyn crate::automation::ActuatorWriter>,
            Some(Arc::clone(&store)),
            ChronoDuration::minutes(config.automation.history_retention_minutes as i64),
        ));
        let pipeline = Arc::new(ReadingPipeline::new(
            Arc::clone(&registry),
            buffer,
            config.automation.enabled.then(|| Arc::clone(&automation)),
            config.pipeline.live_capacity,
        ));
        let reports = Arc::new(ReportScheduler::new(
            sink,
            Arc::clone(&registry),
            Arc::clone(&store),
            config.reports.output_dir.clone(),
        ));

        Self {
            config,
            database,
            store,
            registry,
            synchronizer,
            automation,
            reports,
            pipeline,
            twin_client: None,
            events: Mutex::new(Some(events_rx)),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Loads persisted entities and starts every background task.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(GatewayError::Conflict("gateway already started".into()));
        }
        let events = self
            .events
            .lock()
            .await
            .take()
            .ok_or_else(|| GatewayError::Conflict("gateway cannot be restarted".into()))?;

        for (id, definition) in self.store.list_sensors().await? {
            let name = definition.name.clone();
            if let Err(e) = self.registry.add(id, definition).await {
                error!("❌ Sensor {} '{}' not loaded: {}", id, name, e);
            }
        }
        for rule in self.store.list_rules().await? {
            let id = rule.id;
            if let Err(e) = self.automation.upsert_rule(rule).await {
                error!("❌ Rule {} not loaded: {}", id, e);
            }
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (pipeline_stop, pipeline_stop_rx) = watch::channel(false);
        let pipeline = tokio::spawn(Arc::clone(&self.pipeline).run(events, pipeline_stop_rx));
        let synchronizer = tokio::spawn(Arc::clone(&self.synchronizer).run(shutdown_rx.clone()));

        let automation = if self.config.automation.enabled {
            let tick = Duration::from_millis(self.config.automation.tick_ms.max(10));
            Some(tokio::spawn(Arc::clone(&self.automation).run(tick, shutdown_rx)))
        } else {
            info!("⏸️  Automation disabled");
            None
        };

        if self.config.reports.enabled {
            for job in self.store.list_report_jobs().await? {
                self.reports.schedule(job).await;
            }
        }

        let command_listener = self.config.command_listener.enabled.then(|| {
            CommandListener::start(
                &self.config.command_listener,
                self.config.command_topic(),
                Arc::clone(&self.registry),
            )
        });

        *running = Some(Running { shutdown, pipeline_stop, pipeline, synchronizer, automation, command_listener });
        info!(
            "✅ Gateway '{}' running with {} sensor(s)",
            self.config.gateway.name,
            self.registry.list().await.len()
        );
        Ok(())
    }

    /// Drivers first, then the pipeline drains its queue into the buffer,
    /// then one last sync attempt, then reports and automation.
    pub async fn shutdown(&self) -> Result<(), GatewayError> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        info!("🛑 Shutting down gateway '{}'", self.config.gateway.name);

        if let Some(listener) = &running.command_listener {
            listener.stop();
        }
        self.registry.stop_all().await;

        let _ = running.pipeline_stop.send(true);
        if let Err(e) = running.pipeline.await {
            warn!("⚠️  Pipeline task ended abnormally: {}", e);
        }

        let _ = running.shutdown.send(true);
        let _ = running.synchronizer.await;
        match self.synchronizer.flush().await {
            Ok(n) => info!("☁️  Final sync pushed {} record(s)", n),
            Err(e) => warn!("⚠️  Final sync failed, records stay buffered: {}", e),
        }

        self.reports.stop_all().await;
        if let Some(automation) = running.automation {
            let _ = automation.await;
        }
        if let Some(twin) = &self.twin_client {
            twin.close();
        }
        self.database.close().await;
        info!("👋 Gateway stopped");
        Ok(())
    }

    // sensors

    pub async fn list_sensors(&self) -> Vec<Sensor> {
        self.registry.list().await
    }

    pub async fn get_sensor(&self, id: i64) -> Result<Sensor, GatewayError> {
        self.registry.get(id).await.ok_or_else(|| GatewayError::NotFound(format!("sensor {}", id)))
    }

    pub async fn create_sensor(&self, definition: SensorDefinition) -> Result<Sensor, GatewayError> {
        definition.validate()?;
        let id = self.store.insert_sensor(&definition).await?;
        match self.registry.add(id, definition).await {
            Ok(sensor) => Ok(sensor),
            Err(e) => {
                if let Err(cleanup) = self.store.delete_sensor(id).await {
                    warn!("⚠️  Could not roll back sensor {}: {}", id, cleanup);
                }
                Err(e)
            }
        }
    }

    pub async fn update_sensor(&self, id: i64, definition: SensorDefinition) -> Result<Sensor, GatewayError> {
        definition.validate()?;
        let previous = self.get_sensor(id).await?;
        if !definition.connection.is_writable() && !self.automation.rules_targeting(id).await.is_empty() {
            return Err(GatewayError::Conflict(format!(
                "sensor {} is the target of automation rules and must stay writable",
                id
            )));
        }
        let store = Arc::clone(&self.store);
        let stored = definition.clone();
        let sensor = self
            .registry
            .update_persisted(id, definition, async move { store.update_sensor(id, &stored).await })
            .await?;
        if previous.definition.name != sensor.definition.name {
            self.automation.forget_sensor(&previous.definition.name);
        }
        Ok(sensor)
    }

    pub async fn delete_sensor(&self, id: i64) -> Result<(), GatewayError> {
        let sensor = self.get_sensor(id).await?;
        let rules = self.automation.rules_targeting(id).await;
        if !rules.is_empty() {
            return Err(GatewayError::Conflict(format!("sensor {} is the target of rule(s) {:?}", id, rules)));
        }
        self.store.delete_sensor(id).await?;
        self.registry.remove(id).await?;
        self.automation.forget_sensor(&sensor.definition.name);
        Ok(())
    }

    pub fn test_formula(&self, expression: &str, test_value: f64) -> FormulaTestResult {
        formula::test_formula(expression, test_value)
    }

    pub async fn write_sensor(&self, id: i64, value: f64) -> Result<(), GatewayError> {
        self.registry.write(id, value).await
    }

    // buffer & twin

    pub async fn buffer_status(&self) -> Result<BufferStatus, GatewayError> {
        self.synchronizer.status().await
    }

    pub async fn flush_buffer(&self) -> Result<u64, GatewayError> {
        self.synchronizer.flush().await
    }

    pub async fn device_profile(&self) -> DeviceProfile {
        DeviceProfile::from_sensors(&self.config.gateway.name, &self.registry.list().await)
    }

    pub fn subscribe_live(&self) -> broadcast::Receiver<LiveEvent> {
        self.pipeline.subscribe()
    }

    // automation rules

    async fn check_rule(&self, definition: &RuleDefinition) -> Result<(), GatewayError> {
        definition.validate()?;
        self.automation.check_condition(&definition.condition)?;
        if !self.registry.is_writable(definition.target_sensor_id).await? {
            return Err(GatewayError::Validation(format!(
                "target sensor {} is not write-capable",
                definition.target_sensor_id
            )));
        }
        Ok(())
    }

    pub async fn list_rules(&self) -> Vec<AutomationRule> {
        self.automation.rules().await
    }

    pub async fn create_rule(&self, definition: RuleDefinition) -> Result<AutomationRule, GatewayError> {
        self.check_rule(&definition).await?;
        let id = self.store.insert_rule(&definition).await?;
        let rule = AutomationRule { id, definition, last_triggered: None };
        self.automation.upsert_rule(rule.clone()).await?;
        info!("🤖 Rule {} '{}' created", id, rule.definition.name);
        Ok(rule)
    }

    pub async fn update_rule(&self, id: i64, definition: RuleDefinition) -> Result<AutomationRule, GatewayError> {
        let existing = self
            .automation
            .rule(id)
            .await
            .ok_or_else(|| GatewayError::NotFound(format!("rule {}", id)))?;
        self.check_rule(&definition).await?;
        self.store.update_rule(id, &definition).await?;
        let rule = AutomationRule { id, definition, last_triggered: existing.last_triggered };
        self.automation.upsert_rule(rule.clone()).await?;
        Ok(rule)
    }

    pub async fn delete_rule(&self, id: i64) -> Result<(), GatewayError> {
        self.store.delete_rule(id).await?;
        self.automation.remove_rule(id).await;
        Ok(())
    }

    // report jobs

    async fn check_report(&self, definition: &mut ReportJobDefinition) -> Result<(), GatewayError> {
        definition.normalize();
        definition.validate()?;
        for id in &definition.sensor_ids {
            if self.registry.get(*id).await.is_none() {
                return Err(GatewayError::Validation(format!("report references unknown sensor {}", id)));
            }
        }
        Ok(())
    }

    async fn find_report_job(&self, id: i64) -> Result<ReportJob, GatewayError> {
        self.store
            .list_report_jobs()
            .await?
            .into_iter()
            .find(|j| j.id == id)
            .ok_or_else(|| GatewayError::NotFound(format!("report job {}", id)))
    }

    async fn reschedule(&self, job: &ReportJob) {
        if self.config.reports.enabled && self.running.lock().await.is_some() {
            self.reports.schedule(job.clone()).await;
        }
    }

    pub async fn list_report_jobs(&self) -> Result<Vec<ReportJob>, GatewayError> {
        self.store.list_report_jobs().await
    }

    pub async fn create_report_job(&self, mut definition: ReportJobDefinition) -> Result<ReportJob, GatewayError> {
        self.check_report(&mut definition).await?;
        let next_run_at = Utc::now() + definition.interval();
        let id = self.store.insert_report_job(&definition, next_run_at).await?;
        let job = self.find_report_job(id).await?;
        self.reschedule(&job).await;
        info!("📄 Report job {} '{}' created", id, job.definition.name);
        Ok(job)
    }

    /// A changed interval restarts the schedule from now.
    pub async fn update_report_job(
        &self,
        id: i64,
        mut definition: ReportJobDefinition,
    ) -> Result<ReportJob, GatewayError> {
        self.check_report(&mut definition).await?;
        let mut job = self.find_report_job(id).await?;
        if job.definition.interval_minutes != definition.interval_minutes {
            job.next_run_at = Utc::now() + definition.interval();
        }
        job.definition = definition;
        self.store.update_report_job(&job).await?;
        self.reports.unschedule(id).await;
        self.reschedule(&job).await;
        Ok(job)
    }

    pub async fn delete_report_job(&self, id: i64) -> Result<(), GatewayError> {
        self.store.delete_report_job(id).await?;
        self.reports.unschedule(id).await;
        Ok(())
    }
}
