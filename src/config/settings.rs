use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::utils::error::GatewayError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayInfo,
    pub database: SqliteConfig,
    pub influxdb: InfluxConfig,
    pub buffer: BufferConfig,
    pub drivers: DriverConfig,
    pub pipeline: PipelineConfig,
    pub automation: AutomationConfig,
    pub reports: ReportConfig,
    pub digital_twin: DigitalTwinConfig,
    pub command_listener: CommandListenerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayInfo {
    pub name: String,
    pub description: String,
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub database_path: String,
    pub max_connections: u32,
    pub enable_wal: bool,
    pub busy_timeout_ms: u64,
    pub sync_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    pub enabled: bool,
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    pub measurement: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse new readings while the buffer is full of unsynced records.
    RejectNew,
    /// Drop the oldest unsynced record to make room.
    EvictOldestUnsynced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub batch_size: usize,
    pub sync_interval_ms: u64,
    pub max_backoff_ms: u64,
    pub retention_hours: u64,
    pub max_records: u64,
    pub overflow_policy: OverflowPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub max_backoff_ms: u64,
    pub command_queue: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub live_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub enabled: bool,
    pub tick_ms: u64,
    pub history_retention_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub enabled: bool,
    pub output_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DigitalTwinConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandListenerConfig {
    pub enabled: bool,
    pub broker: String,
    pub port: u16,
    pub topic_prefix: String,
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for GatewayInfo {
    fn default() -> Self {
        Self {
            name: "edge-gateway".to_string(),
            description: "Industrial edge gateway".to_string(),
            data_dir: "data".to_string(),
        }
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            database_path: "data/gateway.db".to_string(),
            max_connections: 5,
            enable_wal: true,
            busy_timeout_ms: 30000,
            sync_mode: "NORMAL".to_string(),
        }
    }
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:8086".to_string(),
            token: String::new(),
            org: "gateway".to_string(),
            bucket: "sensors".to_string(),
            measurement: "sensor_reading".to_string(),
            timeout_seconds: 10,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            sync_interval_ms: 5000,
            max_backoff_ms: 300_000,
            retention_hours: 24,
            max_records: 1_000_000,
            overflow_policy: OverflowPolicy::RejectNew,
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { max_backoff_ms: 60_000, command_queue: 16 }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { queue_capacity: 1024, live_capacity: 256 }
    }
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self { enabled: true, tick_ms: 1000, history_retention_minutes: 60 }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self { enabled: true, output_dir: "data/reports".to_string() }
    }
}

impl Default for DigitalTwinConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: 1883,
            topic: String::new(),
            client_id: "edge-gateway-twin".to_string(),
            username: None,
            password: None,
        }
    }
}

impl Default for CommandListenerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker: "localhost".to_string(),
            port: 1883,
            topic_prefix: "gateway".to_string(),
            client_id: "edge-gateway-cmd".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway: GatewayInfo::default(),
            database: SqliteConfig::default(),
            influxdb: InfluxConfig::default(),
            buffer: BufferConfig::default(),
            drivers: DriverConfig::default(),
            pipeline: PipelineConfig::default(),
            automation: AutomationConfig::default(),
            reports: ReportConfig::default(),
            digital_twin: DigitalTwinConfig::default(),
            command_listener: CommandListenerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, GatewayError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            GatewayError::Config(format!("Cannot read {}: {}", path.as_ref().display(), e))
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        info!("📋 Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    /// Loads the file when it exists, otherwise falls back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, GatewayError> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            warn!("⚠️  Config file {} not found, using defaults", path.as_ref().display());
            Ok(Self::default())
        }
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), GatewayError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.gateway.name.trim().is_empty() {
            return Err(GatewayError::Config("gateway.name must not be empty".into()));
        }
        if self.buffer.batch_size == 0 {
            return Err(GatewayError::Config("buffer.batch_size must be > 0".into()));
        }
        if self.buffer.max_records == 0 {
            return Err(GatewayError::Config("buffer.max_records must be > 0".into()));
        }
        if self.buffer.sync_interval_ms == 0 || self.buffer.max_backoff_ms < self.buffer.sync_interval_ms {
            return Err(GatewayError::Config(
                "buffer.max_backoff_ms must be >= buffer.sync_interval_ms > 0".into(),
            ));
        }
        if self.pipeline.queue_capacity == 0 || self.pipeline.live_capacity == 0 {
            return Err(GatewayError::Config("pipeline capacities must be > 0".into()));
        }
        if self.drivers.command_queue == 0 {
            return Err(GatewayError::Config("drivers.command_queue must be > 0".into()));
        }
        if self.automation.tick_ms == 0 {
            return Err(GatewayError::Config("automation.tick_ms must be > 0".into()));
        }
        if self.influxdb.enabled && self.influxdb.url.is_empty() {
            return Err(GatewayError::Config("influxdb.url required when enabled".into()));
        }
        if self.digital_twin.enabled && (self.digital_twin.host.is_empty() || self.digital_twin.topic.is_empty()) {
            return Err(GatewayError::Config("digital_twin.host and topic required when enabled".into()));
        }
        Ok(())
    }

    /// Topic filter used by the remote command listener.
    pub fn command_topic(&self) -> String {
        format!("{}/{}/cmd/#", self.command_listener.topic_prefix, self.gateway.name)
    }
}
