//! Protocol drivers. One driver instance per sensor, each owned by its own
//! runner task that talks to the pipeline only through a channel.

pub mod can;
pub mod dbc;
pub mod modbus;
pub mod mqtt;
pub mod runner;
pub mod system;
pub mod virtual_output;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::sensors::models::{ConnectionParams, SensorDefinition};
use crate::utils::error::{DriverError, GatewayError};

pub use runner::{spawn_driver, DriverHandle, DriverWriter, RunnerSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverMode {
    /// `read()` performs one request; the runner calls it every poll interval.
    Polled,
    /// `read()` waits for the next pushed message and must be cancel-safe.
    EventDriven,
}

#[async_trait]
pub trait Driver: Send {
    fn mode(&self) -> DriverMode;

    async fn connect(&mut self) -> Result<(), DriverError>;

    async fn read(&mut self) -> Result<f64, DriverError>;

    async fn write(&mut self, _value: f64) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("driver is read-only".to_string()))
    }

    async fn disconnect(&mut self);
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriverEventKind {
    Value(f64),
    Failure(DriverError),
}

/// What a runner reports to the pipeline. `generation` identifies the driver
/// instance so events from a replaced driver can be discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverEvent {
    pub sensor_id: i64,
    pub generation: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: DriverEventKind,
}

/// Builds driver instances for sensor definitions.
pub trait DriverFactory: Send + Sync {
    fn create(&self, sensor_id: i64, definition: &SensorDefinition) -> Result<Box<dyn Driver>, GatewayError>;
}

#[derive(Debug, Default, Clone)]
pub struct DefaultDriverFactory;

impl DriverFactory for DefaultDriverFactory {
    fn create(&self, sensor_id: i64, definition: &SensorDefinition) -> Result<Box<dyn Driver>, GatewayError> {
        let io_timeout = Duration::from_millis(definition.timeout_ms);
        let driver: Box<dyn Driver> = match &definition.connection {
            ConnectionParams::ModbusTcp { .. } | ConnectionParams::ModbusRtu { .. } => {
                Box::new(modbus::ModbusDriver::new(definition.connection.clone(), io_timeout)?)
            }
            ConnectionParams::Can { interface, arbitration_id, dbc_file, message_name, signal_name } => {
                Box::new(can::CanDriver::new(
                    can::CanSignalConfig {
                        arbitration_id: *arbitration_id,
                        dbc_file: dbc_file.into(),
                        message_name: message_name.clone(),
                        signal_name: signal_name.clone(),
                    },
                    can::socket_source(interface),
                ))
            }
            ConnectionParams::Mqtt { .. } => Box::new(mqtt::MqttDriver::new(sensor_id, definition.connection.clone())?),
            ConnectionParams::VirtualOutput { initial_value } => {
                Box::new(virtual_output::VirtualOutputDriver::new(*initial_value))
            }
            ConnectionParams::System { .. } => Box::new(system::SystemDriver::new(definition.connection.clone())?),
        };
        Ok(driver)
    }
}
