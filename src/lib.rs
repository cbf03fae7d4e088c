//! Industrial Edge Gateway Library
//!
//! Acquires readings from Modbus TCP/RTU, CAN and MQTT devices, transforms
//! them with sandboxed formulas, buffers them in SQLite until the
//! time-series sink accepts them, and runs local automation rules and
//! scheduled CSV reports.

pub mod automation;
pub mod cli;
pub mod config;
pub mod drivers;
pub mod formula;
pub mod modbus;
pub mod reports;
pub mod sensors;
pub mod services;
pub mod sink;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use sensors::{ConnectionParams, Reading, Sensor, SensorDefinition, SensorRegistry};
pub use services::Gateway;
pub use utils::error::{DriverError, FormulaError, GatewayError, SyncError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
