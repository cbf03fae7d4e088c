pub mod models;
pub mod registry;

pub use models::{ConnectionParams, Protocol, Reading, Sensor, SensorDefinition, SensorStatus};
pub use registry::SensorRegistry;
