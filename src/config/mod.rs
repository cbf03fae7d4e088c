pub mod settings;

pub use settings::{
    AutomationConfig,
    BufferConfig,
    CommandListenerConfig,
    Config,
    DigitalTwinConfig,
    DriverConfig,
    GatewayInfo,
    InfluxConfig,
    LoggingConfig,
    OverflowPolicy,
    PipelineConfig,
    ReportConfig,
    SqliteConfig,
};
