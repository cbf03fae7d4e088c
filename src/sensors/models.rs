use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::formula::Formula;
use crate::utils::error::GatewayError;

pub const MIN_POLL_INTERVAL_MS: u64 = 100;
pub const MAX_POLL_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Protocol {
    ModbusTcp,
    ModbusRtu,
    Can,
    Mqtt,
    VirtualOutput,
    System,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::ModbusTcp => "MODBUS_TCP",
            Protocol::ModbusRtu => "MODBUS_RTU",
            Protocol::Can => "CAN",
            Protocol::Mqtt => "MQTT",
            Protocol::VirtualOutput => "VIRTUAL_OUTPUT",
            Protocol::System => "SYSTEM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SensorStatus {
    Unknown,
    Online,
    Offline,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterType {
    Holding,
    Input,
    Coil,
    Discrete,
}

impl RegisterType {
    pub fn is_bit(&self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::Discrete)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, RegisterType::Holding | RegisterType::Coil)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    None,
    Even,
    Odd,
}

fn default_modbus_port() -> u16 {
    502
}
fn default_slave_id() -> u8 {
    1
}
fn default_count() -> u16 {
    1
}
fn default_register_type() -> RegisterType {
    RegisterType::Holding
}
fn default_baud_rate() -> u32 {
    9600
}
fn default_parity() -> Parity {
    Parity::None
}
fn default_stop_bits() -> u8 {
    1
}
fn default_data_bits() -> u8 {
    8
}
fn default_can_interface() -> String {
    "can0".to_string()
}
/// Host metrics exposed by the SYSTEM protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemMetric {
    CpuPercent,
    MemoryPercent,
    DiskUsage,
    Temperature,
}

fn default_disk_path() -> String {
    "/".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

/// Protocol-specific connection parameters, checked when a sensor is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionParams {
    ModbusTcp {
        host: String,
        #[serde(default = "default_modbus_port")]
        port: u16,
        #[serde(default = "default_slave_id")]
        slave_id: u8,
        address: u16,
        #[serde(default = "default_count")]
        count: u16,
        #[serde(default = "default_register_type")]
        register_type: RegisterType,
    },
    ModbusRtu {
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_parity")]
        parity: Parity,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default = "default_slave_id")]
        slave_id: u8,
        address: u16,
        #[serde(default = "default_count")]
        count: u16,
        #[serde(default = "default_register_type")]
        register_type: RegisterType,
    },
    Can {
        #[serde(default = "default_can_interface")]
        interface: String,
        arbitration_id: u32,
        dbc_file: String,
        #[serde(default)]
        message_name: Option<String>,
        signal_name: String,
    },
    Mqtt {
        broker: String,
        #[serde(default = "default_mqtt_port")]
        port: u16,
        topic: String,
        #[serde(default)]
        json_path: Option<String>,
        #[serde(default)]
        qos: u8,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        command_topic: Option<String>,
    },
    VirtualOutput {
        #[serde(default)]
        initial_value: f64,
    },
    System {
        metric: SystemMetric,
        /// Filesystem path for `disk_usage`.
        #[serde(default = "default_disk_path")]
        path: String,
        /// Substring of the component label for `temperature`.
        #[serde(default)]
        sensor_label: Option<String>,
    },
}

impl ConnectionParams {
    pub fn protocol(&self) -> Protocol {
        match self {
            ConnectionParams::ModbusTcp { .. } => Protocol::ModbusTcp,
            ConnectionParams::ModbusRtu { .. } => Protocol::ModbusRtu,
            ConnectionParams::Can { .. } => Protocol::Can,
            ConnectionParams::Mqtt { .. } => Protocol::Mqtt,
            ConnectionParams::VirtualOutput { .. } => Protocol::VirtualOutput,
            ConnectionParams::System { .. } => Protocol::System,
        }
    }

    /// Whether an automation rule or manual command may write to this sensor.
    pub fn is_writable(&self) -> bool {
        match self {
            ConnectionParams::ModbusTcp { register_type, .. }
            | ConnectionParams::ModbusRtu { register_type, .. } => register_type.is_writable(),
            ConnectionParams::Mqtt { .. } | ConnectionParams::VirtualOutput { .. } => true,
            ConnectionParams::Can { .. } | ConnectionParams::System { .. } => false,
        }
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        match self {
            ConnectionParams::ModbusTcp { host, port, slave_id, count, register_type, .. } => {
                require(!host.trim().is_empty(), "modbus host must not be empty")?;
                require(*port != 0, "modbus port must not be 0")?;
                validate_modbus_unit(*slave_id, *count, *register_type)
            }
            ConnectionParams::ModbusRtu {
                port,
                baud_rate,
                stop_bits,
                data_bits,
                slave_id,
                count,
                register_type,
                ..
            } => {
                require(!port.trim().is_empty(), "serial port must not be empty")?;
                require(*baud_rate > 0, "baud_rate must be > 0")?;
                require(matches!(stop_bits, 1 | 2), "stop_bits must be 1 or 2")?;
                require(matches!(data_bits, 7 | 8), "data_bits must be 7 or 8")?;
                validate_modbus_unit(*slave_id, *count, *register_type)
            }
            ConnectionParams::Can { interface, arbitration_id, dbc_file, signal_name, .. } => {
                require(!interface.trim().is_empty(), "CAN interface must not be empty")?;
                require(*arbitration_id <= 0x1FFF_FFFF, "arbitration_id exceeds 29 bits")?;
                require(!dbc_file.trim().is_empty(), "dbc_file must not be empty")?;
                require(!signal_name.trim().is_empty(), "signal_name must not be empty")
            }
            ConnectionParams::Mqtt { broker, port, topic, json_path, qos, command_topic, .. } => {
                require(!broker.trim().is_empty(), "MQTT broker must not be empty")?;
                require(*port != 0, "MQTT port must not be 0")?;
                require(!topic.trim().is_empty(), "MQTT topic must not be empty")?;
                require(*qos <= 2, "qos must be 0, 1 or 2")?;
                if let Some(path) = json_path {
                    require(path.starts_with('$'), "json_path must start with '$'")?;
                }
                if let Some(cmd) = command_topic {
                    require(
                        !cmd.contains('#') && !cmd.contains('+'),
                        "command_topic must not contain wildcards",
                    )?;
                }
                Ok(())
            }
            ConnectionParams::VirtualOutput { initial_value } => {
                require(initial_value.is_finite(), "initial_value must be finite")
            }
            ConnectionParams::System { metric, path, .. } => {
                require(
                    *metric != SystemMetric::DiskUsage || !path.trim().is_empty(),
                    "disk_usage needs a path",
                )
            }
        }
    }
}

fn validate_modbus_unit(slave_id: u8, count: u16, register_type: RegisterType) -> Result<(), GatewayError> {
    require((1..=247).contains(&slave_id), "slave_id must be within 1..=247")?;
    require((1..=2).contains(&count), "count must be 1 or 2")?;
    require(!(register_type.is_bit() && count != 1), "coil/discrete sensors read a single bit")
}

fn require(condition: bool, message: &str) -> Result<(), GatewayError> {
    if condition {
        Ok(())
    } else {
        Err(GatewayError::Validation(message.to_string()))
    }
}

fn default_formula() -> String {
    "val".to_string()
}
fn default_poll_interval() -> u64 {
    1000
}
fn default_timeout() -> u64 {
    5000
}
fn default_enabled() -> bool {
    true
}

/// The operator-editable part of a sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub connection: ConnectionParams,
    #[serde(default = "default_formula")]
    pub formula: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub twin_attribute: Option<String>,
}

impl SensorDefinition {
    pub fn new(name: &str, connection: ConnectionParams) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            connection,
            formula: default_formula(),
            unit: None,
            poll_interval_ms: default_poll_interval(),
            timeout_ms: default_timeout(),
            enabled: true,
            twin_attribute: None,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.connection.protocol()
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        let name = self.name.trim();
        require(!name.is_empty(), "sensor name must not be empty")?;
        require(name.chars().count() <= 100, "sensor name exceeds 100 characters")?;
        require(!name.chars().any(char::is_control), "sensor name must not contain control characters")?;
        require(
            (MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&self.poll_interval_ms),
            "poll_interval_ms must be within 100..=60000",
        )?;
        require(
            (MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&self.timeout_ms),
            "timeout_ms must be within 100..=60000",
        )?;
        let formula = Formula::parse(&self.formula)?;
        formula.check_sensor_formula()?;
        self.connection.validate()
    }

    /// Key used when forwarding readings to the digital twin.
    pub fn twin_key(&self) -> &str {
        self.twin_attribute.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorState {
    pub status: SensorStatus,
    pub last_value: Option<f64>,
    pub last_raw_value: Option<f64>,
    pub last_seen: Option<DateTime<Utc>>,
    pub error_count: u64,
    pub last_error: Option<String>,
}

impl Default for SensorState {
    fn default() -> Self {
        Self {
            status: SensorStatus::Unknown,
            last_value: None,
            last_raw_value: None,
            last_seen: None,
            error_count: 0,
            last_error: None,
        }
    }
}

impl SensorState {
    pub fn mark_online(&mut self, value: f64, raw_value: f64, at: DateTime<Utc>) {
        self.status = SensorStatus::Online;
        self.last_value = Some(value);
        self.last_raw_value = Some(raw_value);
        self.last_seen = Some(at);
        self.error_count = 0;
        self.last_error = None;
    }

    pub fn mark_failure(&mut self, status: SensorStatus, error: String) {
        self.status = status;
        self.error_count = self.error_count.saturating_add(1);
        self.last_error = Some(error);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: i64,
    #[serde(flatten)]
    pub definition: SensorDefinition,
    #[serde(flatten)]
    pub state: SensorState,
}

impl Sensor {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn protocol(&self) -> Protocol {
        self.definition.protocol()
    }
}

/// A transformed measurement on its way through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub sensor_id: i64,
    pub sensor_name: String,
    pub timestamp: DateTime<Utc>,
    pub raw_value: f64,
    pub value: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp() -> ConnectionParams {
        ConnectionParams::ModbusTcp {
            host: "192.168.1.10".into(),
            port: 502,
            slave_id: 1,
            address: 40001,
            count: 1,
            register_type: RegisterType::Holding,
        }
    }

    #[test]
    fn test_connection_params_from_json() {
        let params: ConnectionParams = serde_json::from_str(
            r#"{"protocol": "MODBUS_TCP", "host": "10.0.0.5", "address": 100}"#,
        )
        .unwrap();
        assert_eq!(
            params,
            ConnectionParams::ModbusTcp {
                host: "10.0.0.5".into(),
                port: 502,
                slave_id: 1,
                address: 100,
                count: 1,
                register_type: RegisterType::Holding,
            }
        );

        let mqtt: ConnectionParams = serde_json::from_str(
            r#"{"protocol": "MQTT", "broker": "localhost", "topic": "sensors/temp1", "json_path": "$.value"}"#,
        )
        .unwrap();
        assert_eq!(mqtt.protocol(), Protocol::Mqtt);
        assert!(mqtt.validate().is_ok());
    }

    #[test]
    fn test_system_params_from_json() {
        let params: ConnectionParams =
            serde_json::from_str(r#"{"protocol": "SYSTEM", "metric": "disk_usage"}"#).unwrap();
        assert_eq!(
            params,
            ConnectionParams::System { metric: SystemMetric::DiskUsage, path: "/".into(), sensor_label: None }
        );
        assert_eq!(params.protocol().as_str(), "SYSTEM");
        assert!(params.validate().is_ok());
        assert!(!params.is_writable());

        let empty_path = ConnectionParams::System { metric: SystemMetric::DiskUsage, path: " ".into(), sensor_label: None };
        assert!(empty_path.validate().is_err());
        assert!(serde_json::from_str::<ConnectionParams>(r#"{"protocol": "SYSTEM", "metric": "fan_rpm"}"#).is_err());
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let res: Result<ConnectionParams, _> =
            serde_json::from_str(r#"{"protocol": "PROFINET", "host": "x"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_definition_validation() {
        let mut def = SensorDefinition::new("Temp1", tcp());
        assert!(def.validate().is_ok());

        def.name = "Line\nBreak".into();
        assert!(def.validate().is_err());
        def.name = "Tab\tName".into();
        assert!(def.validate().is_err());
        def.name = "Temp1".into();

        def.poll_interval_ms = 50;
        assert!(def.validate().is_err());
        def.poll_interval_ms = 1000;

        def.formula = "val.__class__".into();
        assert!(def.validate().is_err());
        def.formula = "Other * 2".into();
        assert!(def.validate().is_err());
        def.formula = "val / 10".into();

        def.connection = ConnectionParams::ModbusTcp {
            host: String::new(),
            port: 502,
            slave_id: 1,
            address: 0,
            count: 1,
            register_type: RegisterType::Holding,
        };
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_write_capability() {
        assert!(tcp().is_writable());
        let input = ConnectionParams::ModbusTcp {
            host: "h".into(),
            port: 502,
            slave_id: 1,
            address: 0,
            count: 1,
            register_type: RegisterType::Input,
        };
        assert!(!input.is_writable());
        assert!(ConnectionParams::VirtualOutput { initial_value: 0.0 }.is_writable());
        let can = ConnectionParams::Can {
            interface: "can0".into(),
            arbitration_id: 0x123,
            dbc_file: "motor.dbc".into(),
            message_name: None,
            signal_name: "RPM".into(),
        };
        assert!(!can.is_writable());
    }

    #[test]
    fn test_state_transitions() {
        let mut state = SensorState::default();
        state.mark_failure(SensorStatus::Offline, "refused".into());
        state.mark_failure(SensorStatus::Error, "bad crc".into());
        assert_eq!(state.error_count, 2);
        assert_eq!(state.status, SensorStatus::Error);

        state.mark_online(24.5, 245.0, Utc::now());
        assert_eq!(state.status, SensorStatus::Online);
        assert_eq!(state.error_count, 0);
        assert_eq!(state.last_error, None);
        assert_eq!(state.last_value, Some(24.5));
    }
}
