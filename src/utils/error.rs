use thiserror::Error;

/// Failures raised by a protocol driver while talking to its source.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Operation not supported: {0}")]
    Unsupported(String),
}

impl DriverError {
    /// Connection-level failures put the sensor OFFLINE and trigger a reconnect,
    /// everything else marks it ERROR and keeps the link.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, DriverError::Connection(_) | DriverError::Timeout)
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => DriverError::Timeout,
            _ => DriverError::Connection(format!("IO error: {}", err)),
        }
    }
}

impl From<tokio::time::error::Elapsed> for DriverError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        DriverError::Timeout
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    #[error("Formula cannot be empty")]
    Empty,

    #[error("Formula exceeds {0} characters")]
    TooLong(usize),

    #[error("Syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("Forbidden construct: {0}")]
    Disallowed(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Function {name} expects {expected} argument(s), got {got}")]
    Arity { name: String, expected: String, got: usize },

    #[error("Expression nesting exceeds depth {0}")]
    TooDeep(usize),

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Math domain error: {0}")]
    Domain(String),

    #[error("Type error: {0}")]
    Type(String),
}

/// Failures talking to the remote time-series sink.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Sink unreachable: {0}")]
    Unreachable(String),

    #[error("Sink rejected write: {0}")]
    Rejected(String),

    #[error("Malformed sink response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_status() {
            SyncError::Rejected(err.to_string())
        } else if err.is_decode() {
            SyncError::Malformed(err.to_string())
        } else {
            SyncError::Unreachable(err.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error(transparent)]
    Formula(#[from] FormulaError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Report error: {0}")]
    Report(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Buffer full: {0}")]
    BufferFull(String),

    #[error("Service not available: {0}")]
    ServiceNotAvailable(String),
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        GatewayError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for GatewayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        GatewayError::Driver(DriverError::Timeout)
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        GatewayError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for GatewayError {
    fn from(err: toml::ser::Error) -> Self {
        GatewayError::Serialization(format!("TOML error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
