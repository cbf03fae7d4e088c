pub mod error;

pub use error::{DriverError, FormulaError, GatewayError, SyncError};
