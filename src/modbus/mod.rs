pub mod client;
pub mod crc;
pub mod protocol;

pub use client::{ModbusTransport, RtuSettings, RtuTransport, TcpTransport};
pub use crc::crc16_modbus;
pub use protocol::{ModbusRequest, ModbusResponse};
