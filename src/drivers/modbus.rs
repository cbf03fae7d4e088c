use async_trait::async_trait;
use log::info;
use std::time::Duration;

use super::{Driver, DriverMode};
use crate::modbus::protocol::{extract_value, ModbusRequest, ModbusResponse};
use crate::modbus::{ModbusTransport, RtuSettings, RtuTransport, TcpTransport};
use crate::sensors::models::{ConnectionParams, RegisterType};
use crate::utils::error::{DriverError, GatewayError};

/// Polls one register (or register pair) over Modbus TCP or RTU.
pub struct ModbusDriver {
    params: ConnectionParams,
    slave_id: u8,
    address: u16,
    count: u16,
    register_type: RegisterType,
    io_timeout: Duration,
    transport: Option<Box<dyn ModbusTransport>>,
}

impl ModbusDriver {
    pub fn new(params: ConnectionParams, io_timeout: Duration) -> Result<Self, GatewayError> {
        let (slave_id, address, count, register_type) = match &params {
            ConnectionParams::ModbusTcp { slave_id, address, count, register_type, .. }
            | ConnectionParams::ModbusRtu { slave_id, address, count, register_type, .. } => {
                (*slave_id, *address, *count, *register_type)
            }
            other => {
                return Err(GatewayError::Validation(format!(
                    "{} parameters given to Modbus driver",
                    other.protocol().as_str()
                )))
            }
        };
        Ok(Self { params, slave_id, address, count, register_type, io_timeout, transport: None })
    }

    fn transport(&mut self) -> Result<&mut Box<dyn ModbusTransport>, DriverError> {
        self.transport
            .as_mut()
            .ok_or_else(|| DriverError::Connection("not connected".to_string()))
    }
}

#[async_trait]
impl Driver for ModbusDriver {
    fn mode(&self) -> DriverMode {
        DriverMode::Polled
    }

    async fn connect(&mut self) -> Result<(), DriverError> {
        if self.transport.is_some() {
            return Ok(());
        }
        let transport: Box<dyn ModbusTransport> = match &self.params {
            ConnectionParams::ModbusTcp { host, port, .. } => {
                Box::new(TcpTransport::connect(host, *port, self.io_timeout).await?)
            }
            ConnectionParams::ModbusRtu { port, baud_rate, parity, stop_bits, data_bits, .. } => {
                let settings = RtuSettings {
                    port: port.clone(),
                    baud_rate: *baud_rate,
                    parity: *parity,
                    stop_bits: *stop_bits,
                    data_bits: *data_bits,
                    timeout: self.io_timeout,
                };
                Box::new(tokio::task::spawn_blocking(move || RtuTransport::open(&settings))
                    .await
                    .map_err(|e| DriverError::Connection(format!("serial open task failed: {}", e)))??)
            }
            _ => return Err(DriverError::Unsupported("not a Modbus sensor".to_string())),
        };
        self.transport = Some(transport);
        Ok(())
    }

    async fn read(&mut self) -> Result<f64, DriverError> {
        let request = ModbusRequest::read(self.register_type, self.address, self.count);
        let slave_id = self.slave_id;
        let response = self.transport()?.transact(slave_id, &request).await?;
        extract_value(&response)
    }

    async fn write(&mut self, value: f64) -> Result<(), DriverError> {
        let request = ModbusRequest::write(self.register_type, self.address, value).ok_or_else(|| {
            DriverError::Unsupported(format!("{:?} registers are read-only", self.register_type))
        })?;
        let slave_id = self.slave_id;
        match self.transport()?.transact(slave_id, &request).await? {
            ModbusResponse::WriteAck => {
                info!("✍️  Wrote {} to unit {} address {}", value, slave_id, self.address);
                Ok(())
            }
            other => Err(DriverError::Protocol(format!("unexpected write response {:?}", other))),
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
    }
}
