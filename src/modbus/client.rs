use async_trait::async_trait;
use log::{debug, error, info};
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::protocol::{
    decode_mbap_header, decode_response_pdu, decode_rtu_frame, encode_rtu_frame, encode_tcp_frame, ModbusRequest,
    ModbusResponse, MBAP_HEADER_LEN,
};
use crate::sensors::models::Parity;
use crate::utils::error::DriverError;

/// One request/response exchange with a Modbus unit, whatever the link.
#[async_trait]
pub trait ModbusTransport: Send + Sync {
    async fn transact(&mut self, unit_id: u8, request: &ModbusRequest) -> Result<ModbusResponse, DriverError>;

    async fn close(&mut self);
}

pub struct TcpTransport {
    stream: Option<TcpStream>,
    transaction_id: u16,
    timeout: Duration,
}

impl TcpTransport {
    pub async fn connect(host: &str, port: u16, io_timeout: Duration) -> Result<Self, DriverError> {
        info!("🔌 Connecting to Modbus TCP {}:{}", host, port);
        let stream = timeout(io_timeout, TcpStream::connect((host, port)))
            .await?
            .map_err(|e| {
                error!("❌ Failed to connect to {}:{}: {}", host, port, e);
                DriverError::Connection(format!("{}:{}: {}", host, port, e))
            })?;
        stream.set_nodelay(true).ok();
        Ok(Self { stream: Some(stream), transaction_id: 0, timeout: io_timeout })
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn transact(&mut self, unit_id: u8, request: &ModbusRequest) -> Result<ModbusResponse, DriverError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| DriverError::Connection("not connected".to_string()))?;

        self.transaction_id = self.transaction_id.wrapping_add(1);
        let tid = self.transaction_id;
        let frame = encode_tcp_frame(tid, unit_id, request);

        let exchange = async {
            stream.write_all(&frame).await?;

            let mut header = [0u8; MBAP_HEADER_LEN];
            stream.read_exact(&mut header).await?;
            let mbap = decode_mbap_header(&header)?;

            let mut pdu = vec![0u8; mbap.length as usize - 1];
            stream.read_exact(&mut pdu).await?;

            if mbap.transaction_id != tid {
                return Err(DriverError::Protocol(format!(
                    "transaction id mismatch: got {}, expected {}",
                    mbap.transaction_id, tid
                )));
            }
            if mbap.unit_id != unit_id {
                return Err(DriverError::Protocol(format!("response from unit {}, expected {}", mbap.unit_id, unit_id)));
            }
            debug!("📊 unit {} fc 0x{:02X} -> {} byte PDU", unit_id, request.function_code(), pdu.len());
            decode_response_pdu(request, &pdu)
        };

        let result = timeout(self.timeout, exchange).await?;
        if let Err(e) = &result {
            // A half-read stream cannot be resynchronised
            if e.is_connection_level() {
                self.stream = None;
            }
        }
        result
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await.ok();
        }
    }
}

pub struct RtuSettings {
    pub port: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub stop_bits: u8,
    pub data_bits: u8,
    pub timeout: Duration,
}

pub struct RtuTransport {
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

impl RtuTransport {
    pub fn open(settings: &RtuSettings) -> Result<Self, DriverError> {
        info!("🔌 Connecting to Modbus RTU port: {}", settings.port);
        info!(
            "⚙️  Configuration: {} baud, {} data bits, {} stop bit(s), parity {:?}",
            settings.baud_rate, settings.data_bits, settings.stop_bits, settings.parity
        );

        let parity = match settings.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        };
        let data_bits = match settings.data_bits {
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        };
        let stop_bits = match settings.stop_bits {
            2 => serialport::StopBits::Two,
            _ => serialport::StopBits::One,
        };

        let port = serialport::new(&settings.port, settings.baud_rate)
            .timeout(settings.timeout)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .open()
            .map_err(|e| {
                error!("❌ Failed to open serial port {}: {}", settings.port, e);
                DriverError::Connection(format!("Failed to open port {}: {}", settings.port, e))
            })?;

        info!("✅ Modbus RTU port {} open", settings.port);
        Ok(Self { port: Arc::new(Mutex::new(port)) })
    }

    fn exchange_blocking(
        port: &Mutex<Box<dyn SerialPort>>,
        slave_id: u8,
        request: &ModbusRequest,
    ) -> Result<ModbusResponse, DriverError> {
        let mut port = port
            .lock()
            .map_err(|_| DriverError::Connection("serial port lock poisoned".to_string()))?;

        port.clear(serialport::ClearBuffer::Input).ok();
        let frame = encode_rtu_frame(slave_id, request);
        debug!("📤 TX {}", hex::encode_upper(&frame));
        port.write_all(&frame)?;
        port.flush()?;

        // address + function code decide how much is left to read
        let mut response = vec![0u8; 2];
        port.read_exact(&mut response)?;
        let remaining = if response[1] & 0x80 != 0 {
            3
        } else {
            request.response_pdu_len() - 1 + 2
        };
        let mut rest = vec![0u8; remaining];
        port.read_exact(&mut rest)?;
        response.extend_from_slice(&rest);
        debug!("📥 RX {}", hex::encode_upper(&response));

        decode_rtu_frame(slave_id, request, &response)
    }
}

#[async_trait]
impl ModbusTransport for RtuTransport {
    async fn transact(&mut self, unit_id: u8, request: &ModbusRequest) -> Result<ModbusResponse, DriverError> {
        let port = Arc::clone(&self.port);
        let request = request.clone();
        tokio::task::spawn_blocking(move || Self::exchange_blocking(&port, unit_id, &request))
            .await
            .map_err(|e| DriverError::Connection(format!("serial worker failed: {}", e)))?
    }

    async fn close(&mut self) {
        debug!("🔌 Releasing serial port");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal Modbus TCP server answering every read with `value`.
    pub(crate) async fn spawn_mock_server(value: u16) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut header = [0u8; MBAP_HEADER_LEN];
                    while socket.read_exact(&mut header).await.is_ok() {
                        let len = u16::from_be_bytes([header[4], header[5]]) as usize;
                        let mut pdu = vec![0u8; len - 1];
                        if socket.read_exact(&mut pdu).await.is_err() {
                            return;
                        }
                        let reply_pdu: Vec<u8> = match pdu[0] {
                            0x03 | 0x04 => {
                                let qty = u16::from_be_bytes([pdu[3], pdu[4]]);
                                let mut out = vec![pdu[0], (qty * 2) as u8];
                                for _ in 0..qty {
                                    out.extend_from_slice(&value.to_be_bytes());
                                }
                                out
                            }
                            0x05 | 0x06 => pdu.clone(),
                            fc => vec![fc | 0x80, 0x01],
                        };
                        let mut reply = Vec::new();
                        reply.extend_from_slice(&header[0..4]);
                        reply.extend_from_slice(&(reply_pdu.len() as u16 + 1).to_be_bytes());
                        reply.push(header[6]);
                        reply.extend_from_slice(&reply_pdu);
                        if socket.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_tcp_read_holding_register() {
        let addr = spawn_mock_server(245).await;
        let mut transport = TcpTransport::connect("127.0.0.1", addr.port(), Duration::from_secs(2))
            .await
            .unwrap();
        let resp = transport
            .transact(1, &ModbusRequest::ReadHoldingRegisters { start: 0, quantity: 1 })
            .await
            .unwrap();
        assert_eq!(resp, ModbusResponse::Registers(vec![245]));
    }

    #[tokio::test]
    async fn test_tcp_exception_reply() {
        let addr = spawn_mock_server(0).await;
        let mut transport = TcpTransport::connect("127.0.0.1", addr.port(), Duration::from_secs(2))
            .await
            .unwrap();
        let err = transport
            .transact(1, &ModbusRequest::ReadCoils { start: 0, quantity: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_tcp_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = TcpTransport::connect("127.0.0.1", port, Duration::from_secs(2)).await.err().unwrap();
        assert!(err.is_connection_level());
    }
}
