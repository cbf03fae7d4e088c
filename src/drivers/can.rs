use async_trait::async_trait;
use log::{debug, info};
use std::path::PathBuf;

use super::dbc::{DbcDatabase, DbcSignal};
use super::{Driver, DriverMode};
use crate::utils::error::DriverError;

#[derive(Debug, Clone, PartialEq)]
pub struct CanFrame {
    pub id: u32,
    /// 29 bit identifier format.
    pub extended: bool,
    pub data: Vec<u8>,
}

impl CanFrame {
    pub fn standard(id: u32, data: Vec<u8>) -> Self {
        Self { id, extended: false, data }
    }

    pub fn extended(id: u32, data: Vec<u8>) -> Self {
        Self { id, extended: true, data }
    }
}

/// Where frames come from. `recv` must be cancel-safe.
#[async_trait]
pub trait FrameSource: Send {
    async fn open(&mut self) -> Result<(), DriverError>;

    async fn recv(&mut self) -> Result<CanFrame, DriverError>;

    async fn close(&mut self);
}

#[derive(Debug, Clone)]
pub struct CanSignalConfig {
    pub arbitration_id: u32,
    pub dbc_file: PathBuf,
    pub message_name: Option<String>,
    pub signal_name: String,
}

/// Decodes one DBC signal from frames carrying the configured arbitration ID.
/// Standard and extended frames with the same numeric ID are distinct; the
/// DBC message decides which format is expected.
pub struct CanDriver {
    config: CanSignalConfig,
    source: Box<dyn FrameSource>,
    signal: Option<DbcSignal>,
    extended: bool,
}

impl CanDriver {
    pub fn new(config: CanSignalConfig, source: Box<dyn FrameSource>) -> Self {
        Self { config, source, signal: None, extended: false }
    }
}

#[async_trait]
impl Driver for CanDriver {
    fn mode(&self) -> DriverMode {
        DriverMode::EventDriven
    }

    async fn connect(&mut self) -> Result<(), DriverError> {
        let db = DbcDatabase::load(&self.config.dbc_file).await?;
        let signal = db
            .find_signal(
                self.config.arbitration_id,
                self.config.message_name.as_deref(),
                &self.config.signal_name,
            )?
            .clone();
        self.extended = db.message(self.config.arbitration_id).map_or(false, |m| m.extended);
        info!(
            "🚌 CAN signal '{}' bound to {} id 0x{:X} ({} bits @ {})",
            signal.name,
            if self.extended { "extended" } else { "standard" },
            self.config.arbitration_id,
            signal.length,
            signal.start_bit
        );
        self.signal = Some(signal);
        self.source.open().await
    }

    async fn read(&mut self) -> Result<f64, DriverError> {
        let signal = self
            .signal
            .as_ref()
            .ok_or_else(|| DriverError::Connection("not connected".to_string()))?;
        loop {
            let frame = self.source.recv().await?;
            if frame.id != self.config.arbitration_id || frame.extended != self.extended {
                continue;
            }
            debug!("CAN 0x{:X} [{}]", frame.id, hex::encode_upper(&frame.data));
            return signal.decode(&frame.data);
        }
    }

    async fn disconnect(&mut self) {
        self.source.close().await;
    }
}

#[cfg(target_os = "linux")]
mod socket {
    use super::*;
    use socketcan::{CanSocket, EmbeddedFrame, Frame, Socket};
    use std::time::Duration;

    pub struct SocketCanSource {
        interface: String,
        socket: Option<CanSocket>,
    }

    impl SocketCanSource {
        pub fn new(interface: &str) -> Self {
            Self { interface: interface.to_string(), socket: None }
        }
    }

    #[async_trait]
    impl FrameSource for SocketCanSource {
        async fn open(&mut self) -> Result<(), DriverError> {
            let socket = CanSocket::open(&self.interface)
                .map_err(|e| DriverError::Connection(format!("cannot open {}: {}", self.interface, e)))?;
            socket
                .set_nonblocking(true)
                .map_err(|e| DriverError::Connection(format!("failed to set non-blocking mode: {}", e)))?;
            info!("🚌 Listening on CAN interface {}", self.interface);
            self.socket = Some(socket);
            Ok(())
        }

        async fn recv(&mut self) -> Result<CanFrame, DriverError> {
            let mut tick = tokio::time::interval(Duration::from_millis(5));
            loop {
                let received = match self.socket.as_ref() {
                    Some(socket) => socket.read_frame(),
                    None => return Err(DriverError::Connection("CAN socket closed".to_string())),
                };
                match received {
                    Ok(frame) => {
                        return Ok(CanFrame {
                            id: frame.raw_id() & 0x1FFF_FFFF,
                            extended: frame.is_extended(),
                            data: frame.data().to_vec(),
                        });
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        tick.tick().await;
                    }
                    Err(e) => return Err(DriverError::Connection(format!("CAN read failed: {}", e))),
                }
            }
        }

        async fn close(&mut self) {
            self.socket = None;
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod socket {
    use super::*;

    pub struct SocketCanSource {
        interface: String,
    }

    impl SocketCanSource {
        pub fn new(interface: &str) -> Self {
            Self { interface: interface.to_string() }
        }
    }

    #[async_trait]
    impl FrameSource for SocketCanSource {
        async fn open(&mut self) -> Result<(), DriverError> {
            Err(DriverError::Unsupported(format!("SocketCAN ({}) requires Linux", self.interface)))
        }

        async fn recv(&mut self) -> Result<CanFrame, DriverError> {
            Err(DriverError::Connection("CAN socket closed".to_string()))
        }

        async fn close(&mut self) {}
    }
}

pub fn socket_source(interface: &str) -> Box<dyn FrameSource> {
    Box::new(socket::SocketCanSource::new(interface))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::dbc::tests::SAMPLE_DBC;
    use tokio::sync::mpsc;

    struct ChannelSource {
        rx: mpsc::Receiver<CanFrame>,
    }

    #[async_trait]
    impl FrameSource for ChannelSource {
        async fn open(&mut self) -> Result<(), DriverError> {
            Ok(())
        }

        async fn recv(&mut self) -> Result<CanFrame, DriverError> {
            self.rx
                .recv()
                .await
                .ok_or_else(|| DriverError::Connection("bus closed".to_string()))
        }

        async fn close(&mut self) {}
    }

    fn write_dbc() -> PathBuf {
        let path = std::env::temp_dir().join(format!("gw-{}.dbc", uuid::Uuid::new_v4()));
        std::fs::write(&path, SAMPLE_DBC).unwrap();
        path
    }

    #[tokio::test]
    async fn test_decodes_matching_frames_and_skips_others() {
        let path = write_dbc();
        let (tx, rx) = mpsc::channel(8);
        let mut driver = CanDriver::new(
            CanSignalConfig {
                arbitration_id: 291,
                dbc_file: path.clone(),
                message_name: Some("EngineData".into()),
                signal_name: "CoolantTemp".into(),
            },
            Box::new(ChannelSource { rx }),
        );
        driver.connect().await.unwrap();

        tx.send(CanFrame::standard(0x100, vec![0xFF; 8])).await.unwrap();
        tx.send(CanFrame::extended(291, vec![0, 0, 200, 0, 0, 0, 0, 0])).await.unwrap();
        tx.send(CanFrame::standard(291, vec![0, 0, 100, 0, 0, 0, 0, 0])).await.unwrap();
        assert_eq!(driver.read().await.unwrap(), 60.0);

        drop(tx);
        assert!(driver.read().await.unwrap_err().is_connection_level());
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_extended_message_ignores_standard_frames() {
        let path = write_dbc();
        let (tx, rx) = mpsc::channel(8);
        let mut driver = CanDriver::new(
            CanSignalConfig {
                arbitration_id: 0x201,
                dbc_file: path.clone(),
                message_name: Some("BatteryStatus".into()),
                signal_name: "PackVoltage".into(),
            },
            Box::new(ChannelSource { rx }),
        );
        driver.connect().await.unwrap();

        tx.send(CanFrame::standard(0x201, vec![0xFF; 8])).await.unwrap();
        tx.send(CanFrame::extended(0x201, vec![0x9C, 0x40, 0, 0, 0, 0, 0, 0])).await.unwrap();
        assert!((driver.read().await.unwrap() - 400.0).abs() < 1e-9);
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_missing_signal_fails_connect() {
        let path = write_dbc();
        let (_tx, rx) = mpsc::channel(1);
        let mut driver = CanDriver::new(
            CanSignalConfig {
                arbitration_id: 291,
                dbc_file: path.clone(),
                message_name: None,
                signal_name: "Nope".into(),
            },
            Box::new(ChannelSource { rx }),
        );
        assert!(matches!(driver.connect().await, Err(DriverError::Protocol(_))));
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_can_driver_is_read_only() {
        let (_tx, rx) = mpsc::channel(1);
        let mut driver = CanDriver::new(
            CanSignalConfig {
                arbitration_id: 1,
                dbc_file: PathBuf::from("/nonexistent.dbc"),
                message_name: None,
                signal_name: "x".into(),
            },
            Box::new(ChannelSource { rx }),
        );
        assert!(matches!(driver.write(1.0).await, Err(DriverError::Unsupported(_))));
    }
}
