use async_trait::async_trait;
use log::info;
use tokio::sync::mpsc;

use super::{Driver, DriverMode};
use crate::utils::error::DriverError;

/// A software output with no device behind it. Writes are stored and
/// reported back as readings, so a virtual actuator shows the last
/// commanded value like any other sensor.
pub struct VirtualOutputDriver {
    initial_value: f64,
    tx: mpsc::UnboundedSender<f64>,
    rx: mpsc::UnboundedReceiver<f64>,
}

impl VirtualOutputDriver {
    pub fn new(initial_value: f64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { initial_value, tx, rx }
    }
}

#[async_trait]
impl Driver for VirtualOutputDriver {
    fn mode(&self) -> DriverMode {
        DriverMode::EventDriven
    }

    async fn connect(&mut self) -> Result<(), DriverError> {
        self.tx
            .send(self.initial_value)
            .map_err(|_| DriverError::Connection("virtual output closed".to_string()))
    }

    async fn read(&mut self) -> Result<f64, DriverError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| DriverError::Connection("virtual output closed".to_string()))
    }

    async fn write(&mut self, value: f64) -> Result<(), DriverError> {
        if !value.is_finite() {
            return Err(DriverError::Protocol(format!("cannot store non-finite value {}", value)));
        }
        self.initial_value = value;
        self.tx
            .send(value)
            .map_err(|_| DriverError::Connection("virtual output closed".to_string()))?;
        info!("🎛️  Virtual output set to {}", value);
        Ok(())
    }

    async fn disconnect(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reports_initial_then_written_values() {
        let mut driver = VirtualOutputDriver::new(0.0);
        driver.connect().await.unwrap();
        assert_eq!(driver.read().await.unwrap(), 0.0);

        driver.write(1.0).await.unwrap();
        assert_eq!(driver.read().await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn test_reconnect_replays_last_written_value() {
        let mut driver = VirtualOutputDriver::new(5.0);
        driver.connect().await.unwrap();
        assert_eq!(driver.read().await.unwrap(), 5.0);
        driver.write(7.5).await.unwrap();
        assert_eq!(driver.read().await.unwrap(), 7.5);

        driver.disconnect().await;
        driver.connect().await.unwrap();
        assert_eq!(driver.read().await.unwrap(), 7.5);
    }

    #[tokio::test]
    async fn test_rejects_nan() {
        let mut driver = VirtualOutputDriver::new(0.0);
        assert!(matches!(driver.write(f64::NAN).await, Err(DriverError::Protocol(_))));
    }
}
