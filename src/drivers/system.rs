use async_trait::async_trait;
use log::debug;
use std::path::Path;
use sysinfo::{Components, Disks, System};

use super::{Driver, DriverMode};
use crate::sensors::models::{ConnectionParams, SystemMetric};
use crate::utils::error::{DriverError, GatewayError};

/// Component groups tried, in order, when no label is configured.
const CPU_SENSOR_NAMES: [&str; 4] = ["coretemp", "cpu_thermal", "k10temp", "acpitz"];

/// Reads host metrics of the gateway itself. CPU load is measured between
/// two reads, so the first value after connecting is 0.
pub struct SystemDriver {
    metric: SystemMetric,
    path: String,
    sensor_label: Option<String>,
    system: System,
    disks: Option<Disks>,
    components: Option<Components>,
}

impl SystemDriver {
    pub fn new(params: ConnectionParams) -> Result<Self, GatewayError> {
        match params {
            ConnectionParams::System { metric, path, sensor_label } => Ok(Self {
                metric,
                path,
                sensor_label,
                system: System::new(),
                disks: None,
                components: None,
            }),
            other => Err(GatewayError::Validation(format!(
                "{} parameters given to system driver",
                other.protocol().as_str()
            ))),
        }
    }

    fn read_disk(&mut self) -> Result<f64, DriverError> {
        let disks = self.disks.get_or_insert_with(Disks::new_with_refreshed_list);
        disks.refresh();
        let mounts: Vec<(&Path, u64, u64)> = disks
            .list()
            .iter()
            .map(|d| (d.mount_point(), d.total_space(), d.available_space()))
            .collect();
        disk_usage_percent(&mounts, Path::new(&self.path))
    }

    fn read_temperature(&mut self) -> Result<f64, DriverError> {
        let components = self.components.get_or_insert_with(Components::new_with_refreshed_list);
        components.refresh();
        let readings: Vec<(String, f64)> = components
            .list()
            .iter()
            .map(|c| (c.label().to_string(), f64::from(c.temperature())))
            .collect();
        pick_temperature(&readings, self.sensor_label.as_deref())
    }
}

/// Usage of the filesystem holding `path`: the mount with the longest
/// matching prefix wins.
pub fn disk_usage_percent(mounts: &[(&Path, u64, u64)], path: &Path) -> Result<f64, DriverError> {
    let (mount, total, available) = mounts
        .iter()
        .filter(|(mount, _, _)| path.starts_with(mount))
        .max_by_key(|(mount, _, _)| mount.as_os_str().len())
        .ok_or_else(|| DriverError::Protocol(format!("no filesystem mounted for {}", path.display())))?;
    if *total == 0 {
        return Err(DriverError::Protocol(format!("filesystem {} reports no size", mount.display())));
    }
    let used = total.saturating_sub(*available);
    Ok(used as f64 / *total as f64 * 100.0)
}

/// Picks a temperature from `(label, celsius)` pairs. A configured label
/// must match; otherwise a known CPU sensor is preferred over the first one.
pub fn pick_temperature(readings: &[(String, f64)], label: Option<&str>) -> Result<f64, DriverError> {
    let valid: Vec<&(String, f64)> = readings.iter().filter(|(_, t)| t.is_finite()).collect();
    if let Some(label) = label {
        return valid
            .iter()
            .find(|(name, _)| name.contains(label))
            .map(|(_, t)| *t)
            .ok_or_else(|| DriverError::Protocol(format!("temperature sensor '{}' not found", label)));
    }
    CPU_SENSOR_NAMES
        .iter()
        .find_map(|cpu| valid.iter().find(|(name, _)| name.to_lowercase().contains(cpu)))
        .or_else(|| valid.first())
        .map(|(_, t)| *t)
        .ok_or_else(|| DriverError::Unsupported("no temperature sensors found".to_string()))
}

#[async_trait]
impl Driver for SystemDriver {
    fn mode(&self) -> DriverMode {
        DriverMode::Polled
    }

    async fn connect(&mut self) -> Result<(), DriverError> {
        // primes the CPU counters for the first delta
        self.system.refresh_cpu();
        Ok(())
    }

    async fn read(&mut self) -> Result<f64, DriverError> {
        let value = match self.metric {
            SystemMetric::CpuPercent => {
                self.system.refresh_cpu();
                f64::from(self.system.global_cpu_info().cpu_usage())
            }
            SystemMetric::MemoryPercent => {
                self.system.refresh_memory();
                let total = self.system.total_memory();
                if total == 0 {
                    return Err(DriverError::Unsupported("memory size unavailable".to_string()));
                }
                self.system.used_memory() as f64 / total as f64 * 100.0
            }
            SystemMetric::DiskUsage => self.read_disk()?,
            SystemMetric::Temperature => self.read_temperature()?,
        };
        debug!("System metric {:?} = {:.2}", self.metric, value);
        Ok(value)
    }

    async fn disconnect(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(items: &[(&str, f64)]) -> Vec<(String, f64)> {
        items.iter().map(|(l, t)| (l.to_string(), *t)).collect()
    }

    #[test]
    fn test_disk_usage_uses_longest_mount() {
        let mounts = [(Path::new("/"), 100, 75), (Path::new("/data"), 200, 50)];
        assert_eq!(disk_usage_percent(&mounts, Path::new("/data/logs")).unwrap(), 75.0);
        assert_eq!(disk_usage_percent(&mounts, Path::new("/var")).unwrap(), 25.0);
        assert!(disk_usage_percent(&mounts[1..], Path::new("/var")).is_err());
        assert!(disk_usage_percent(&[(Path::new("/"), 0, 0)], Path::new("/")).is_err());
    }

    #[test]
    fn test_temperature_selection() {
        let readings = labels(&[("nvme Composite", 38.0), ("coretemp Package id 0", 52.0), ("acpitz temp1", 40.0)]);
        assert_eq!(pick_temperature(&readings, None).unwrap(), 52.0);
        assert_eq!(pick_temperature(&readings, Some("nvme")).unwrap(), 38.0);
        assert!(pick_temperature(&readings, Some("gpu")).is_err());

        let other = labels(&[("bad", f64::NAN), ("board", 30.0)]);
        assert_eq!(pick_temperature(&other, None).unwrap(), 30.0);
        assert!(matches!(pick_temperature(&[], None), Err(DriverError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_memory_and_cpu_are_percentages() {
        for metric in [SystemMetric::MemoryPercent, SystemMetric::CpuPercent] {
            let mut driver =
                SystemDriver::new(ConnectionParams::System { metric, path: "/".into(), sensor_label: None }).unwrap();
            assert_eq!(driver.mode(), DriverMode::Polled);
            driver.connect().await.unwrap();
            let value = driver.read().await.unwrap();
            assert!((0.0..=100.0).contains(&value), "{:?} = {}", metric, value);
            assert!(matches!(driver.write(1.0).await, Err(DriverError::Unsupported(_))));
        }
    }

    #[test]
    fn test_rejects_foreign_params() {
        assert!(SystemDriver::new(ConnectionParams::VirtualOutput { initial_value: 0.0 }).is_err());
    }
}
