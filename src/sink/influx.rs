use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info};
use std::time::Duration;

use super::{Sample, TimeSeriesSink};
use crate::config::settings::InfluxConfig;
use crate::storage::models::BufferedRecord;
use crate::utils::error::SyncError;

/// InfluxDB v2 HTTP API. Points are keyed by measurement, `sensor_id` tag
/// and millisecond timestamp, so a re-sent record overwrites itself.
pub struct InfluxSink {
    client: reqwest::Client,
    config: InfluxConfig,
}

impl InfluxSink {
    pub fn new(config: InfluxConfig) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()
            .map_err(|e| SyncError::Unreachable(format!("HTTP client: {}", e)))?;
        info!("📈 InfluxDB sink {} (bucket {})", config.url, config.bucket);
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v2/{}", self.config.url.trim_end_matches('/'), path)
    }

    fn auth(&self) -> String {
        format!("Token {}", self.config.token)
    }
}

/// Line protocol cannot carry control characters, so they are dropped.
fn escape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars().filter(|c| !c.is_control()) {
        if matches!(c, ',' | '=' | ' ' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Only 400 and 422 mean the points themselves were refused; auth, quota
/// and server errors leave the data retryable.
fn write_failure(status: u16, body: &str) -> SyncError {
    match status {
        400 | 422 => SyncError::Rejected(format!("HTTP {}: {}", status, body)),
        _ => SyncError::Unreachable(format!("HTTP {}: {}", status, body)),
    }
}

pub fn to_line_protocol(measurement: &str, record: &BufferedRecord) -> String {
    format!(
        "{},sensor_id={},sensor_name={} value={},raw_value={} {}",
        escape_tag(measurement),
        record.sensor_id,
        escape_tag(&record.sensor_name),
        record.value,
        record.raw_value,
        record.timestamp.timestamp_millis()
    )
}

fn flux_query(config: &InfluxConfig, sensor_ids: &[i64], start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let sensors = sensor_ids
        .iter()
        .map(|id| format!("r.sensor_id == \"{}\"", id))
        .collect::<Vec<_>>()
        .join(" or ");
    format!(
        r#"from(bucket: "{bucket}")
  |> range(start: {start}, stop: {stop})
  |> filter(fn: (r) => r._measurement == "{measurement}" and r._field == "value")
  |> filter(fn: (r) => {sensors})
  |> keep(columns: ["_time", "_value", "sensor_id"])"#,
        bucket = config.bucket,
        start = start.to_rfc3339_opts(SecondsFormat::Millis, true),
        // range stop is exclusive
        stop = (end + chrono::Duration::milliseconds(1)).to_rfc3339_opts(SecondsFormat::Millis, true),
        measurement = config.measurement,
        sensors = sensors,
    )
}

/// Parses the CSV body of a Flux query. Tables are separated by blank lines
/// and each starts with its own header row.
pub fn parse_flux_csv(body: &str) -> Result<Vec<Sample>, SyncError> {
    let mut samples = Vec::new();
    let mut columns: Option<(usize, usize, usize)> = None;

    for line in body.lines().map(|l| l.trim_end_matches('\r')) {
        if line.trim().is_empty() {
            columns = None;
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        let Some((time_idx, value_idx, sensor_idx)) = columns else {
            let find = |name: &str| {
                fields
                    .iter()
                    .position(|f| *f == name)
                    .ok_or_else(|| SyncError::Malformed(format!("missing column {}", name)))
            };
            columns = Some((find("_time")?, find("_value")?, find("sensor_id")?));
            continue;
        };

        let field = |idx: usize| {
            fields
                .get(idx)
                .copied()
                .ok_or_else(|| SyncError::Malformed(format!("short row: {}", line)))
        };
        let timestamp = DateTime::parse_from_rfc3339(field(time_idx)?)
            .map_err(|e| SyncError::Malformed(format!("bad _time: {}", e)))?
            .with_timezone(&Utc);
        let value: f64 = field(value_idx)?
            .parse()
            .map_err(|_| SyncError::Malformed(format!("bad _value in row: {}", line)))?;
        let sensor_id: i64 = field(sensor_idx)?
            .parse()
            .map_err(|_| SyncError::Malformed(format!("bad sensor_id in row: {}", line)))?;
        samples.push(Sample { sensor_id, timestamp, value });
    }
    Ok(samples)
}

#[async_trait]
impl TimeSeriesSink for InfluxSink {
    async fn write(&self, records: &[BufferedRecord]) -> Result<(), SyncError> {
        if records.is_empty() {
            return Ok(());
        }
        let body = records
            .iter()
            .map(|r| to_line_protocol(&self.config.measurement, r))
            .collect::<Vec<_>>()
            .join("\n");

        let response = self
            .client
            .post(self.endpoint("write"))
            .query(&[("org", self.config.org.as_str()), ("bucket", self.config.bucket.as_str()), ("precision", "ms")])
            .header("Authorization", self.auth())
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(write_failure(status.as_u16(), &text));
        }
        debug!("📈 Wrote {} points to InfluxDB", records.len());
        Ok(())
    }

    async fn query(
        &self,
        sensor_ids: &[i64],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>, SyncError> {
        if sensor_ids.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .client
            .post(self.endpoint("query"))
            .query(&[("org", self.config.org.as_str())])
            .header("Authorization", self.auth())
            .header("Content-Type", "application/vnd.flux")
            .header("Accept", "application/csv")
            .body(flux_query(&self.config, sensor_ids, start, end))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(SyncError::Rejected(format!("HTTP {}: {}", status, text)));
        }
        parse_flux_csv(&response.text().await?)
    }

    fn name(&self) -> &str {
        "influxdb"
    }
}
