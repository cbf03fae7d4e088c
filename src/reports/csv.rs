use chrono::{DateTime, SecondsFormat, Utc};

use crate::automation::stats::Statistics;
use crate::reports::models::StatType;

/// One line of a report: a sensor and its statistics over the window.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub sensor_id: i64,
    pub sensor_name: String,
    pub unit: Option<String>,
    pub stats: Option<Statistics>,
}

/// `report_<job>_<YYYYmmdd_HHMMSS>.csv`, with anything outside
/// `[A-Za-z0-9_-]` in the job name replaced by `_`.
pub fn report_file_name(job_name: &str, at: DateTime<Utc>) -> String {
    let safe: String = job_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("report_{}_{}.csv", safe, at.format("%Y%m%d_%H%M%S"))
}

fn field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn stat_cell(stats: Option<&Statistics>, stat: StatType) -> String {
    match (stats, stat) {
        (None, StatType::Count) => "0".to_string(),
        (None, _) => String::new(),
        (Some(s), StatType::Count) => s.count.to_string(),
        (Some(s), other) => round4(s.get(other)).to_string(),
    }
}

pub fn header(stat_types: &[StatType]) -> String {
    let mut header = String::from("timestamp,sensor_id,sensor_name,unit,window_start,window_end");
    for stat in stat_types {
        header.push(',');
        header.push_str(stat.as_str());
    }
    header.push('\n');
    header
}

/// Renders the full CSV document. Sensors without samples keep their row
/// with a zero count and empty statistics.
pub fn render(
    generated_at: DateTime<Utc>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    stat_types: &[StatType],
    rows: &[ReportRow],
) -> String {
    let ts = |t: DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Millis, true);
    let mut csv = header(stat_types);
    for row in rows {
        csv.push_str(&format!(
            "{},{},{},{},{},{}",
            ts(generated_at),
            row.sensor_id,
            field(&row.sensor_name),
            field(row.unit.as_deref().unwrap_or("")),
            ts(window_start),
            ts(window_end)
        ));
        for stat in stat_types {
            csv.push(',');
            csv.push_str(&stat_cell(row.stats.as_ref(), *stat));
        }
        csv.push('\n');
    }
    csv
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_file_name() {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(report_file_name("boiler hourly", at), "report_boiler_hourly_20260304_050607.csv");
    }

    #[test]
    fn test_render_rounds_and_orders_columns() {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap();
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let rows = vec![
            ReportRow {
                sensor_id: 1,
                sensor_name: "Temp, inlet".into(),
                unit: Some("°C".into()),
                stats: Statistics::compute(&[1.0, 2.0, 2.0]),
            },
            ReportRow { sensor_id: 2, sensor_name: "Idle".into(), unit: None, stats: None },
        ];
        let csv = render(at, start, at, &[StatType::Max, StatType::Mean, StatType::Count], &rows);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "timestamp,sensor_id,sensor_name,unit,window_start,window_end,max,mean,count");
        assert_eq!(
            lines[1],
            "2026-01-01T01:00:00.000Z,1,\"Temp, inlet\",°C,2026-01-01T00:00:00.000Z,2026-01-01T01:00:00.000Z,2,1.6667,3"
        );
        assert!(lines[2].ends_with(",Idle,,2026-01-01T00:00:00.000Z,2026-01-01T01:00:00.000Z,,,0"));
    }
}
