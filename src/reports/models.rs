use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatType {
    Mean,
    Min,
    Max,
    Stddev,
    Count,
}

impl StatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatType::Mean => "mean",
            StatType::Min => "min",
            StatType::Max => "max",
            StatType::Stddev => "stddev",
            StatType::Count => "count",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "mean" | "avg" => Some(StatType::Mean),
            "min" => Some(StatType::Min),
            "max" => Some(StatType::Max),
            "stddev" | "std" => Some(StatType::Stddev),
            "count" => Some(StatType::Count),
            _ => None,
        }
    }
}

fn default_stat_types() -> Vec<StatType> {
    vec![StatType::Mean, StatType::Min, StatType::Max]
}
fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportJobDefinition {
    pub name: String,
    pub interval_minutes: u32,
    pub sensor_ids: Vec<i64>,
    #[serde(default = "default_stat_types")]
    pub stat_types: Vec<StatType>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ReportJobDefinition {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::Validation("report name must not be empty".into()));
        }
        if self.interval_minutes == 0 {
            return Err(GatewayError::Validation("interval_minutes must be >= 1".into()));
        }
        if self.sensor_ids.is_empty() {
            return Err(GatewayError::Validation("report needs at least one sensor".into()));
        }
        if self.stat_types.is_empty() {
            return Err(GatewayError::Validation("report needs at least one statistic".into()));
        }
        Ok(())
    }

    /// Sensor ids and statistics without duplicates, first occurrence kept.
    pub fn normalize(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.sensor_ids.retain(|id| seen.insert(*id));
        let mut seen = std::collections::HashSet::new();
        self.stat_types.retain(|s| seen.insert(*s));
    }

    pub fn interval(&self) -> Duration {
        Duration::minutes(i64::from(self.interval_minutes))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportJob {
    pub id: i64,
    #[serde(flatten)]
    pub definition: ReportJobDefinition,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ReportJob {
    /// Start of the aggregation window for a run at `next_run_at`.
    pub fn window_start(&self) -> DateTime<Utc> {
        self.last_run_at.unwrap_or(self.next_run_at - self.definition.interval())
    }

    /// Records an execution and advances the schedule by exactly one interval.
    pub fn complete_run(&mut self, ran_at: DateTime<Utc>, error: Option<String>) {
        self.last_run_at = Some(ran_at);
        self.next_run_at += self.definition.interval();
        self.last_error = error;
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.definition.enabled && now >= self.next_run_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job() -> ReportJob {
        ReportJob {
            id: 1,
            definition: ReportJobDefinition {
                name: "hourly".into(),
                interval_minutes: 60,
                sensor_ids: vec![1, 2, 1],
                stat_types: vec![StatType::Mean, StatType::Max, StatType::Mean],
                enabled: true,
            },
            next_run_at: Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap(),
            last_run_at: None,
            last_error: None,
        }
    }

    #[test]
    fn test_schedule_advances_from_previous_slot() {
        let mut job = job();
        let start = job.next_run_at;
        assert_eq!(job.window_start(), start - Duration::hours(1));

        // ran 7 minutes late and failed
        let ran_at = start + Duration::minutes(7);
        job.complete_run(ran_at, Some("sink down".into()));
        assert_eq!(job.next_run_at, start + Duration::hours(1));
        assert_eq!(job.last_run_at, Some(ran_at));
        assert_eq!(job.last_error.as_deref(), Some("sink down"));
        assert_eq!(job.window_start(), ran_at);

        job.complete_run(start + Duration::hours(1), None);
        assert_eq!(job.next_run_at, start + Duration::hours(2));
        assert_eq!(job.last_error, None);
    }

    #[test]
    fn test_normalize_and_validate() {
        let mut job = job();
        job.definition.normalize();
        assert_eq!(job.definition.sensor_ids, vec![1, 2]);
        assert_eq!(job.definition.stat_types, vec![StatType::Mean, StatType::Max]);
        assert!(job.definition.validate().is_ok());

        job.definition.interval_minutes = 0;
        assert!(job.definition.validate().is_err());
    }

    #[test]
    fn test_stat_type_names() {
        let def: ReportJobDefinition =
            serde_json::from_str(r#"{"name": "r", "interval_minutes": 5, "sensor_ids": [3]}"#).unwrap();
        assert_eq!(def.stat_types, vec![StatType::Mean, StatType::Min, StatType::Max]);
        assert_eq!(StatType::parse("std"), Some(StatType::Stddev));
        assert_eq!(StatType::parse("median"), None);
    }
}
