use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

use crate::reports::models::StatType;

/// Summary statistics over a set of samples. `stddev` is the population
/// standard deviation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Statistics {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
}

impl Statistics {
    pub fn compute(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(Self { count, mean, min, max, stddev: variance.sqrt() })
    }

    pub fn get(&self, stat: StatType) -> f64 {
        match stat {
            StatType::Mean => self.mean,
            StatType::Min => self.min,
            StatType::Max => self.max,
            StatType::Stddev => self.stddev,
            StatType::Count => self.count as f64,
        }
    }
}

/// Parses `30s`, `5m`, `1h`, `2d`.
pub fn parse_window(text: &str) -> Option<Duration> {
    if text.len() < 2 || !text.is_ascii() {
        return None;
    }
    let (amount, unit) = text.split_at(text.len() - 1);
    let amount: i64 = amount.parse().ok().filter(|n| *n > 0)?;
    match unit {
        "s" => Some(Duration::seconds(amount)),
        "m" => Some(Duration::minutes(amount)),
        "h" => Some(Duration::hours(amount)),
        "d" => Some(Duration::days(amount)),
        _ => None,
    }
}

/// A `stat_<sensor>_<func>_<window>` variable, e.g. `stat_Temp1_mean_5m`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatReference {
    pub sensor: String,
    pub stat: StatType,
    pub window: Duration,
}

impl StatReference {
    pub fn parse(identifier: &str) -> Option<Self> {
        let body = identifier.strip_prefix("stat_")?;
        let (rest, window) = body.rsplit_once('_')?;
        let (sensor, func) = rest.rsplit_once('_')?;
        if sensor.is_empty() {
            return None;
        }
        Some(Self { sensor: sensor.to_string(), stat: StatType::parse(func)?, window: parse_window(window)? })
    }
}

/// Time-ordered samples of one sensor, trimmed to a retention horizon.
#[derive(Debug, Clone, Default)]
pub struct SampleHistory {
    samples: VecDeque<(DateTime<Utc>, f64)>,
}

impl SampleHistory {
    pub fn push(&mut self, at: DateTime<Utc>, value: f64, retention: Duration) {
        self.samples.push_back((at, value));
        let horizon = at - retention;
        while matches!(self.samples.front(), Some((t, _)) if *t < horizon) {
            self.samples.pop_front();
        }
    }

    pub fn window(&self, now: DateTime<Utc>, window: Duration) -> Vec<f64> {
        let start = now - window;
        self.samples.iter().filter(|(t, _)| *t >= start && *t <= now).map(|(_, v)| *v).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistics() {
        let stats = Statistics::compute(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_eq!(stats.count, 8);
        assert_eq!(stats.mean, 5.0);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 9.0);
        assert_eq!(stats.stddev, 2.0);
        assert_eq!(stats.get(StatType::Count), 8.0);
        assert!(Statistics::compute(&[]).is_none());

        let single = Statistics::compute(&[3.5]).unwrap();
        assert_eq!(single.stddev, 0.0);
    }

    #[test]
    fn test_windows() {
        assert_eq!(parse_window("30s"), Some(Duration::seconds(30)));
        assert_eq!(parse_window("5m"), Some(Duration::minutes(5)));
        assert_eq!(parse_window("2d"), Some(Duration::days(2)));
        assert_eq!(parse_window("0m"), None);
        assert_eq!(parse_window("m"), None);
        assert_eq!(parse_window("5w"), None);
    }

    #[test]
    fn test_stat_reference() {
        let r = StatReference::parse("stat_Temp1_mean_5m").unwrap();
        assert_eq!(r.sensor, "Temp1");
        assert_eq!(r.stat, StatType::Mean);
        assert_eq!(r.window, Duration::minutes(5));

        let r = StatReference::parse("stat_boiler_temp_max_1h").unwrap();
        assert_eq!(r.sensor, "boiler_temp");
        assert_eq!(r.stat, StatType::Max);

        assert!(StatReference::parse("Temp1").is_none());
        assert!(StatReference::parse("stat_Temp1_median_5m").is_none());
        assert!(StatReference::parse("stat_mean_5m").is_none());
    }

    #[test]
    fn test_history_window_and_retention() {
        let t0 = Utc::now();
        let mut history = SampleHistory::default();
        for i in 0..10 {
            history.push(t0 + Duration::seconds(i * 60), i as f64, Duration::minutes(5));
        }
        // retention keeps samples from the last 5 minutes before the newest
        assert_eq!(history.len(), 6);
        let now = t0 + Duration::seconds(9 * 60);
        assert_eq!(history.window(now, Duration::minutes(2)), vec![7.0, 8.0, 9.0]);
    }
}
