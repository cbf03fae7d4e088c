use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::automation::stats::Statistics;
use crate::reports::csv::{render, report_file_name, ReportRow};
use crate::reports::models::ReportJob;
use crate::sensors::SensorRegistry;
use crate::sink::TimeSeriesSink;
use crate::storage::ConfigStore;
use crate::utils::error::GatewayError;

struct JobTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Runs every enabled report job on its own task.
pub struct ReportScheduler {
    sink: Arc<dyn TimeSeriesSink>,
    registry: Arc<SensorRegistry>,
    store: Arc<dyn ConfigStore>,
    output_dir: PathBuf,
    tasks: Mutex<HashMap<i64, JobTask>>,
}

impl ReportScheduler {
    pub fn new(
        sink: Arc<dyn TimeSeriesSink>,
        registry: Arc<SensorRegistry>,
        store: Arc<dyn ConfigStore>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self { sink, registry, store, output_dir: output_dir.into(), tasks: Mutex::new(HashMap::new()) }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Queries the sink over the job window and writes the CSV file.
    pub async fn generate(&self, job: &ReportJob, now: DateTime<Utc>) -> Result<PathBuf, GatewayError> {
        let window_start = job.window_start();
        let samples = self
            .sink
            .query(&job.definition.sensor_ids, window_start, now)
            .await
            .map_err(|e| GatewayError::Report(format!("query failed: {}", e)))?;

        let mut values: HashMap<i64, Vec<f64>> = HashMap::new();
        for sample in samples {
            values.entry(sample.sensor_id).or_default().push(sample.value);
        }

        let mut rows = Vec::with_capacity(job.definition.sensor_ids.len());
        for sensor_id in &job.definition.sensor_ids {
            let sensor = self.registry.get(*sensor_id).await;
            rows.push(ReportRow {
                sensor_id: *sensor_id,
                sensor_name: sensor.as_ref().map(|s| s.definition.name.clone()).unwrap_or_default(),
                unit: sensor.and_then(|s| s.definition.unit),
                stats: values.get(sensor_id).and_then(|v| Statistics::compute(v)),
            });
        }

        let csv = render(now, window_start, now, &job.definition.stat_types, &rows);
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| GatewayError::Report(format!("cannot create {}: {}", self.output_dir.display(), e)))?;
        let path = self.output_dir.join(report_file_name(&job.definition.name, now));
        tokio::fs::write(&path, csv)
            .await
            .map_err(|e| GatewayError::Report(format!("cannot write {}: {}", path.display(), e)))?;
        Ok(path)
    }

    /// One execution: generate, advance the schedule, persist. Never fails;
    /// the outcome lands in `last_error`.
    pub async fn run_once(&self, mut job: ReportJob, now: DateTime<Utc>) -> ReportJob {
        let error = match self.generate(&job, now).await {
            Ok(path) => {
                info!("📄 Report '{}' written to {}", job.definition.name, path.display());
                None
            }
            Err(e) => {
                warn!("⚠️  Report '{}' failed: {}", job.definition.name, e);
                Some(e.to_string())
            }
        };
        job.complete_run(now, error);
        if let Err(e) = self.store.update_report_job(&job).await {
            warn!("⚠️  Could not persist report job {}: {}", job.id, e);
        }
        job
    }

    /// Starts (or restarts) the task of `job`. Disabled jobs are only stopped.
    pub async fn schedule(self: &Arc<Self>, job: ReportJob) {
        self.unschedule(job.id).await;
        if !job.definition.enabled {
            return;
        }
        let (stop, stop_rx) = watch::channel(false);
        let id = job.id;
        let handle = tokio::spawn(Arc::clone(self).job_loop(job, stop_rx));
        self.tasks.lock().await.insert(id, JobTask { stop, handle });
    }

    pub async fn unschedule(&self, id: i64) {
        let task = self.tasks.lock().await.remove(&id);
        if let Some(task) = task {
            let _ = task.stop.send(true);
            let _ = task.handle.await;
        }
    }

    pub async fn stop_all(&self) {
        let tasks: Vec<JobTask> = self.tasks.lock().await.drain().map(|(_, t)| t).collect();
        for task in &tasks {
            let _ = task.stop.send(true);
        }
        for task in tasks {
            let _ = task.handle.await;
        }
    }

    pub async fn scheduled_jobs(&self) -> usize {
        self.tasks.lock().await.len()
    }

    async fn job_loop(self: Arc<Self>, mut job: ReportJob, mut stop: watch::Receiver<bool>) {
        skip_missed_runs(&mut job, Utc::now());
        debug!("Report job {} scheduled, next run {}", job.id, job.next_run_at);
        loop {
            let wait = (job.next_run_at - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                res = stop.changed() => if res.is_err() { break },
            }
            if *stop.borrow() {
                break;
            }
            job = self.run_once(job, Utc::now()).await;
        }
        debug!("Report job {} stopped", job.id);
    }
}

/// After downtime, slots older than one interval are skipped so a restart
/// produces a single catch-up report. The schedule stays on its grid.
fn skip_missed_runs(job: &mut ReportJob, now: DateTime<Utc>) {
    let interval = job.definition.interval();
    while job.next_run_at + interval <= now {
        job.next_run_at += interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::DriverConfig;
    use crate::drivers::DefaultDriverFactory;
    use crate::reports::models::{ReportJobDefinition, StatType};
    use crate::sensors::models::{ConnectionParams, SensorDefinition};
    use crate::sink::{MemorySink, Sample};
    use crate::storage::{SqliteConfigStore, SqliteManager};
    use chrono::{Duration, TimeZone};
    use tokio::sync::mpsc;

    struct Fixture {
        scheduler: Arc<ReportScheduler>,
        sink: Arc<MemorySink>,
        store: Arc<SqliteConfigStore>,
        dir: PathBuf,
    }

    async fn fixture() -> Fixture {
        let manager = SqliteManager::in_memory().await.unwrap();
        let store = Arc::new(SqliteConfigStore::new(manager.pool().clone()));
        let (tx, _rx) = mpsc::channel(8);
        let registry = Arc::new(SensorRegistry::new(Arc::new(DefaultDriverFactory), DriverConfig::default(), tx));
        let mut def = SensorDefinition::new("Temp1", ConnectionParams::VirtualOutput { initial_value: 0.0 });
        def.unit = Some("C".into());
        def.enabled = false;
        registry.add(1, def).await.unwrap();

        let sink = Arc::new(MemorySink::new());
        let dir = std::env::temp_dir().join(format!("gw-reports-{}", uuid::Uuid::new_v4()));
        let scheduler = Arc::new(ReportScheduler::new(sink.clone(), registry, store.clone(), dir.clone()));
        Fixture { scheduler, sink, store, dir }
    }

    async fn job(store: &SqliteConfigStore, next_run_at: DateTime<Utc>) -> ReportJob {
        let definition = ReportJobDefinition {
            name: "hourly".into(),
            interval_minutes: 60,
            sensor_ids: vec![1],
            stat_types: vec![StatType::Mean, StatType::Count],
            enabled: true,
        };
        store.insert_report_job(&definition, next_run_at).await.unwrap();
        store.list_report_jobs().await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn test_run_writes_csv_and_advances_schedule() {
        let f = fixture().await;
        let scheduled = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();
        let now = scheduled + Duration::seconds(2);
        for (i, v) in [10.0, 20.0, 30.0].into_iter().enumerate() {
            f.sink.insert(Sample { sensor_id: 1, timestamp: now - Duration::minutes(10 + i as i64), value: v });
        }
        // outside the window
        f.sink.insert(Sample { sensor_id: 1, timestamp: now - Duration::hours(3), value: 999.0 });

        let job = job(&f.store, scheduled).await;
        let job = f.scheduler.run_once(job, now).await;

        assert_eq!(job.last_error, None);
        assert_eq!(job.last_run_at, Some(now));
        assert_eq!(job.next_run_at, scheduled + Duration::hours(1));
        assert_eq!(f.store.list_report_jobs().await.unwrap()[0].next_run_at, job.next_run_at);

        let path = f.dir.join("report_hourly_20260501_100002.csv");
        let csv = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "timestamp,sensor_id,sensor_name,unit,window_start,window_end,mean,count");
        assert!(lines[1].contains(",1,Temp1,C,"));
        assert!(lines[1].ends_with(",20,3"));
        let _ = std::fs::remove_dir_all(&f.dir);
    }

    #[tokio::test]
    async fn test_failure_records_error_and_still_advances() {
        let f = fixture().await;
        f.sink.set_available(false);
        let scheduled = Utc::now() - Duration::minutes(1);
        let job = job(&f.store, scheduled).await;

        let job = f.scheduler.run_once(job, Utc::now()).await;
        assert!(job.last_error.as_deref().unwrap_or_default().contains("query failed"));
        let grid = |n: i64| (scheduled + Duration::hours(n)).timestamp_millis();
        assert_eq!(job.next_run_at.timestamp_millis(), grid(1));

        f.sink.set_available(true);
        let job = f.scheduler.run_once(job, Utc::now()).await;
        assert_eq!(job.last_error, None);
        assert_eq!(job.next_run_at.timestamp_millis(), grid(2));
        let _ = std::fs::remove_dir_all(&f.dir);
    }

    #[tokio::test]
    async fn test_due_job_runs_on_its_task() {
        let f = fixture().await;
        let scheduled = Utc::now() - Duration::seconds(1);
        let job = job(&f.store, scheduled).await;

        f.scheduler.schedule(job).await;
        assert_eq!(f.scheduler.scheduled_jobs().await, 1);
        for _ in 0..100 {
            if f.store.list_report_jobs().await.unwrap()[0].last_run_at.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let stored = f.store.list_report_jobs().await.unwrap().remove(0);
        assert!(stored.last_run_at.is_some());
        assert_eq!(stored.next_run_at.timestamp_millis(), (scheduled + Duration::hours(1)).timestamp_millis());

        f.scheduler.stop_all().await;
        assert_eq!(f.scheduler.scheduled_jobs().await, 0);
        let _ = std::fs::remove_dir_all(&f.dir);
    }

    #[test]
    fn test_skip_missed_runs_keeps_grid() {
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 12, 30, 0).unwrap();
        let mut job = ReportJob {
            id: 1,
            definition: ReportJobDefinition {
                name: "j".into(),
                interval_minutes: 60,
                sensor_ids: vec![1],
                stat_types: vec![StatType::Mean],
                enabled: true,
            },
            next_run_at: Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap(),
            last_run_at: None,
            last_error: None,
        };
        skip_missed_runs(&mut job, now);
        assert_eq!(job.next_run_at, Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap());
    }
}
