use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify, RwLock};

use crate::automation::models::AutomationRule;
use crate::automation::stats::{SampleHistory, StatReference, Statistics};
use crate::formula::Formula;
use crate::sensors::models::Reading;
use crate::sensors::SensorRegistry;
use crate::storage::ConfigStore;
use crate::storage::models::millis_to_datetime;
use crate::utils::error::GatewayError;

const NEVER: i64 = i64::MIN;

/// Destination of rule actions.
#[async_trait]
pub trait ActuatorWriter: Send + Sync {
    async fn write(&self, sensor_id: i64, value: f64) -> Result<(), GatewayError>;
}

#[async_trait]
impl ActuatorWriter for SensorRegistry {
    async fn write(&self, sensor_id: i64, value: f64) -> Result<(), GatewayError> {
        SensorRegistry::write(self, sensor_id, value).await
    }
}

struct RuleState {
    rule: AutomationRule,
    formula: Formula,
    last_triggered_ms: AtomicI64,
    in_flight: AtomicBool,
}

impl RuleState {
    fn new(rule: AutomationRule) -> Result<Self, GatewayError> {
        let formula = Formula::parse(&rule.definition.condition)?;
        let last = rule.last_triggered.map(|t| t.timestamp_millis()).unwrap_or(NEVER);
        Ok(Self { rule, formula, last_triggered_ms: AtomicI64::new(last), in_flight: AtomicBool::new(false) })
    }

    fn snapshot(&self) -> AutomationRule {
        let mut rule = self.rule.clone();
        let last = self.last_triggered_ms.load(Ordering::SeqCst);
        rule.last_triggered = (last != NEVER).then(|| millis_to_datetime(last));
        rule
    }

    /// Compare-and-swap on `last_triggered`. Returns the previous value when
    /// the cooldown has elapsed and this caller won the claim.
    fn claim(&self, now_ms: i64) -> Option<i64> {
        let cooldown_ms = (self.rule.definition.cooldown_s as i64).saturating_mul(1000);
        loop {
            let last = self.last_triggered_ms.load(Ordering::SeqCst);
            if last != NEVER && now_ms.saturating_sub(last) < cooldown_ms {
                return None;
            }
            if self
                .last_triggered_ms
                .compare_exchange(last, now_ms, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some(last);
            }
        }
    }

    fn release(&self, claimed_ms: i64, previous: i64) {
        let _ = self
            .last_triggered_ms
            .compare_exchange(claimed_ms, previous, Ordering::SeqCst, Ordering::SeqCst);
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Observations {
    latest: HashMap<String, f64>,
    history: HashMap<String, SampleHistory>,
}

/// Evaluates rule conditions against the latest sensor values and rolling
/// statistics, and writes `target_value` when a condition holds and the
/// rule's cooldown has elapsed.
pub struct AutomationEngine {
    rules: RwLock<HashMap<i64, Arc<RuleState>>>,
    observations: Mutex<Observations>,
    writer: Arc<dyn ActuatorWriter>,
    store: Option<Arc<dyn ConfigStore>>,
    retention: ChronoDuration,
    notify: Notify,
}

impl AutomationEngine {
    pub fn new(
        writer: Arc<dyn ActuatorWriter>,
        store: Option<Arc<dyn ConfigStore>>,
        history_retention: ChronoDuration,
    ) -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            observations: Mutex::new(Observations::default()),
            writer,
            store,
            retention: history_retention,
            notify: Notify::new(),
        }
    }

    /// Records a reading and wakes the evaluation task. Never blocks on rule work.
    pub fn observe(&self, reading: &Reading) {
        {
            let mut obs = self.observations.lock().unwrap_or_else(|e| e.into_inner());
            obs.latest.insert(reading.sensor_name.clone(), reading.value);
            obs.history
                .entry(reading.sensor_name.clone())
                .or_default()
                .push(reading.timestamp, reading.value, self.retention);
        }
        self.notify.notify_one();
    }

    /// Drops the latest value of a sensor that stopped being ONLINE, so
    /// conditions naming it fail until a fresh reading arrives. Sample
    /// history stays for statistic windows.
    pub fn sensor_unavailable(&self, name: &str) {
        let mut obs = self.observations.lock().unwrap_or_else(|e| e.into_inner());
        obs.latest.remove(name);
    }

    pub fn forget_sensor(&self, name: &str) {
        let mut obs = self.observations.lock().unwrap_or_else(|e| e.into_inner());
        obs.latest.remove(name);
        obs.history.remove(name);
    }

    /// Parses a condition and checks that every statistic window fits in the
    /// retained sample history.
    pub fn check_condition(&self, condition: &str) -> Result<(), GatewayError> {
        self.check_windows(&Formula::parse(condition)?)
    }

    fn check_windows(&self, formula: &Formula) -> Result<(), GatewayError> {
        for ident in formula.identifiers() {
            let Some(reference) = StatReference::parse(&ident) else { continue };
            if reference.window > self.retention {
                return Err(GatewayError::Validation(format!(
                    "'{}' spans {}s but only {}s of history are kept (automation.history_retention_minutes)",
                    ident,
                    reference.window.num_seconds(),
                    self.retention.num_seconds()
                )));
            }
        }
        Ok(())
    }

    /// Inserts or replaces a rule. A replaced rule keeps its trigger time.
    pub async fn upsert_rule(&self, mut rule: AutomationRule) -> Result<(), GatewayError> {
        let mut rules = self.rules.write().await;
        if let Some(existing) = rules.get(&rule.id) {
            rule.last_triggered = existing.snapshot().last_triggered.or(rule.last_triggered);
        }
        let state = RuleState::new(rule)?;
        self.check_windows(&state.formula)?;
        rules.insert(state.rule.id, Arc::new(state));
        Ok(())
    }

    pub async fn remove_rule(&self, id: i64) -> bool {
        self.rules.write().await.remove(&id).is_some()
    }

    pub async fn rules(&self) -> Vec<AutomationRule> {
        let mut rules: Vec<AutomationRule> = self.rules.read().await.values().map(|r| r.snapshot()).collect();
        rules.sort_by_key(|r| r.id);
        rules
    }

    pub async fn rule(&self, id: i64) -> Option<AutomationRule> {
        self.rules.read().await.get(&id).map(|r| r.snapshot())
    }

    pub async fn rules_targeting(&self, sensor_id: i64) -> Vec<i64> {
        self.rules
            .read()
            .await
            .values()
            .filter(|r| r.rule.definition.target_sensor_id == sensor_id)
            .map(|r| r.rule.id)
            .collect()
    }

    fn bindings(&self, now: DateTime<Utc>, rules: &[Arc<RuleState>]) -> HashMap<String, f64> {
        let obs = self.observations.lock().unwrap_or_else(|e| e.into_inner());
        let mut bindings = obs.latest.clone();
        for rule in rules {
            for ident in rule.formula.identifiers() {
                if bindings.contains_key(&ident) {
                    continue;
                }
                let Some(reference) = StatReference::parse(&ident) else { continue };
                let samples = obs
                    .history
                    .get(&reference.sensor)
                    .map(|h| h.window(now, reference.window))
                    .unwrap_or_default();
                if let Some(stats) = Statistics::compute(&samples) {
                    bindings.insert(ident, stats.get(reference.stat));
                }
            }
        }
        bindings
    }

    /// Evaluates every enabled rule once, concurrently. Returns the number of
    /// actuator writes issued.
    pub async fn evaluate_rules_at(&self, now: DateTime<Utc>) -> usize {
        let rules: Vec<Arc<RuleState>> = self
            .rules
            .read()
            .await
            .values()
            .filter(|r| r.rule.definition.enabled)
            .cloned()
            .collect();
        if rules.is_empty() {
            return 0;
        }
        let bindings = self.bindings(now, &rules);
        let fired = join_all(rules.iter().map(|r| self.evaluate_rule(r, &bindings, now))).await;
        fired.into_iter().filter(|f| *f).count()
    }

    async fn evaluate_rule(&self, state: &RuleState, bindings: &HashMap<String, f64>, now: DateTime<Utc>) -> bool {
        if state.in_flight.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _in_flight = InFlight(&state.in_flight);
        let rule = &state.rule;

        let holds = match state.formula.evaluate(bindings) {
            Ok(value) => value.is_truthy(),
            Err(e) => {
                debug!("Rule {} '{}' skipped: {}", rule.id, rule.definition.name, e);
                return false;
            }
        };
        if !holds {
            return false;
        }

        let now_ms = now.timestamp_millis();
        let Some(previous) = state.claim(now_ms) else {
            return false;
        };

        let target = rule.definition.target_sensor_id;
        let value = rule.definition.target_value;
        match self.writer.write(target, value).await {
            Ok(()) => {
                info!("⚡ Rule '{}' fired: sensor {} <- {}", rule.definition.name, target, value);
                if let Some(store) = &self.store {
                    if let Err(e) = store.set_rule_triggered(rule.id, now).await {
                        warn!("⚠️  Could not persist trigger time of rule {}: {}", rule.id, e);
                    }
                }
                true
            }
            Err(e) => {
                state.release(now_ms, previous);
                warn!("⚠️  Rule '{}' write to sensor {} failed: {}", rule.definition.name, target, e);
                false
            }
        }
    }

    /// Evaluates on every observed reading and on a fixed tick until shutdown.
    pub async fn run(self: Arc<Self>, tick: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("🤖 Automation engine started");
        loop {
            tokio::select! {
                res = shutdown.changed() => if res.is_err() { break },
                _ = ticker.tick() => {}
                _ = self.notify.notified() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            self.evaluate_rules_at(Utc::now()).await;
        }
        info!("🤖 Automation engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::models::RuleDefinition;

    #[derive(Default)]
    struct RecordingWriter {
        writes: Mutex<Vec<(i64, f64)>>,
        fail: AtomicBool,
        delay_ms: u64,
    }

    #[async_trait]
    impl ActuatorWriter for RecordingWriter {
        async fn write(&self, sensor_id: i64, value: f64) -> Result<(), GatewayError> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(GatewayError::ServiceNotAvailable("device offline".into()));
            }
            self.writes.lock().unwrap().push((sensor_id, value));
            Ok(())
        }
    }

    fn rule(id: i64, condition: &str, cooldown_s: u64) -> AutomationRule {
        AutomationRule {
            id,
            definition: RuleDefinition {
                name: format!("rule-{}", id),
                condition: condition.into(),
                target_sensor_id: 2,
                target_value: 1.0,
                cooldown_s,
                enabled: true,
            },
            last_triggered: None,
        }
    }

    fn reading(name: &str, value: f64, at: DateTime<Utc>) -> Reading {
        Reading { sensor_id: 1, sensor_name: name.into(), timestamp: at, raw_value: value, value }
    }

    fn engine(writer: Arc<RecordingWriter>) -> AutomationEngine {
        AutomationEngine::new(writer, None, ChronoDuration::minutes(60))
    }

    #[tokio::test]
    async fn test_cooldown_gates_writes() {
        let writer = Arc::new(RecordingWriter::default());
        let engine = engine(writer.clone());
        engine.upsert_rule(rule(1, "Temp1 > 50", 5)).await.unwrap();

        let t0 = Utc::now();
        engine.observe(&reading("Temp1", 60.0, t0));
        assert_eq!(engine.evaluate_rules_at(t0).await, 1);
        assert_eq!(engine.evaluate_rules_at(t0 + ChronoDuration::seconds(3)).await, 0);
        assert_eq!(engine.evaluate_rules_at(t0 + ChronoDuration::seconds(6)).await, 1);

        assert_eq!(*writer.writes.lock().unwrap(), vec![(2, 1.0), (2, 1.0)]);
        let snapshot = engine.rule(1).await.unwrap();
        assert_eq!(
            snapshot.last_triggered.map(|t| t.timestamp_millis()),
            Some((t0 + ChronoDuration::seconds(6)).timestamp_millis())
        );
    }

    #[tokio::test]
    async fn test_false_condition_does_not_fire() {
        let writer = Arc::new(RecordingWriter::default());
        let engine = engine(writer.clone());
        engine.upsert_rule(rule(1, "Temp1 > 50", 0)).await.unwrap();
        engine.observe(&reading("Temp1", 20.0, Utc::now()));
        assert_eq!(engine.evaluate_rules_at(Utc::now()).await, 0);
        assert!(writer.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_releases_cooldown() {
        let writer = Arc::new(RecordingWriter::default());
        writer.fail.store(true, Ordering::SeqCst);
        let engine = engine(writer.clone());
        engine.upsert_rule(rule(1, "Temp1 > 50", 60)).await.unwrap();

        let t0 = Utc::now();
        engine.observe(&reading("Temp1", 70.0, t0));
        assert_eq!(engine.evaluate_rules_at(t0).await, 0);
        assert_eq!(engine.rule(1).await.unwrap().last_triggered, None);

        writer.fail.store(false, Ordering::SeqCst);
        assert_eq!(engine.evaluate_rules_at(t0 + ChronoDuration::seconds(1)).await, 1);
    }

    #[tokio::test]
    async fn test_bad_rule_does_not_block_others() {
        let writer = Arc::new(RecordingWriter::default());
        let engine = engine(writer.clone());
        engine.upsert_rule(rule(1, "Missing > 1", 0)).await.unwrap();
        engine.upsert_rule(rule(2, "Temp1 / 0 > 1", 0)).await.unwrap();
        engine.upsert_rule(rule(3, "Temp1 > 50", 0)).await.unwrap();

        engine.observe(&reading("Temp1", 80.0, Utc::now()));
        assert_eq!(engine.evaluate_rules_at(Utc::now()).await, 1);
    }

    #[tokio::test]
    async fn test_unavailable_sensor_stops_binding() {
        let writer = Arc::new(RecordingWriter::default());
        let engine = engine(writer.clone());
        engine.upsert_rule(rule(1, "Temp1 > 50", 0)).await.unwrap();
        engine.upsert_rule(rule(2, "stat_Temp1_max_5m > 50", 0)).await.unwrap();

        let t0 = Utc::now();
        engine.observe(&reading("Temp1", 80.0, t0));
        engine.sensor_unavailable("Temp1");
        // only the statistic rule still sees the sample
        assert_eq!(engine.evaluate_rules_at(t0).await, 1);

        engine.observe(&reading("Temp1", 80.0, t0 + ChronoDuration::seconds(1)));
        assert_eq!(engine.evaluate_rules_at(t0 + ChronoDuration::seconds(1)).await, 2);
    }

    #[tokio::test]
    async fn test_statistic_variables() {
        let writer = Arc::new(RecordingWriter::default());
        let engine = engine(writer.clone());
        engine.upsert_rule(rule(1, "stat_Temp1_mean_5m > 50 and stat_Temp1_count_5m >= 3", 0)).await.unwrap();

        let t0 = Utc::now();
        engine.observe(&reading("Temp1", 40.0, t0 - ChronoDuration::minutes(10)));
        engine.observe(&reading("Temp1", 60.0, t0 - ChronoDuration::minutes(2)));
        engine.observe(&reading("Temp1", 50.0, t0 - ChronoDuration::minutes(1)));
        assert_eq!(engine.evaluate_rules_at(t0).await, 0);

        engine.observe(&reading("Temp1", 70.0, t0));
        assert_eq!(engine.evaluate_rules_at(t0).await, 1);
    }

    #[tokio::test]
    async fn test_statistic_window_must_fit_history() {
        let engine = engine(Arc::new(RecordingWriter::default()));
        assert!(engine.check_condition("stat_Temp1_mean_60m > 1").is_ok());
        assert!(matches!(engine.check_condition("stat_Temp1_avg_2d > 1"), Err(GatewayError::Validation(_))));
        assert!(matches!(engine.check_condition("stat_Temp1_mean_3600s > 1"), Ok(())));
        assert!(matches!(engine.check_condition("Temp1 > 1 or stat_Temp1_max_61m > 1"), Err(GatewayError::Validation(_))));

        let rejected = engine.upsert_rule(rule(1, "stat_Temp1_mean_2d > 50", 0)).await;
        assert!(matches!(rejected, Err(GatewayError::Validation(_))));
        assert!(engine.rules().await.is_empty());
    }

    #[tokio::test]
    async fn test_rule_never_overlaps_itself() {
        let writer = Arc::new(RecordingWriter { delay_ms: 50, ..RecordingWriter::default() });
        let engine = engine(writer.clone());
        engine.upsert_rule(rule(1, "Temp1 > 50", 0)).await.unwrap();
        engine.observe(&reading("Temp1", 90.0, Utc::now()));

        let now = Utc::now();
        let (a, b) = tokio::join!(
            engine.evaluate_rules_at(now),
            engine.evaluate_rules_at(now + ChronoDuration::milliseconds(1))
        );
        assert_eq!(a + b, 1);
        assert_eq!(writer.writes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_keeps_trigger_time() {
        let writer = Arc::new(RecordingWriter::default());
        let engine = engine(writer.clone());
        engine.upsert_rule(rule(1, "Temp1 > 50", 30)).await.unwrap();
        let t0 = Utc::now();
        engine.observe(&reading("Temp1", 90.0, t0));
        assert_eq!(engine.evaluate_rules_at(t0).await, 1);

        engine.upsert_rule(rule(1, "Temp1 > 40", 30)).await.unwrap();
        assert_eq!(engine.evaluate_rules_at(t0 + ChronoDuration::seconds(1)).await, 0);
        assert!(engine.remove_rule(1).await);
        assert!(engine.rules().await.is_empty());
    }
}
