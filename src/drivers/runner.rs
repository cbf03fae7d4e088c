use chrono::Utc;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};

use super::{Driver, DriverEvent, DriverEventKind, DriverMode};
use crate::utils::error::DriverError;

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub poll_interval: Duration,
    pub io_timeout: Duration,
    pub max_backoff: Duration,
    pub command_queue: usize,
}

struct WriteCommand {
    value: f64,
    reply: oneshot::Sender<Result<(), DriverError>>,
}

/// Sends write commands to a driver task without borrowing its handle.
#[derive(Clone)]
pub struct DriverWriter {
    commands: mpsc::Sender<WriteCommand>,
}

impl DriverWriter {
    pub async fn write(&self, value: f64) -> Result<(), DriverError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(WriteCommand { value, reply })
            .await
            .map_err(|_| DriverError::Connection("driver task stopped".to_string()))?;
        response
            .await
            .map_err(|_| DriverError::Connection("driver task stopped".to_string()))?
    }
}

/// Registry-side handle of a running driver task.
pub struct DriverHandle {
    pub generation: u64,
    cancel: watch::Sender<bool>,
    writer: DriverWriter,
    join: JoinHandle<()>,
}

impl DriverHandle {
    pub fn writer(&self) -> DriverWriter {
        self.writer.clone()
    }

    pub async fn write(&self, value: f64) -> Result<(), DriverError> {
        self.writer.write(value).await
    }

    /// Cancels the task and waits until the driver has released its connection.
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.join.await {
            warn!("⚠️  Driver task ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

pub fn spawn_driver(
    sensor_id: i64,
    generation: u64,
    driver: Box<dyn Driver>,
    settings: RunnerSettings,
    events: mpsc::Sender<DriverEvent>,
) -> DriverHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (cmd_tx, cmd_rx) = mpsc::channel(settings.command_queue.max(1));

    let runner = Runner { sensor_id, generation, driver, settings, events, cancel: cancel_rx, commands: cmd_rx };
    let join = tokio::spawn(runner.run());

    DriverHandle { generation, cancel: cancel_tx, writer: DriverWriter { commands: cmd_tx }, join }
}

struct Runner {
    sensor_id: i64,
    generation: u64,
    driver: Box<dyn Driver>,
    settings: RunnerSettings,
    events: mpsc::Sender<DriverEvent>,
    cancel: watch::Receiver<bool>,
    commands: mpsc::Receiver<WriteCommand>,
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

enum Step {
    Stop,
    Continue,
}

impl Runner {
    async fn run(mut self) {
        let mode = self.driver.mode();
        let mut backoff = self.settings.poll_interval;
        let mut connected = false;
        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!("▶️  Driver for sensor {} started (generation {})", self.sensor_id, self.generation);

        loop {
            if !connected {
                match timeout(self.settings.io_timeout, self.driver.connect()).await {
                    Ok(Ok(())) => {
                        connected = true;
                        backoff = self.settings.poll_interval;
                        info!("🔗 Sensor {} connected", self.sensor_id);
                        ticker.reset_immediately();
                    }
                    Ok(Err(e)) => {
                        if let Step::Stop = self.fail_and_wait(e, &mut backoff).await {
                            break;
                        }
                        continue;
                    }
                    Err(_) => {
                        if let Step::Stop = self.fail_and_wait(DriverError::Timeout, &mut backoff).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            let outcome = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => break,
                Some(cmd) = self.commands.recv() => {
                    let result = timeout(self.settings.io_timeout, self.driver.write(cmd.value))
                        .await
                        .unwrap_or(Err(DriverError::Timeout));
                    if let Err(e) = &result {
                        warn!("⚠️  Write to sensor {} failed: {}", self.sensor_id, e);
                    }
                    let _ = cmd.reply.send(result);
                    None
                }
                _ = ticker.tick(), if mode == DriverMode::Polled => {
                    // a started request is never interrupted by a write
                    tokio::select! {
                        biased;
                        _ = cancelled(&mut self.cancel) => break,
                        res = timeout(self.settings.io_timeout, self.driver.read()) => {
                            Some(res.unwrap_or(Err(DriverError::Timeout)))
                        }
                    }
                }
                res = self.driver.read(), if mode == DriverMode::EventDriven => Some(res),
            };

            match outcome {
                None => {}
                Some(Ok(value)) => {
                    backoff = self.settings.poll_interval;
                    if let Step::Stop = self.emit(DriverEventKind::Value(value)).await {
                        break;
                    }
                }
                Some(Err(e)) if e.is_connection_level() => {
                    warn!("⚠️  Sensor {} connection lost: {}", self.sensor_id, e);
                    self.driver.disconnect().await;
                    connected = false;
                    if let Step::Stop = self.fail_and_wait(e, &mut backoff).await {
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!("Sensor {} read error: {}", self.sensor_id, e);
                    if let Step::Stop = self.emit(DriverEventKind::Failure(e)).await {
                        break;
                    }
                }
            }
        }

        self.driver.disconnect().await;
        info!("⏹️  Driver for sensor {} stopped", self.sensor_id);
    }

    async fn emit(&mut self, kind: DriverEventKind) -> Step {
        let event = DriverEvent { sensor_id: self.sensor_id, generation: self.generation, timestamp: Utc::now(), kind };
        tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => Step::Stop,
            sent = self.events.send(event) => match sent {
                Ok(()) => Step::Continue,
                Err(_) => Step::Stop,
            },
        }
    }

    /// Reports a connection-level failure and sleeps for the current backoff,
    /// answering writes with an error in the meantime.
    async fn fail_and_wait(&mut self, error: DriverError, backoff: &mut Duration) -> Step {
        if let Step::Stop = self.emit(DriverEventKind::Failure(error)).await {
            return Step::Stop;
        }

        let wait = sleep(*backoff);
        tokio::pin!(wait);
        *backoff = (*backoff * 2).min(self.settings.max_backoff.max(self.settings.poll_interval));

        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => return Step::Stop,
                Some(cmd) = self.commands.recv() => {
                    let _ = cmd.reply.send(Err(DriverError::Connection("device not connected".to_string())));
                }
                _ = &mut wait => return Step::Continue,
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Polled driver replaying scripted results.
    pub(crate) struct ScriptedDriver {
        pub script: Arc<Mutex<VecDeque<Result<f64, DriverError>>>>,
        pub connects: Arc<AtomicUsize>,
        pub disconnected: Arc<AtomicBool>,
        pub writes: Arc<Mutex<Vec<f64>>>,
    }

    impl ScriptedDriver {
        pub(crate) fn new(script: Vec<Result<f64, DriverError>>) -> Self {
            Self {
                script: Arc::new(Mutex::new(script.into())),
                connects: Arc::new(AtomicUsize::new(0)),
                disconnected: Arc::new(AtomicBool::new(false)),
                writes: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Driver for ScriptedDriver {
        fn mode(&self) -> DriverMode {
            DriverMode::Polled
        }

        async fn connect(&mut self) -> Result<(), DriverError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.disconnected.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn read(&mut self) -> Result<f64, DriverError> {
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(0.0))
        }

        async fn write(&mut self, value: f64) -> Result<(), DriverError> {
            self.writes.lock().unwrap().push(value);
            Ok(())
        }

        async fn disconnect(&mut self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn fast_settings() -> RunnerSettings {
        RunnerSettings {
            poll_interval: Duration::from_millis(10),
            io_timeout: Duration::from_millis(200),
            max_backoff: Duration::from_millis(40),
            command_queue: 4,
        }
    }

    #[tokio::test]
    async fn test_runner_emits_values_and_failures() {
        let driver = ScriptedDriver::new(vec![
            Ok(245.0),
            Err(DriverError::Protocol("bad crc".into())),
            Err(DriverError::Connection("reset".into())),
            Ok(250.0),
        ]);
        let connects = Arc::clone(&driver.connects);
        let (tx, mut rx) = mpsc::channel(16);
        let handle = spawn_driver(7, 1, Box::new(driver), fast_settings(), tx);

        let mut kinds = Vec::new();
        for _ in 0..4 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.sensor_id, 7);
            assert_eq!(event.generation, 1);
            kinds.push(event.kind);
        }
        assert_eq!(kinds[0], DriverEventKind::Value(245.0));
        assert_eq!(kinds[1], DriverEventKind::Failure(DriverError::Protocol("bad crc".into())));
        assert_eq!(kinds[2], DriverEventKind::Failure(DriverError::Connection("reset".into())));
        assert_eq!(kinds[3], DriverEventKind::Value(250.0));
        // protocol errors keep the link, connection errors force a reconnect
        assert_eq!(connects.load(Ordering::SeqCst), 2);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_disconnects_driver() {
        let driver = ScriptedDriver::new(vec![]);
        let disconnected = Arc::clone(&driver.disconnected);
        let (tx, _rx) = mpsc::channel(1);
        let handle = spawn_driver(1, 1, Box::new(driver), fast_settings(), tx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.stop().await;
        assert!(disconnected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_write_goes_through_runner() {
        let driver = ScriptedDriver::new(vec![]);
        let writes = Arc::clone(&driver.writes);
        let (tx, mut rx) = mpsc::channel(64);
        let handle = spawn_driver(1, 1, Box::new(driver), fast_settings(), tx);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });

        handle.write(1.0).await.unwrap();
        handle.write(0.0).await.unwrap();
        assert_eq!(*writes.lock().unwrap(), vec![1.0, 0.0]);
        handle.stop().await;
    }

    struct NeverConnects;

    #[async_trait]
    impl Driver for NeverConnects {
        fn mode(&self) -> DriverMode {
            DriverMode::Polled
        }
        async fn connect(&mut self) -> Result<(), DriverError> {
            Err(DriverError::Connection("refused".into()))
        }
        async fn read(&mut self) -> Result<f64, DriverError> {
            unreachable!()
        }
        async fn disconnect(&mut self) {}
    }

    #[tokio::test]
    async fn test_runner_keeps_retrying_with_backoff() {
        let (tx, mut rx) = mpsc::channel(64);
        let handle = spawn_driver(3, 1, Box::new(NeverConnects), fast_settings(), tx);
        for _ in 0..4 {
            let event = rx.recv().await.unwrap();
            assert!(matches!(event.kind, DriverEventKind::Failure(DriverError::Connection(_))));
        }
        assert!(!handle.is_finished());
        assert!(handle.write(1.0).await.is_err());
        handle.stop().await;
    }
}
