use log::{debug, info, warn};
use rumqttc::{AsyncClient, Event, Packet, QoS};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::settings::CommandListenerConfig;
use crate::drivers::mqtt::mqtt_options;
use crate::sensors::SensorRegistry;
use crate::utils::error::GatewayError;

#[derive(Debug, Clone, PartialEq)]
pub enum CommandTarget {
    Id(i64),
    Name(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteCommand {
    pub target: CommandTarget,
    pub value: f64,
}

#[derive(Deserialize)]
struct RawCommand {
    sensor_id: Option<i64>,
    sensor_name: Option<String>,
    value: Option<serde_json::Value>,
}

/// `{"sensor_id": 12, "value": 1.0}` or `{"sensor_name": "pump", "value": true}`.
pub fn parse_command(payload: &[u8]) -> Result<WriteCommand, GatewayError> {
    let raw: RawCommand = serde_json::from_slice(payload)?;
    let value = match raw.value {
        None | Some(serde_json::Value::Null) => {
            return Err(GatewayError::Validation("command is missing 'value'".into()))
        }
        Some(serde_json::Value::Bool(b)) => f64::from(u8::from(b)),
        Some(v) => v
            .as_f64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
            .ok_or_else(|| GatewayError::Validation(format!("command value {} is not numeric", v)))?,
    };
    if !value.is_finite() {
        return Err(GatewayError::Validation(format!("command value {} is not finite", value)));
    }
    let target = match (raw.sensor_id, raw.sensor_name) {
        (Some(id), _) => CommandTarget::Id(id),
        (None, Some(name)) if !name.is_empty() => CommandTarget::Name(name),
        _ => return Err(GatewayError::Validation("command needs 'sensor_id' or 'sensor_name'".into())),
    };
    Ok(WriteCommand { target, value })
}

/// Resolves the target and writes through the registry.
pub async fn execute(registry: &SensorRegistry, command: WriteCommand) -> Result<i64, GatewayError> {
    let id = match command.target {
        CommandTarget::Id(id) => id,
        CommandTarget::Name(name) => registry
            .find_by_name(&name)
            .await
            .map(|s| s.id)
            .ok_or_else(|| GatewayError::NotFound(format!("sensor '{}'", name)))?,
    };
    registry.write(id, command.value).await?;
    Ok(id)
}

async fn handle_message(registry: &SensorRegistry, topic: &str, payload: &[u8]) {
    debug!("Command on {}: {}", topic, String::from_utf8_lossy(payload));
    let command = match parse_command(payload) {
        Ok(command) => command,
        Err(e) => {
            warn!("⚠️  Ignoring command on {}: {}", topic, e);
            return;
        }
    };
    let value = command.value;
    match execute(registry, command).await {
        Ok(id) => info!("🎛️  Remote command: sensor {} <- {}", id, value),
        Err(e) => warn!("⚠️  Remote command failed: {}", e),
    }
}

/// Subscribes to `<prefix>/<gateway>/cmd/#` and turns messages into
/// actuator writes.
pub struct CommandListener {
    client: AsyncClient,
    task: JoinHandle<()>,
}

impl CommandListener {
    pub fn start(config: &CommandListenerConfig, topic: String, registry: Arc<SensorRegistry>) -> Self {
        let client_id = format!("{}_cmd", config.client_id);
        let options = mqtt_options(&client_id, &config.broker, config.port, None, None);
        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let subscriber = client.clone();

        info!("🎛️  Command listener on {}:{} topic {}", config.broker, config.port, topic);
        let task = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        if let Err(e) = subscriber.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                            warn!("⚠️  Command subscribe failed: {}", e);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        handle_message(&registry, &publish.topic, &publish.payload).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("⚠️  Command listener connection error: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });
        Self { client, task }
    }

    pub fn stop(&self) {
        let _ = self.client.try_disconnect();
        self.task.abort();
        info!("🎛️  Command listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::DriverConfig;
    use crate::drivers::{DefaultDriverFactory, DriverEventKind};
    use crate::sensors::models::{ConnectionParams, SensorDefinition};
    use tokio::sync::mpsc;

    #[test]
    fn test_parse_by_id_and_name() {
        let cmd = parse_command(br#"{"sensor_id": 12, "value": 1.5}"#).unwrap();
        assert_eq!(cmd, WriteCommand { target: CommandTarget::Id(12), value: 1.5 });

        let cmd = parse_command(br#"{"sensor_name": "Pump", "value": true}"#).unwrap();
        assert_eq!(cmd, WriteCommand { target: CommandTarget::Name("Pump".into()), value: 1.0 });

        let cmd = parse_command(br#"{"sensor_name": "Pump", "value": "0"}"#).unwrap();
        assert_eq!(cmd.value, 0.0);
    }

    #[test]
    fn test_parse_rejects_incomplete_commands() {
        assert!(matches!(parse_command(br#"{"sensor_id": 1}"#), Err(GatewayError::Validation(_))));
        assert!(matches!(parse_command(br#"{"sensor_id": 1, "value": null}"#), Err(GatewayError::Validation(_))));
        assert!(matches!(parse_command(br#"{"value": 1}"#), Err(GatewayError::Validation(_))));
        assert!(matches!(parse_command(br#"{"sensor_id": 1, "value": "on"}"#), Err(GatewayError::Validation(_))));
        assert!(parse_command(b"not json").is_err());
        assert!(matches!(parse_command(br#"{"sensor_id": 1, "value": "inf"}"#), Err(GatewayError::Validation(_))));
        assert!(matches!(parse_command(br#"{"sensor_id": 1, "value": "NaN"}"#), Err(GatewayError::Validation(_))));
    }

    #[tokio::test]
    async fn test_execute_resolves_names() {
        let (tx, mut rx) = mpsc::channel(16);
        let registry = SensorRegistry::new(Arc::new(DefaultDriverFactory), DriverConfig::default(), tx);
        registry
            .add(7, SensorDefinition::new("Valve", ConnectionParams::VirtualOutput { initial_value: 0.0 }))
            .await
            .unwrap();

        let id = execute(&registry, WriteCommand { target: CommandTarget::Name("Valve".into()), value: 1.0 })
            .await
            .unwrap();
        assert_eq!(id, 7);

        let mut values = Vec::new();
        while values.len() < 2 {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            if let DriverEventKind::Value(v) = event.kind {
                values.push(v);
            }
        }
        assert_eq!(values, vec![0.0, 1.0]);

        let missing = execute(&registry, WriteCommand { target: CommandTarget::Name("Nope".into()), value: 1.0 }).await;
        assert!(matches!(missing, Err(GatewayError::NotFound(_))));
        registry.stop_all().await;
    }
}
