use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Driver, DriverMode};
use crate::sensors::models::ConnectionParams;
use crate::utils::error::{DriverError, GatewayError};

pub fn qos_from_level(level: u8) -> QoS {
    match level {
        2 => QoS::ExactlyOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::AtMostOnce,
    }
}

pub fn mqtt_options(
    client_id: &str,
    host: &str,
    port: u16,
    username: Option<&str>,
    password: Option<&str>,
) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(Duration::from_secs(30));
    if let (Some(username), Some(password)) = (username, password) {
        options.set_credentials(username, password);
    }
    options
}

/// Pulls a number out of an MQTT payload.
///
/// With a path (`$.a.b`, `$.a[0]`, `$.a.0`) the payload must be JSON and the
/// path must resolve. Without one, a JSON object with a `value` key is
/// unwrapped and a bare number (JSON or plain text) is accepted.
pub fn extract_value(payload: &[u8], json_path: Option<&str>) -> Result<f64, DriverError> {
    let value = extract_raw(payload, json_path)?;
    if !value.is_finite() {
        return Err(DriverError::Protocol(format!("value {} is not finite", value)));
    }
    Ok(value)
}

fn extract_raw(payload: &[u8], json_path: Option<&str>) -> Result<f64, DriverError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| DriverError::Protocol("payload is not UTF-8".to_string()))?;

    let mut data: JsonValue = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            if json_path.is_none() {
                if let Ok(n) = text.trim().parse::<f64>() {
                    return Ok(n);
                }
            }
            return Err(DriverError::Protocol(format!("malformed JSON payload: {}", e)));
        }
    };

    if let Some(path) = json_path {
        for key in path_segments(path)? {
            data = match (data, key.parse::<usize>()) {
                (JsonValue::Object(mut map), _) => map
                    .remove(&key)
                    .ok_or_else(|| DriverError::Protocol(format!("path {} not found (missing '{}')", path, key)))?,
                (JsonValue::Array(mut items), Ok(index)) if index < items.len() => items.swap_remove(index),
                _ => return Err(DriverError::Protocol(format!("path {} not found at '{}'", path, key))),
            };
        }
    }

    if let JsonValue::Object(map) = &data {
        if let Some(inner) = map.get("value") {
            data = inner.clone();
        }
    }

    match data {
        JsonValue::Number(n) => n
            .as_f64()
            .ok_or_else(|| DriverError::Protocol("number out of range".to_string())),
        JsonValue::Bool(b) => Ok(if b { 1.0 } else { 0.0 }),
        JsonValue::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| DriverError::Protocol(format!("'{}' is not numeric", s))),
        other => Err(DriverError::Protocol(format!("value {} is not numeric", other))),
    }
}

fn path_segments(path: &str) -> Result<Vec<String>, DriverError> {
    let body = path
        .strip_prefix('$')
        .ok_or_else(|| DriverError::Protocol(format!("json path '{}' must start with '$'", path)))?;
    let mut segments = Vec::new();
    for part in body.split('.').filter(|p| !p.is_empty()) {
        // `items[2]` -> "items", "2"
        let mut rest = part;
        if let Some(idx) = rest.find('[') {
            if idx > 0 {
                segments.push(rest[..idx].to_string());
            }
            rest = &rest[idx..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let close = stripped
                    .find(']')
                    .ok_or_else(|| DriverError::Protocol(format!("unterminated index in '{}'", path)))?;
                segments.push(stripped[..close].trim_matches(|c| c == '\'' || c == '"').to_string());
                rest = &stripped[close + 1..];
            }
        } else {
            segments.push(rest.to_string());
        }
    }
    Ok(segments)
}

type Incoming = Result<Bytes, String>;

/// Subscribes to a topic and yields one value per received message.
pub struct MqttDriver {
    client_id: String,
    broker: String,
    port: u16,
    topic: String,
    json_path: Option<String>,
    qos: QoS,
    username: Option<String>,
    password: Option<String>,
    command_topic: String,
    client: Option<AsyncClient>,
    messages: Option<mpsc::Receiver<Incoming>>,
    event_loop: Option<JoinHandle<()>>,
}

impl MqttDriver {
    pub fn new(sensor_id: i64, params: ConnectionParams) -> Result<Self, GatewayError> {
        match params {
            ConnectionParams::Mqtt { broker, port, topic, json_path, qos, username, password, command_topic } => {
                let suffix = uuid::Uuid::new_v4().simple().to_string();
                Ok(Self {
                    client_id: format!("gw-sensor-{}-{}", sensor_id, &suffix[..8]),
                    broker,
                    port,
                    command_topic: command_topic.unwrap_or_else(|| format!("{}/set", topic)),
                    topic,
                    json_path,
                    qos: qos_from_level(qos),
                    username,
                    password,
                    client: None,
                    messages: None,
                    event_loop: None,
                })
            }
            other => Err(GatewayError::Validation(format!(
                "{} parameters given to MQTT driver",
                other.protocol().as_str()
            ))),
        }
    }
}

#[async_trait]
impl Driver for MqttDriver {
    fn mode(&self) -> DriverMode {
        DriverMode::EventDriven
    }

    async fn connect(&mut self) -> Result<(), DriverError> {
        let options = mqtt_options(
            &self.client_id,
            &self.broker,
            self.port,
            self.username.as_deref(),
            self.password.as_deref(),
        );
        let (client, mut eventloop) = AsyncClient::new(options, 16);
        let (tx, rx) = mpsc::channel::<Incoming>(64);

        let topic = self.topic.clone();
        let qos = self.qos;
        let subscriber = client.clone();
        let handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // clean sessions drop subscriptions, so subscribe on every (re)connect
                        if let Err(e) = subscriber.try_subscribe(topic.clone(), qos) {
                            let _ = tx.send(Err(format!("subscribe failed: {}", e))).await;
                            return;
                        }
                        info!("📡 Subscribed to MQTT topic {}", topic);
                    }
                    Ok(Event::Incoming(Packet::Publish(msg))) => {
                        debug!("MQTT received on {}", msg.topic);
                        if tx.send(Ok(msg.payload)).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("⚠️  MQTT connection error: {}", e);
                        let _ = tx.send(Err(e.to_string())).await;
                        return;
                    }
                }
            }
        });

        self.client = Some(client);
        self.messages = Some(rx);
        self.event_loop = Some(handle);
        Ok(())
    }

    async fn read(&mut self) -> Result<f64, DriverError> {
        let messages = self
            .messages
            .as_mut()
            .ok_or_else(|| DriverError::Connection("not connected".to_string()))?;
        match messages.recv().await {
            Some(Ok(payload)) => extract_value(&payload, self.json_path.as_deref()),
            Some(Err(e)) => Err(DriverError::Connection(e)),
            None => Err(DriverError::Connection("MQTT event loop stopped".to_string())),
        }
    }

    async fn write(&mut self, value: f64) -> Result<(), DriverError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| DriverError::Connection("not connected".to_string()))?;
        client
            .publish(self.command_topic.clone(), self.qos, false, value.to_string())
            .await
            .map_err(|e| DriverError::Connection(format!("publish failed: {}", e)))?;
        info!("📤 Published {} to {}", value, self.command_topic);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.try_disconnect();
        }
        if let Some(handle) = self.event_loop.take() {
            handle.abort();
        }
        self.messages = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_and_wrapped_values() {
        assert_eq!(extract_value(b"23.5", None).unwrap(), 23.5);
        assert_eq!(extract_value(b" 42 ", None).unwrap(), 42.0);
        assert_eq!(extract_value(br#"{"value": 7}"#, None).unwrap(), 7.0);
        assert_eq!(extract_value(b"true", None).unwrap(), 1.0);
        assert_eq!(extract_value(br#""18.25""#, None).unwrap(), 18.25);
    }

    #[test]
    fn test_json_path_extraction() {
        let payload = br#"{"sensors": {"temp": 21.5, "list": [1, 2, {"value": 3}]}}"#;
        assert_eq!(extract_value(payload, Some("$.sensors.temp")).unwrap(), 21.5);
        assert_eq!(extract_value(payload, Some("$.sensors.list[1]")).unwrap(), 2.0);
        assert_eq!(extract_value(payload, Some("$.sensors.list.0")).unwrap(), 1.0);
        assert_eq!(extract_value(payload, Some("$.sensors.list[2]")).unwrap(), 3.0);
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(extract_value(b"{not json", Some("$.a")), Err(DriverError::Protocol(_))));
        assert!(matches!(extract_value(b"abc", None), Err(DriverError::Protocol(_))));
        assert!(matches!(extract_value(br#"{"a": 1}"#, Some("$.b")), Err(DriverError::Protocol(_))));
        assert!(matches!(extract_value(br#"{"a": [1]}"#, Some("$.a[5]")), Err(DriverError::Protocol(_))));
        assert!(matches!(extract_value(br#"{"a": {"b": 1}}"#, Some("$.a")), Err(DriverError::Protocol(_))));
        assert!(matches!(extract_value(br#"{"a": null}"#, Some("$.a")), Err(DriverError::Protocol(_))));
    }

    #[test]
    fn test_non_finite_values_are_rejected() {
        for payload in [&b"inf"[..], b"nan", b"-infinity", br#"{"value": "inf"}"#, br#""NaN""#] {
            assert!(
                matches!(extract_value(payload, None), Err(DriverError::Protocol(_))),
                "{}",
                String::from_utf8_lossy(payload)
            );
        }
        assert!(matches!(extract_value(br#"{"a": "inf"}"#, Some("$.a")), Err(DriverError::Protocol(_))));
    }

    #[test]
    fn test_default_command_topic() {
        let driver = MqttDriver::new(
            4,
            ConnectionParams::Mqtt {
                broker: "localhost".into(),
                port: 1883,
                topic: "plant/valve1".into(),
                json_path: None,
                qos: 1,
                username: None,
                password: None,
                command_topic: None,
            },
        )
        .unwrap();
        assert_eq!(driver.command_topic, "plant/valve1/set");
        assert!(driver.client_id.starts_with("gw-sensor-4-"));
        assert_eq!(driver.mode(), DriverMode::EventDriven);
    }
}
