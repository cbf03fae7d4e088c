use async_trait::async_trait;
use log::{debug, info, warn};
use rumqttc::{AsyncClient, Event, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::settings::DigitalTwinConfig;
use crate::drivers::mqtt::mqtt_options;
use crate::sensors::models::Sensor;
use crate::sensors::SensorRegistry;
use crate::storage::models::BufferedRecord;
use crate::utils::error::GatewayError;

pub const ENTITY_TYPE: &str = "EdgeGateway_Device";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileMapping {
    pub incoming_key: String,
    pub target_attribute: String,
    #[serde(rename = "type")]
    pub value_type: String,
    pub transformation: String,
    pub unit: Option<String>,
    pub protocol: String,
}

/// Provisioning document for the digital-twin platform, rebuilt on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    pub description: String,
    #[serde(rename = "entityType")]
    pub entity_type: String,
    pub mappings: Vec<ProfileMapping>,
}

impl DeviceProfile {
    /// Enabled sensors only, in id order.
    pub fn from_sensors(gateway_name: &str, sensors: &[Sensor]) -> Self {
        let mappings = sensors
            .iter()
            .filter(|s| s.definition.enabled)
            .map(|s| {
                let key = s.definition.twin_key().to_string();
                ProfileMapping {
                    incoming_key: key.clone(),
                    target_attribute: key,
                    value_type: "Number".to_string(),
                    transformation: "val".to_string(),
                    unit: s.definition.unit.clone(),
                    protocol: s.protocol().as_str().to_string(),
                }
            })
            .collect();
        Self {
            name: gateway_name.to_string(),
            description: format!("Auto-generated profile from {} sensors", gateway_name),
            entity_type: ENTITY_TYPE.to_string(),
            mappings,
        }
    }
}

#[async_trait]
pub trait TwinPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), GatewayError>;
}

/// Publishes to the twin broker over one long-lived MQTT session.
pub struct MqttTwinPublisher {
    client: AsyncClient,
    event_loop: JoinHandle<()>,
}

impl MqttTwinPublisher {
    pub fn connect(config: &DigitalTwinConfig) -> Self {
        let options = mqtt_options(
            &config.client_id,
            &config.host,
            config.port,
            config.username.as_deref(),
            config.password.as_deref(),
        );
        let (client, mut eventloop) = AsyncClient::new(options, 100);
        let host = config.host.clone();
        let event_loop = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => info!("☁️  Connected to digital twin broker {}", host),
                    Ok(_) => {}
                    Err(e) => {
                        warn!("⚠️  Digital twin broker error: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });
        Self { client, event_loop }
    }

    pub fn close(&self) {
        let _ = self.client.try_disconnect();
        self.event_loop.abort();
    }
}

#[async_trait]
impl TwinPublisher for MqttTwinPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), GatewayError> {
        // never wait on a full request queue while the broker is away
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| GatewayError::ServiceNotAvailable(format!("twin publish failed: {}", e)))
    }
}

/// Forwards synced readings as `{ "<twin attribute>": value }` messages.
pub struct TwinForwarder {
    publisher: Arc<dyn TwinPublisher>,
    registry: Arc<SensorRegistry>,
    topic: String,
}

impl TwinForwarder {
    pub fn new(publisher: Arc<dyn TwinPublisher>, registry: Arc<SensorRegistry>, topic: String) -> Self {
        Self { publisher, registry, topic }
    }

    /// Best effort: failures are counted and logged, never returned.
    pub async fn forward(&self, records: &[BufferedRecord]) -> usize {
        let keys: HashMap<i64, String> = self
            .registry
            .list()
            .await
            .into_iter()
            .map(|s| (s.id, s.definition.twin_key().to_string()))
            .collect();

        let mut failed = 0;
        for record in records {
            let key = keys.get(&record.sensor_id).cloned().unwrap_or_else(|| record.sensor_name.clone());
            let mut body = serde_json::Map::new();
            body.insert(key, serde_json::Value::from(record.value));
            let payload = serde_json::Value::Object(body).to_string().into_bytes();
            if let Err(e) = self.publisher.publish(&self.topic, payload).await {
                failed += 1;
                debug!("Twin forward of sensor {} failed: {}", record.sensor_id, e);
            }
        }
        if failed > 0 {
            warn!("⚠️  {} of {} readings not forwarded to digital twin", failed, records.len());
        }
        failed
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::settings::DriverConfig;
    use crate::drivers::DefaultDriverFactory;
    use crate::sensors::models::{ConnectionParams, SensorDefinition, SensorState};
    use chrono::Utc;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    pub(crate) struct RecordingPublisher {
        pub messages: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl TwinPublisher for RecordingPublisher {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), GatewayError> {
            let text = String::from_utf8(payload).map_err(|e| GatewayError::Serialization(e.to_string()))?;
            self.messages.lock().unwrap().push((topic.to_string(), text));
            Ok(())
        }
    }

    fn sensor(id: i64, name: &str, twin: Option<&str>, enabled: bool) -> Sensor {
        let mut definition = SensorDefinition::new(name, ConnectionParams::VirtualOutput { initial_value: 0.0 });
        definition.twin_attribute = twin.map(str::to_string);
        definition.unit = Some("bar".into());
        definition.enabled = enabled;
        Sensor { id, definition, state: SensorState::default() }
    }

    #[test]
    fn test_profile_uses_twin_attribute_and_skips_disabled() {
        let sensors = vec![
            sensor(1, "Pressure", Some("line_pressure"), true),
            sensor(2, "Spare", None, false),
            sensor(3, "Valve", None, true),
        ];
        let profile = DeviceProfile::from_sensors("plant-a", &sensors);
        assert_eq!(profile.description, "Auto-generated profile from plant-a sensors");
        assert_eq!(profile.mappings.len(), 2);
        assert_eq!(profile.mappings[0].incoming_key, "line_pressure");
        assert_eq!(profile.mappings[1].target_attribute, "Valve");
        assert_eq!(profile.mappings[1].protocol, "VIRTUAL_OUTPUT");

        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["entityType"], ENTITY_TYPE);
        assert_eq!(json["mappings"][0]["type"], "Number");
        assert_eq!(json["mappings"][0]["transformation"], "val");
    }

    #[tokio::test]
    async fn test_forwarder_maps_attribute_names() {
        let (tx, _rx) = mpsc::channel(8);
        let registry = Arc::new(SensorRegistry::new(Arc::new(DefaultDriverFactory), DriverConfig::default(), tx));
        let mut def = SensorDefinition::new("Temp1", ConnectionParams::VirtualOutput { initial_value: 0.0 });
        def.twin_attribute = Some("temp_c".into());
        def.enabled = false;
        registry.add(1, def).await.unwrap();

        let publisher = Arc::new(RecordingPublisher::default());
        let forwarder = TwinForwarder::new(publisher.clone(), registry, "twin/plant".into());
        let record = |sensor_id: i64, name: &str, value: f64| BufferedRecord {
            id: 1,
            sensor_id,
            sensor_name: name.into(),
            timestamp: Utc::now(),
            value,
            raw_value: value,
            synced: true,
            synced_at: None,
        };
        let failed = forwarder.forward(&[record(1, "Temp1", 24.5), record(99, "Gone", 1.0)]).await;
        assert_eq!(failed, 0);

        let messages = publisher.messages.lock().unwrap();
        assert_eq!(messages[0], ("twin/plant".to_string(), r#"{"temp_c":24.5}"#.to_string()));
        assert_eq!(messages[1].1, r#"{"Gone":1.0}"#);
    }
}
