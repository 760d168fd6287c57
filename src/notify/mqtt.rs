//! MQTT notification sink.
//!
//! Publishes each confirmed event as JSON with QoS 1 to
//! `<prefix>/events/<source>`. A background thread pumps the rumqttc
//! connection; it keeps reconnecting until the sink is dropped.
//!
//! A successful `deliver` means the publish was queued with the client, not
//! that the broker acknowledged it. The PUBACK is handled by the pump and
//! unacked publishes are resent on reconnect, so the dispatcher's dedup
//! record can precede the ack.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use serde::Deserialize;

use super::sink::{DeliveryError, NotificationPayload, NotificationSink};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MqttSinkConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
}

impl Default for MqttSinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "cascade-kernel".to_string(),
            topic_prefix: "cascade".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 60,
        }
    }
}

pub fn event_topic(prefix: &str, source: &str) -> String {
    format!("{}/events/{}", prefix.trim_end_matches('/'), source)
}

/// QoS 1 sink. Delivery completes when rumqttc accepts the publish into its
/// request queue; a full or closed queue is reported as retryable.
pub struct MqttSink {
    name: String,
    prefix: String,
    client: Client,
    stopping: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSink {
    pub fn connect(config: &MqttSinkConfig) -> Result<Self> {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_start(true);
        if let Some(user) = &config.username {
            options.set_credentials(user, config.password.clone().unwrap_or_default());
        }

        let (client, connection) = Client::new(options, 10);
        let stopping = Arc::new(AtomicBool::new(false));
        let pump = spawn_pump(connection, Arc::clone(&stopping))
            .context("spawn mqtt connection thread")?;
        log::info!(
            "mqtt sink ready broker={}:{} prefix={} auth={}",
            config.host,
            config.port,
            config.topic_prefix,
            config.username.is_some()
        );

        Ok(Self {
            name: "mqtt".to_string(),
            prefix: config.topic_prefix.clone(),
            client,
            stopping,
            pump: Mutex::new(Some(pump)),
        })
    }
}

fn spawn_pump(mut connection: Connection, stopping: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("mqtt-pump".to_string())
        .spawn(move || loop {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        if stopping.load(Ordering::SeqCst) {
                            return;
                        }
                        log::warn!("mqtt connection error: {}", e);
                        std::thread::sleep(RECONNECT_DELAY);
                    }
                }
                if stopping.load(Ordering::SeqCst) {
                    return;
                }
            }
            if stopping.load(Ordering::SeqCst) {
                return;
            }
        })
}

impl NotificationSink for MqttSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&self, payload: &NotificationPayload) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| DeliveryError::Permanent(format!("encode payload: {}", e)))?;
        let topic = event_topic(&self.prefix, payload.source.as_str());
        self.client
            .publish(topic, QoS::AtLeastOnce, false, body)
            .map_err(|e| DeliveryError::Retryable(format!("publish: {}", e)))
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect() {
            log::debug!("mqtt disconnect: {}", e);
        }
        let handle = match self.pump.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SourceId, Timestamp, TriggerId};

    #[test]
    fn topic_joins_prefix_and_source() {
        assert_eq!(event_topic("home/cams", "porch"), "home/cams/events/porch");
        assert_eq!(event_topic("home/cams/", "porch"), "home/cams/events/porch");
    }

    #[test]
    fn deliver_completes_once_queued_without_a_broker() {
        // Nothing listens on port 1, so no PUBACK can ever arrive.
        let sink = MqttSink::connect(&MqttSinkConfig {
            port: 1,
            ..MqttSinkConfig::default()
        })
        .unwrap();
        let payload = NotificationPayload {
            trigger_id: TriggerId::from_raw(9),
            source: SourceId::from("porch"),
            detections: Vec::new(),
            timestamp: Timestamp::from_millis(0),
            frame_digest: String::new(),
        };
        assert_eq!(sink.deliver(&payload), Ok(()));
        assert_eq!(sink.name(), "mqtt");
    }

    #[test]
    fn config_fills_defaults() {
        let cfg: MqttSinkConfig = serde_json::from_str(r#"{"host":"broker.lan"}"#).unwrap();
        assert_eq!(cfg.host, "broker.lan");
        assert_eq!(cfg.port, 1883);
        assert_eq!(cfg.topic_prefix, "cascade");
    }
}
