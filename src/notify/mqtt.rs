//! Message-broker channel (MQTT publish of a JSON alert).

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{ChannelSettings, NotificationChannel, NotificationPayload, RateLimiter};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(flatten)]
    pub settings: ChannelSettings,

    pub broker: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_topic")]
    pub topic: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_qos")]
    pub qos: u8,

    #[serde(default)]
    pub retain: bool,

    #[serde(default = "default_client_id")]
    pub client_id: String,
}

fn default_port() -> u16 {
    1883
}

fn default_topic() -> String {
    "ovd/alerts".to_string()
}

fn default_qos() -> u8 {
    1
}

fn default_client_id() -> String {
    "ovd-watchdog".to_string()
}

pub struct MqttChannel {
    name: String,
    config: MqttConfig,
    qos: QoS,
    limiter: RateLimiter,
}

impl MqttChannel {
    pub fn new(name: &str, config: MqttConfig) -> Result<Self> {
        if config.broker.trim().is_empty() {
            return Err(Error::channel(name, "broker is required"));
        }
        let qos = match config.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            other => return Err(Error::channel(name, format!("qos must be 0, 1 or 2, got {other}"))),
        };
        Ok(Self {
            name: name.to_string(),
            limiter: RateLimiter::from_seconds(config.settings.rate_limit_seconds),
            qos,
            config,
        })
    }

    pub fn build_message(payload: &NotificationPayload) -> Value {
        json!({
            "event_type": "security_alert",
            "incident_id": payload.incident_id,
            "rule_id": payload.rule_id,
            "rule_description": payload.rule_description,
            "track_id": payload.track_id,
            "timestamp": payload.confirmed_time,
            "alerted_at": payload.alerted_at,
            "camera_id": payload.camera_id,
            "location": payload.location,
            "confidence": payload.avg_confidence,
            "reminder": payload.reminder,
            "evidence": {
                "snapshot": payload.snapshot_path,
                "video": payload.video_clip_path,
            }
        })
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.broker.clone(),
            self.config.port,
        );
        options.set_keep_alive(Duration::from_secs(60));
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }
        options
    }

    /// Connect, publish once, and drive the event loop until the publish is
    /// acknowledged (or written, for QoS 0).
    async fn publish(&self, body: Vec<u8>) -> std::result::Result<(), String> {
        let (client, mut eventloop) = AsyncClient::new(self.options(), 10);
        client
            .publish(self.config.topic.clone(), self.qos, self.config.retain, body)
            .await
            .map_err(|e| e.to_string())?;

        let outcome = loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Publish(_))) if self.qos == QoS::AtMostOnce => break Ok(()),
                Ok(Event::Incoming(Packet::PubAck(_))) if self.qos == QoS::AtLeastOnce => break Ok(()),
                Ok(Event::Incoming(Packet::PubComp(_))) => break Ok(()),
                Ok(event) => debug!(channel = %self.name, ?event, "MQTT event"),
                Err(e) => break Err(e.to_string()),
            }
        };

        let _ = client.disconnect().await;
        outcome
    }
}

#[async_trait]
impl NotificationChannel for MqttChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_enabled(&self) -> bool {
        self.config.settings.enabled
    }

    fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    async fn send(&self, payload: &NotificationPayload) -> bool {
        let body = match serde_json::to_vec(&Self::build_message(payload)) {
            Ok(body) => body,
            Err(e) => {
                warn!(channel = %self.name, error = %e, "Could not encode MQTT message");
                return false;
            }
        };

        match self.publish(body).await {
            Ok(()) => {
                info!(
                    channel = %self.name,
                    incident_id = %payload.incident_id,
                    topic = %self.config.topic,
                    "MQTT notification sent"
                );
                true
            }
            Err(e) => {
                warn!(channel = %self.name, broker = %self.config.broker, error = %e, "MQTT notification failed");
                false
            }
        }
    }
}
