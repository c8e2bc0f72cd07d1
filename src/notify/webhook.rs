//! Chat webhook channel (Slack-compatible block messages).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use super::{ChannelSettings, NotificationChannel, NotificationPayload, RateLimiter};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(flatten)]
    pub settings: ChannelSettings,

    pub webhook_url: String,

    #[serde(default = "default_channel")]
    pub channel: String,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default = "default_icon")]
    pub icon_emoji: String,
}

fn default_channel() -> String {
    "#alerts".to_string()
}

fn default_username() -> String {
    "OVD Watchdog".to_string()
}

fn default_icon() -> String {
    ":rotating_light:".to_string()
}

pub struct WebhookChannel {
    name: String,
    config: WebhookConfig,
    client: reqwest::Client,
    limiter: RateLimiter,
}

impl WebhookChannel {
    pub fn new(name: &str, config: WebhookConfig) -> Result<Self> {
        if !config.webhook_url.starts_with("http://") && !config.webhook_url.starts_with("https://") {
            return Err(Error::channel(name, "webhook_url must be an http(s) URL"));
        }
        Ok(Self {
            name: name.to_string(),
            client: reqwest::Client::new(),
            limiter: RateLimiter::from_seconds(config.settings.rate_limit_seconds),
            config,
        })
    }

    /// Attachment colour by confidence.
    pub fn color(confidence: f32) -> &'static str {
        if confidence >= 0.8 {
            "danger"
        } else if confidence >= 0.6 {
            "warning"
        } else {
            "#808080"
        }
    }

    pub fn build_message(&self, payload: &NotificationPayload) -> Value {
        let field = |label: &str, value: String| {
            json!({"type": "mrkdwn", "text": format!("*{label}:*\n{value}")})
        };

        let mut blocks = vec![
            json!({
                "type": "header",
                "text": {"type": "plain_text", "text": payload.title(), "emoji": true}
            }),
            json!({
                "type": "section",
                "fields": [
                    field("Incident ID", payload.incident_id.clone()),
                    field("Time", payload.alerted_at_display()),
                    field("Camera", payload.camera_id.clone()),
                    field("Location", payload.location.clone()),
                    field("Track ID", payload.track_id.to_string()),
                    field("Confidence", format!("{:.1}%", payload.avg_confidence * 100.0)),
                ]
            }),
        ];

        let mut evidence = Vec::new();
        if let Some(path) = &payload.snapshot_path {
            evidence.push(format!("Snapshot: `{}`", path.display()));
        }
        if let Some(path) = &payload.video_clip_path {
            evidence.push(format!("Video: `{}`", path.display()));
        }
        if !evidence.is_empty() {
            blocks.push(json!({
                "type": "section",
                "text": {"type": "mrkdwn", "text": format!("*Evidence:*\n{}", evidence.join("\n"))}
            }));
        }
        blocks.push(json!({"type": "divider"}));

        json!({
            "channel": self.config.channel,
            "username": self.config.username,
            "icon_emoji": self.config.icon_emoji,
            "text": payload.title(),
            "blocks": blocks,
            "attachments": [{
                "color": Self::color(payload.avg_confidence),
                "footer": "OVD Watchdog",
                "ts": payload.alerted_at.timestamp(),
            }]
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
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
        let message = self.build_message(payload);
        match self.client.post(&self.config.webhook_url).json(&message).send().await {
            Ok(response) if response.status().is_success() => {
                info!(channel = %self.name, incident_id = %payload.incident_id, "Webhook notification sent");
                true
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(channel = %self.name, %status, body = %body, "Webhook rejected notification");
                false
            }
            Err(e) => {
                warn!(channel = %self.name, error = %e, "Webhook request failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::{Router, http::StatusCode, routing::post};
    use tokio::net::TcpListener;

    use super::*;
    use crate::engine::tests::rule_for;
    use crate::notify::tests::confirmed_incident;

    fn config(url: &str) -> WebhookConfig {
        WebhookConfig {
            settings: ChannelSettings::default(),
            webhook_url: url.to_string(),
            channel: default_channel(),
            username: default_username(),
            icon_emoji: default_icon(),
        }
    }

    fn payload() -> NotificationPayload {
        NotificationPayload::new(&confirmed_incident(), &rule_for("person"), "cam")
    }

    async fn serve(status: StatusCode) -> SocketAddr {
        let app = Router::new().route("/hook", post(move || async move { status }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[test]
    fn test_color_thresholds() {
        assert_eq!(WebhookChannel::color(0.85), "danger");
        assert_eq!(WebhookChannel::color(0.6), "warning");
        assert_eq!(WebhookChannel::color(0.3), "#808080");
    }

    #[test]
    fn test_rejects_non_http_url() {
        assert!(WebhookChannel::new("slack", config("ftp://x")).is_err());
    }

    #[test]
    fn test_message_blocks() {
        let channel = WebhookChannel::new("slack", config("https://hooks.example.com/x")).unwrap();
        let mut payload = payload();
        payload.video_clip_path = Some("inc/clip.gif".into());

        let message = channel.build_message(&payload);
        assert_eq!(message["channel"], "#alerts");
        let blocks = message["blocks"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "header");
        assert_eq!(blocks[1]["fields"].as_array().unwrap().len(), 6);
        assert!(blocks[2]["text"]["text"].as_str().unwrap().contains("inc/clip.gif"));
        assert_eq!(blocks.last().unwrap()["type"], "divider");
    }

    #[tokio::test]
    async fn test_send_success_and_failure_status() {
        let ok = serve(StatusCode::OK).await;
        let channel = WebhookChannel::new("slack", config(&format!("http://{ok}/hook"))).unwrap();
        assert!(channel.send(&payload()).await);

        let bad = serve(StatusCode::INTERNAL_SERVER_ERROR).await;
        let channel = WebhookChannel::new("slack", config(&format!("http://{bad}/hook"))).unwrap();
        assert!(!channel.send(&payload()).await);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_failure() {
        let channel = WebhookChannel::new("slack", config("http://127.0.0.1:9/hook")).unwrap();
        assert!(!channel.send(&payload()).await);
    }
}
