//! SMTP email channel (STARTTLS, multipart plain/HTML, snapshot attached).

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{ChannelSettings, NotificationChannel, NotificationPayload, RateLimiter};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(flatten)]
    pub settings: ChannelSettings,

    pub smtp_server: String,

    #[serde(default = "default_port")]
    pub smtp_port: u16,

    pub username: String,

    pub password: String,

    /// Defaults to `username`.
    #[serde(default)]
    pub from_email: Option<String>,

    pub to_emails: Vec<String>,
}

fn default_port() -> u16 {
    587
}

pub struct EmailChannel {
    name: String,
    enabled: bool,
    from: Mailbox,
    to: Vec<Mailbox>,
    transport: AsyncSmtpTransport<Tokio1Executor>,
    limiter: RateLimiter,
}

impl EmailChannel {
    pub fn new(name: &str, config: EmailConfig) -> Result<Self> {
        if config.smtp_server.trim().is_empty() {
            return Err(Error::channel(name, "smtp_server is required"));
        }
        if config.to_emails.is_empty() {
            return Err(Error::channel(name, "to_emails must list at least one recipient"));
        }

        let from: Mailbox = config
            .from_email
            .as_deref()
            .unwrap_or(&config.username)
            .parse()
            .map_err(|e| Error::channel(name, format!("invalid sender: {e}")))?;
        let to = config
            .to_emails
            .iter()
            .map(|addr| {
                addr.parse::<Mailbox>()
                    .map_err(|e| Error::channel(name, format!("invalid recipient '{addr}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_server)
            .map_err(|e| Error::channel(name, e))?
            .port(config.smtp_port)
            .credentials(Credentials::new(config.username.clone(), config.password.clone()))
            .build();

        Ok(Self {
            name: name.to_string(),
            enabled: config.settings.enabled,
            from,
            to,
            transport,
            limiter: RateLimiter::from_seconds(config.settings.rate_limit_seconds),
        })
    }

    fn evidence_line(path: &Option<std::path::PathBuf>) -> String {
        path.as_ref()
            .map_or_else(|| "N/A".to_string(), |p| p.display().to_string())
    }

    pub fn text_body(payload: &NotificationPayload) -> String {
        format!(
            "{title}\n\n\
             Incident Details:\n\
             - Incident ID: {id}\n\
             - Time: {time}\n\
             - Camera: {camera}\n\
             - Location: {location}\n\
             - Track ID: {track}\n\
             - Confidence: {confidence:.1}%\n\n\
             Evidence:\n\
             - Snapshot: {snapshot}\n\
             - Video: {video}\n\n\
             ---\nOVD Watchdog\n",
            title = payload.title(),
            id = payload.incident_id,
            time = payload.alerted_at_display(),
            camera = payload.camera_id,
            location = payload.location,
            track = payload.track_id,
            confidence = payload.avg_confidence * 100.0,
            snapshot = Self::evidence_line(&payload.snapshot_path),
            video = Self::evidence_line(&payload.video_clip_path),
        )
    }

    pub fn html_body(payload: &NotificationPayload) -> String {
        let row = |label: &str, value: &str| {
            format!("<tr><td class=\"label\">{label}:</td><td>{}</td></tr>", escape(value))
        };
        let rows = [
            row("Incident ID", &payload.incident_id),
            row("Time", &payload.alerted_at_display()),
            row("Camera", &payload.camera_id),
            row("Location", &payload.location),
            row("Track ID", &payload.track_id.to_string()),
            row("Confidence", &format!("{:.1}%", payload.avg_confidence * 100.0)),
        ]
        .concat();

        format!(
            "<html><head><style>\
             body {{ font-family: Arial, sans-serif; }}\
             .header {{ background-color: #dc3545; color: white; padding: 20px; }}\
             .label {{ font-weight: bold; width: 150px; }}\
             </style></head><body>\
             <div class=\"header\"><h2>{title}</h2></div>\
             <h3>Incident Details</h3><table>{rows}</table>\
             <h3>Evidence</h3><p>Snapshot: <code>{snapshot}</code><br>Video: <code>{video}</code></p>\
             <p>OVD Watchdog</p></body></html>",
            title = escape(&payload.title()),
            snapshot = escape(&Self::evidence_line(&payload.snapshot_path)),
            video = escape(&Self::evidence_line(&payload.video_clip_path)),
        )
    }

    async fn build_message(&self, payload: &NotificationPayload) -> Result<Message> {
        let mut body = MultiPart::mixed().multipart(MultiPart::alternative_plain_html(
            Self::text_body(payload),
            Self::html_body(payload),
        ));

        if let Some(path) = &payload.snapshot_path {
            match tokio::fs::read(path).await {
                Ok(bytes) => {
                    let filename = path
                        .file_name()
                        .map_or_else(|| "snapshot.jpg".to_string(), |n| n.to_string_lossy().into_owned());
                    let content_type = ContentType::parse("image/jpeg")
                        .map_err(|e| Error::channel(&self.name, e))?;
                    body = body.singlepart(Attachment::new(filename).body(bytes, content_type));
                }
                Err(e) => warn!(channel = %self.name, error = %e, "Could not attach snapshot"),
            }
        }

        let builder = self
            .to
            .iter()
            .cloned()
            .fold(Message::builder().from(self.from.clone()), |b, to| b.to(to))
            .subject(payload.title());
        builder.multipart(body).map_err(|e| Error::channel(&self.name, e))
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    async fn send(&self, payload: &NotificationPayload) -> bool {
        let message = match self.build_message(payload).await {
            Ok(message) => message,
            Err(e) => {
                warn!(channel = %self.name, error = %e, "Could not build email");
                return false;
            }
        };

        match self.transport.send(message).await {
            Ok(response) if response.is_positive() => {
                info!(
                    channel = %self.name,
                    incident_id = %payload.incident_id,
                    recipients = self.to.len(),
                    "Email notification sent"
                );
                true
            }
            Ok(response) => {
                warn!(channel = %self.name, code = %response.code(), "SMTP server rejected email");
                false
            }
            Err(e) => {
                warn!(channel = %self.name, error = %e, "Email notification failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::rule_for;
    use crate::notify::tests::confirmed_incident;

    fn config() -> EmailConfig {
        EmailConfig {
            settings: ChannelSettings::default(),
            smtp_server: "smtp.example.com".to_string(),
            smtp_port: 587,
            username: "alerts@example.com".to_string(),
            password: "secret".to_string(),
            from_email: None,
            to_emails: vec!["ops@example.com".to_string()],
        }
    }

    #[tokio::test]
    async fn test_builds_from_config() {
        let channel = EmailChannel::new("email", config()).unwrap();
        assert_eq!(channel.from.email.to_string(), "alerts@example.com");
        assert_eq!(channel.to.len(), 1);
    }

    #[test]
    fn test_invalid_recipient_rejected() {
        let mut config = config();
        config.to_emails = vec!["not an address".to_string()];
        assert!(EmailChannel::new("email", config).is_err());
    }

    #[test]
    fn test_no_recipients_rejected() {
        let mut config = config();
        config.to_emails.clear();
        assert!(EmailChannel::new("email", config).is_err());
    }

    #[test]
    fn test_bodies_escape_and_include_details() {
        let mut rule = rule_for("person");
        rule.description = "Person <near> gate".to_string();
        let payload = NotificationPayload::new(&confirmed_incident(), &rule, "cam");

        let text = EmailChannel::text_body(&payload);
        assert!(text.contains("- Incident ID: r_person_1_0"));
        assert!(text.contains("- Snapshot: N/A"));

        let html = EmailChannel::html_body(&payload);
        assert!(html.contains("Person &lt;near&gt; gate"));
        assert!(!html.contains("<near>"));
    }

    #[tokio::test]
    async fn test_message_attaches_existing_snapshot() {
        let dir = tempfile::TempDir::new().unwrap();
        let snapshot = dir.path().join("snapshot.jpg");
        std::fs::write(&snapshot, b"\xff\xd8\xff\xd9").unwrap();

        let mut incident = confirmed_incident();
        incident.evidence.snapshots.push(snapshot);
        let payload = NotificationPayload::new(&incident, &rule_for("person"), "cam");

        let channel = EmailChannel::new("email", config()).unwrap();
        let message = channel.build_message(&payload).await.unwrap();
        let raw = String::from_utf8_lossy(&message.formatted()).into_owned();
        assert!(raw.contains("filename=\"snapshot.jpg\""));
        assert!(raw.contains("image/jpeg"));
    }
}
