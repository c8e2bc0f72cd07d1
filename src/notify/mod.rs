//! Outbound alert channels.
//!
//! Every channel implements [`NotificationChannel`] and carries its own
//! enable flag and [`RateLimiter`]. Channels are built from one YAML file per
//! channel (see [`load_channels`]) and fanned out to by the
//! [`NotificationDispatcher`].

pub mod console;
pub mod dispatcher;
pub mod email;
pub mod mqtt;
pub mod queue;
pub mod webhook;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::{Incident, TrackId};
use crate::rule::Rule;

pub use console::{ConsoleChannel, ConsoleConfig};
pub use dispatcher::{DeliveryResults, NotificationDispatcher};
pub use email::{EmailChannel, EmailConfig};
pub use mqtt::{MqttChannel, MqttConfig};
pub use queue::{AlertContext, AlertJob, AlertOutcome, AlertQueue};
pub use webhook::{WebhookChannel, WebhookConfig};

/// Name of the channel that receives every alert unless disabled.
pub const ALWAYS_ON_CHANNEL: &str = "console";

/// Channel-agnostic projection of an incident and its rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationPayload {
    pub incident_id: String,
    pub rule_id: String,
    pub rule_description: String,
    pub track_id: TrackId,
    /// Session time of confirmation (first detection if unconfirmed).
    pub confirmed_time: f64,
    /// Wall-clock time the payload was built.
    pub alerted_at: DateTime<Utc>,
    pub snapshot_path: Option<PathBuf>,
    pub video_clip_path: Option<PathBuf>,
    pub avg_confidence: f32,
    pub camera_id: String,
    pub location: String,
    /// Set for cooldown reminders of an already alerted incident.
    pub reminder: bool,
}

impl NotificationPayload {
    pub fn new(incident: &Incident, rule: &Rule, camera_id: &str) -> Self {
        Self {
            incident_id: incident.incident_id.clone(),
            rule_id: rule.rule_id.clone(),
            rule_description: rule.description.clone(),
            track_id: incident.track_id,
            confirmed_time: incident
                .confirmed_time
                .unwrap_or(incident.first_detected_time),
            alerted_at: Utc::now(),
            snapshot_path: incident.evidence.snapshots.first().cloned(),
            video_clip_path: incident.evidence.clip.clone(),
            avg_confidence: incident.average_confidence(),
            camera_id: camera_id.to_string(),
            location: rule.area_id.clone(),
            reminder: incident.notification_count > 0,
        }
    }

    pub fn title(&self) -> String {
        if self.reminder {
            format!("Security Alert (reminder): {}", self.rule_description)
        } else {
            format!("Security Alert: {}", self.rule_description)
        }
    }

    pub(crate) fn alerted_at_display(&self) -> String {
        self.alerted_at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
    }
}

/// Minimum interval between successful sends on one channel.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_sent: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_sent: Mutex::new(None),
        }
    }

    /// Negative and NaN intervals mean no limit; overflowing ones never expire.
    pub fn from_seconds(seconds: f64) -> Self {
        let interval = Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::MAX);
        Self::new(interval)
    }

    pub fn ready(&self) -> bool {
        self.last_sent
            .lock()
            .is_none_or(|last| last.elapsed() >= self.min_interval)
    }

    pub fn mark_sent(&self) {
        *self.last_sent.lock() = Some(Instant::now());
    }

    /// Reserve the next send. The check and the stamp happen under one lock,
    /// so concurrent callers cannot both pass. The slot is released again
    /// unless [`SendSlot::commit`] is called.
    pub fn try_acquire(&self) -> Option<SendSlot<'_>> {
        let mut last_sent = self.last_sent.lock();
        if last_sent.is_some_and(|last| last.elapsed() < self.min_interval) {
            return None;
        }
        let stamped = Instant::now();
        let previous = last_sent.replace(stamped);
        Some(SendSlot {
            limiter: self,
            previous,
            stamped,
            committed: false,
        })
    }

    /// Time left until the next send is allowed.
    pub fn remaining(&self) -> Duration {
        self.last_sent
            .lock()
            .map_or(Duration::ZERO, |last| self.min_interval.saturating_sub(last.elapsed()))
    }
}

/// A reserved send on a [`RateLimiter`].
#[derive(Debug)]
pub struct SendSlot<'a> {
    limiter: &'a RateLimiter,
    previous: Option<Instant>,
    stamped: Instant,
    committed: bool,
}

impl SendSlot<'_> {
    /// Keep the reservation: the send went out.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for SendSlot<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut last_sent = self.limiter.last_sent.lock();
        // A later reservation owns the stamp now
        if *last_sent == Some(self.stamped) {
            *last_sent = self.previous;
        }
    }
}

/// Contract shared by every outbound channel.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool;

    fn rate_limiter(&self) -> &RateLimiter;

    /// Deliver one payload. Failures are reported as `false`, never raised.
    async fn send(&self, payload: &NotificationPayload) -> bool;

    fn can_send(&self) -> bool {
        self.is_enabled() && self.rate_limiter().ready()
    }
}

/// Settings every channel file carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_rate_limit")]
    pub rate_limit_seconds: f64,
}

fn default_enabled() -> bool {
    true
}

fn default_rate_limit() -> f64 {
    60.0
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            rate_limit_seconds: default_rate_limit(),
        }
    }
}

/// One channel file, tagged by `kind`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChannelConfig {
    Console(ConsoleConfig),
    #[serde(alias = "slack")]
    Webhook(WebhookConfig),
    Email(EmailConfig),
    Mqtt(MqttConfig),
}

impl ChannelConfig {
    /// Parse a channel document; a missing `kind` defaults to `default_kind`.
    pub fn from_yaml(text: &str, default_kind: &str) -> Result<Self> {
        let mut doc: serde_yaml::Value = serde_yaml::from_str(text)?;
        if doc.is_null() {
            doc = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
        }
        if let serde_yaml::Value::Mapping(map) = &mut doc {
            let key = serde_yaml::Value::from("kind");
            if !map.contains_key(&key) {
                map.insert(key, serde_yaml::Value::from(default_kind));
            }
        }
        Ok(serde_yaml::from_value(doc)?)
    }

    pub fn rate_limit_seconds(&self) -> f64 {
        match self {
            ChannelConfig::Console(c) => c.rate_limit_seconds,
            ChannelConfig::Webhook(c) => c.settings.rate_limit_seconds,
            ChannelConfig::Email(c) => c.settings.rate_limit_seconds,
            ChannelConfig::Mqtt(c) => c.settings.rate_limit_seconds,
        }
    }

    pub fn build(self, name: &str) -> Result<Arc<dyn NotificationChannel>> {
        let rate_limit = self.rate_limit_seconds();
        if !rate_limit.is_finite() || rate_limit < 0.0 {
            return Err(Error::channel(
                name,
                format!("rate_limit_seconds must be a finite number >= 0, got {rate_limit}"),
            ));
        }
        Ok(match self {
            ChannelConfig::Console(c) => Arc::new(ConsoleChannel::new(name, c)),
            ChannelConfig::Webhook(c) => Arc::new(WebhookChannel::new(name, c)?),
            ChannelConfig::Email(c) => Arc::new(EmailChannel::new(name, c)?),
            ChannelConfig::Mqtt(c) => Arc::new(MqttChannel::new(name, c)?),
        })
    }
}

/// Build every channel described in `dir` (`<name>.yaml` / `<name>.yml`).
///
/// A channel whose file cannot be parsed or built is logged and skipped. A
/// default console channel is added when no console file exists.
pub fn load_channels(dir: &Path) -> Vec<Arc<dyn NotificationChannel>> {
    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();

    let mut files: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
            })
            .collect(),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Channel config directory unreadable");
            Vec::new()
        }
    };
    files.sort();

    for path in files {
        let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        if channels.iter().any(|c| c.name() == name) {
            warn!(channel = %name, path = %path.display(), "Duplicate channel name, skipped");
            continue;
        }
        match load_channel(&path, &name) {
            Ok(channel) => {
                info!(channel = %name, enabled = channel.is_enabled(), "Channel loaded");
                channels.push(channel);
            }
            Err(e) => warn!(channel = %name, error = %e, "Could not load channel"),
        }
    }

    if !channels.iter().any(|c| c.name() == ALWAYS_ON_CHANNEL) {
        info!(channel = ALWAYS_ON_CHANNEL, "Using default console channel");
        channels.push(Arc::new(ConsoleChannel::new(
            ALWAYS_ON_CHANNEL,
            ConsoleConfig::default(),
        )));
    }

    channels
}

fn load_channel(path: &Path, name: &str) -> Result<Arc<dyn NotificationChannel>> {
    let text = fs::read_to_string(path)?;
    ChannelConfig::from_yaml(&text, name)
        .map_err(|e| Error::channel(name, e))?
        .build(name)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::engine::tests::rule_for;
    use tempfile::TempDir;

    /// In-process channel recording every payload it is asked to send.
    pub(crate) struct RecordingChannel {
        pub name: String,
        pub succeed: bool,
        pub limiter: RateLimiter,
        pub sent: Mutex<Vec<NotificationPayload>>,
        pub calls: AtomicUsize,
    }

    impl RecordingChannel {
        pub(crate) fn new(name: &str, succeed: bool) -> Self {
            Self {
                name: name.to_string(),
                succeed,
                limiter: RateLimiter::new(Duration::ZERO),
                sent: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl NotificationChannel for RecordingChannel {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_enabled(&self) -> bool {
            true
        }

        fn rate_limiter(&self) -> &RateLimiter {
            &self.limiter
        }

        async fn send(&self, payload: &NotificationPayload) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sent.lock().push(payload.clone());
            self.succeed
        }
    }

    pub(crate) fn confirmed_incident() -> Incident {
        let mut incident = Incident::new("r_person_1_0".into(), "r_person", 1, 0.0);
        incident.record_observation(0.9, 60, 2.0);
        incident.record_observation(0.7, 61, 2.03);
        incident.promote(2.03);
        incident
    }

    #[test]
    fn test_payload_projection() {
        let rule = rule_for("person");
        let mut incident = confirmed_incident();
        incident.evidence.snapshots.push("a/snapshot.jpg".into());

        let payload = NotificationPayload::new(&incident, &rule, "gate_cam");
        assert_eq!(payload.confirmed_time, 2.03);
        assert!((payload.avg_confidence - 0.8).abs() < 1e-6);
        assert_eq!(payload.snapshot_path, Some(PathBuf::from("a/snapshot.jpg")));
        assert_eq!(payload.camera_id, "gate_cam");
        assert_eq!(payload.location, "default");
        assert!(!payload.reminder);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_interval() {
        let limiter = RateLimiter::from_seconds(60.0);
        assert!(limiter.ready());

        limiter.mark_sent();
        assert!(!limiter.ready());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!limiter.ready());
        assert_eq!(limiter.remaining(), Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.ready());
    }

    #[test]
    fn test_channel_kind_defaults_to_stem() {
        let config = ChannelConfig::from_yaml("enabled: false\nverbose: false\n", "console").unwrap();
        match config {
            ChannelConfig::Console(c) => {
                assert!(!c.enabled);
                assert!(!c.verbose);
            }
            other => panic!("unexpected {other:?}"),
        }

        let config = ChannelConfig::from_yaml(
            "webhook_url: https://hooks.example.com/x\nrate_limit_seconds: 5\n",
            "slack",
        )
        .unwrap();
        assert!(matches!(config, ChannelConfig::Webhook(ref c) if c.settings.rate_limit_seconds == 5.0));
    }

    #[test]
    fn test_console_file_without_rate_limit_is_unthrottled() {
        let config = ChannelConfig::from_yaml("verbose: false\n", "console").unwrap();
        assert_eq!(config.rate_limit_seconds(), 0.0);

        let console = config.build("console").unwrap();
        assert!(console.rate_limiter().try_acquire().map(SendSlot::commit).is_some());
        assert!(console.can_send());
        assert!(console.rate_limiter().try_acquire().is_some());
    }

    #[test]
    fn test_non_finite_rate_limit_rejected() {
        let config = ChannelConfig::from_yaml(
            "webhook_url: https://hooks.example.com/x\nrate_limit_seconds: .inf\n",
            "slack",
        )
        .unwrap();
        assert!(config.build("slack").is_err());

        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("console.yaml"), "rate_limit_seconds: .nan\n").unwrap();
        let channels = load_channels(dir.path());
        // Bad file skipped, default console still present and unthrottled
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].rate_limiter().remaining(), Duration::ZERO);
    }

    #[test]
    fn test_rate_limiter_from_huge_seconds() {
        let limiter = RateLimiter::from_seconds(f64::INFINITY);
        limiter.mark_sent();
        assert!(!limiter.ready());
        assert!(RateLimiter::from_seconds(f64::NAN).try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_slot_commit_and_release() {
        let limiter = RateLimiter::from_seconds(60.0);

        let slot = limiter.try_acquire().unwrap();
        assert!(limiter.try_acquire().is_none());
        drop(slot);
        assert!(limiter.ready());

        limiter.try_acquire().unwrap().commit();
        assert!(limiter.try_acquire().is_none());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.try_acquire().is_some());
    }

    #[test]
    fn test_load_channels_from_directory() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("ops_hook.yaml"),
            "kind: webhook\nwebhook_url: https://hooks.example.com/x\n",
        )
        .unwrap();
        // Missing required field: skipped
        fs::write(dir.path().join("mqtt.yaml"), "topic: ovd/alerts\n").unwrap();
        fs::write(dir.path().join("broken.yaml"), "kind: pager\n").unwrap();

        let channels = load_channels(dir.path());
        let mut names: Vec<_> = channels.iter().map(|c| c.name().to_string()).collect();
        names.sort();
        assert_eq!(names, vec!["console", "ops_hook"]);
    }

    #[test]
    fn test_missing_directory_still_has_console() {
        let channels = load_channels(Path::new("/nonexistent/ovd/channels"));
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name(), ALWAYS_ON_CHANNEL);
    }
}
