//! Terminal/log channel. Always available, used as the always-on sink.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{NotificationChannel, NotificationPayload, RateLimiter};

const RED: &str = "\x1b[91m";
const YELLOW: &str = "\x1b[93m";
const GREEN: &str = "\x1b[92m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Unthrottled unless a file sets it.
    #[serde(default)]
    pub rate_limit_seconds: f64,

    /// Include evidence paths in the banner.
    #[serde(default = "default_true")]
    pub verbose: bool,

    #[serde(default = "default_true")]
    pub color_output: bool,

    /// Print a banner to stdout in addition to the log event.
    #[serde(default = "default_true")]
    pub banner: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_limit_seconds: 0.0,
            verbose: true,
            color_output: true,
            banner: true,
        }
    }
}

pub struct ConsoleChannel {
    name: String,
    config: ConsoleConfig,
    limiter: RateLimiter,
}

impl ConsoleChannel {
    pub fn new(name: &str, config: ConsoleConfig) -> Self {
        Self {
            name: name.to_string(),
            limiter: RateLimiter::from_seconds(config.rate_limit_seconds),
            config,
        }
    }

    /// Human-readable alert block.
    pub fn render(&self, payload: &NotificationPayload) -> String {
        let (red, yellow, green, bold, reset) = if self.config.color_output {
            (RED, YELLOW, GREEN, BOLD, RESET)
        } else {
            ("", "", "", "", "")
        };

        let percent = payload.avg_confidence * 100.0;
        let confidence_color = if percent >= 80.0 {
            red
        } else if percent >= 60.0 {
            yellow
        } else {
            green
        };
        let rule = "=".repeat(70);

        let mut out = format!(
            "\n{red}{bold}{rule}\n{title}\n{rule}{reset}\n\
             {bold}Rule:{reset} {desc}\n\
             {bold}Incident ID:{reset} {id}\n\
             {bold}Time:{reset} {time} (t={t:.2}s)\n\
             {bold}Camera:{reset} {camera}\n\
             {bold}Location:{reset} {location}\n\
             {bold}Track ID:{reset} {track}\n\
             {bold}Confidence:{reset} {confidence_color}{percent:.1}%{reset}\n",
            title = payload.title().to_uppercase(),
            desc = payload.rule_description,
            id = payload.incident_id,
            time = payload.alerted_at_display(),
            t = payload.confirmed_time,
            camera = payload.camera_id,
            location = payload.location,
            track = payload.track_id,
        );

        if self.config.verbose {
            let show = |p: &Option<std::path::PathBuf>| {
                p.as_ref()
                    .map_or_else(|| "N/A".to_string(), |p| p.display().to_string())
            };
            out.push_str(&format!(
                "{bold}Snapshot:{reset} {}\n{bold}Video:{reset} {}\n",
                show(&payload.snapshot_path),
                show(&payload.video_clip_path),
            ));
        }
        out.push_str(&format!("{red}{rule}{reset}\n"));
        out
    }
}

#[async_trait]
impl NotificationChannel for ConsoleChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    async fn send(&self, payload: &NotificationPayload) -> bool {
        warn!(
            channel = %self.name,
            incident_id = %payload.incident_id,
            rule_id = %payload.rule_id,
            track_id = payload.track_id,
            confidence = payload.avg_confidence,
            reminder = payload.reminder,
            "SECURITY ALERT: {}",
            payload.rule_description
        );
        if self.config.banner {
            println!("{}", self.render(payload));
        }
        true
    }
}
