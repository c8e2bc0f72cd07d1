//! Process configuration from `OVD_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Upper bound for `OVD_BUFFER_EXTRA_SECONDS`.
const MAX_BUFFER_EXTRA_SECONDS: f64 = 3600.0;

#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogConfig {
    pub port: u16,
    pub database_url: String,
    /// Rule file or directory of rule files.
    pub rules_path: PathBuf,
    pub channels_dir: PathBuf,
    pub incident_dir: PathBuf,
    pub input_dir: PathBuf,
    pub track_log: PathBuf,
    pub fps: f64,
    /// Run the detector every N frames.
    pub detection_interval: u64,
    /// Seconds kept in the ring buffer beyond the longest pre+post window.
    pub buffer_extra_seconds: f64,
    pub buffer_max_mb: usize,
    pub alert_workers: usize,
    pub alert_queue: usize,
    pub send_timeout: Duration,
    /// `None` disables automatic resolution.
    pub resolve_after_seconds: Option<f64>,
    pub camera_id: String,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            database_url: "sqlite:watchdog.db?mode=rwc".to_string(),
            rules_path: PathBuf::from("configs/rules"),
            channels_dir: PathBuf::from("configs/notifications"),
            incident_dir: PathBuf::from("data/incidents"),
            input_dir: PathBuf::from("data/frames"),
            track_log: PathBuf::from("data/tracks.jsonl"),
            fps: 30.0,
            detection_interval: 30,
            buffer_extra_seconds: 10.0,
            buffer_max_mb: 500,
            alert_workers: 2,
            alert_queue: 64,
            send_timeout: Duration::from_secs(10),
            resolve_after_seconds: Some(30.0),
            camera_id: "camera_1".to_string(),
        }
    }
}

impl WatchdogConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Unset variables keep their
    /// default; set but unparsable ones are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let string = |key: &str, default: String| lookup(key).unwrap_or(default);
        let path = |key: &str, default: PathBuf| lookup(key).map(PathBuf::from).unwrap_or(default);

        let fps: f64 = parse(&lookup, "OVD_FPS", defaults.fps)?;
        if !(fps.is_finite() && fps > 0.0) {
            return Err(Error::Config(format!("OVD_FPS must be positive, got {fps}")));
        }
        let detection_interval: u64 = parse(&lookup, "OVD_DETECTION_INTERVAL", defaults.detection_interval)?;
        let send_timeout_secs: u64 = parse(&lookup, "OVD_SEND_TIMEOUT_SECS", defaults.send_timeout.as_secs())?;
        let resolve_after: f64 = parse(&lookup, "OVD_RESOLVE_AFTER_SECS", 30.0)?;
        let buffer_extra_seconds: f64 =
            parse(&lookup, "OVD_BUFFER_EXTRA_SECONDS", defaults.buffer_extra_seconds)?;
        if !(0.0..=MAX_BUFFER_EXTRA_SECONDS).contains(&buffer_extra_seconds) {
            return Err(Error::Config(format!(
                "OVD_BUFFER_EXTRA_SECONDS must be between 0 and {MAX_BUFFER_EXTRA_SECONDS}, got {buffer_extra_seconds}"
            )));
        }

        Ok(Self {
            port: parse(&lookup, "OVD_PORT", defaults.port)?,
            database_url: string("OVD_DATABASE_URL", defaults.database_url),
            rules_path: path("OVD_RULES", defaults.rules_path),
            channels_dir: path("OVD_CHANNELS_DIR", defaults.channels_dir),
            incident_dir: path("OVD_INCIDENT_DIR", defaults.incident_dir),
            input_dir: path("OVD_INPUT_DIR", defaults.input_dir),
            track_log: path("OVD_TRACK_LOG", defaults.track_log),
            fps,
            detection_interval: detection_interval.max(1),
            buffer_extra_seconds,
            buffer_max_mb: parse(&lookup, "OVD_BUFFER_MAX_MB", defaults.buffer_max_mb)?,
            alert_workers: parse(&lookup, "OVD_ALERT_WORKERS", defaults.alert_workers)?,
            alert_queue: parse(&lookup, "OVD_ALERT_QUEUE", defaults.alert_queue)?,
            send_timeout: Duration::from_secs(send_timeout_secs),
            resolve_after_seconds: (resolve_after > 0.0).then_some(resolve_after),
            camera_id: string("OVD_CAMERA_ID", defaults.camera_id),
        })
    }

    pub fn buffer_max_bytes(&self) -> usize {
        self.buffer_max_mb.saturating_mul(1024 * 1024)
    }
}

fn parse<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}"))),
        None => Ok(default),
    }
}
