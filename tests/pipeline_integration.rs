//! End-to-end run of the frame loop: scripted frames and tracks in, evidence
//! on disk, journal rows and delivered alerts out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::watch;

use ovd_watchdog::engine::{Classifier, EngineConfig, RuleEngine};
use ovd_watchdog::error::{Error, Result};
use ovd_watchdog::model::{BoundingBox, Detection, IncidentState, Track, TrackState};
use ovd_watchdog::notify::{
    AlertContext, NotificationChannel, NotificationDispatcher, NotificationPayload, RateLimiter,
};
use ovd_watchdog::pipeline::{Detector, FrameSource, Pipeline, PipelineSettings, RunSummary, Tracker};
use ovd_watchdog::record::IncidentRecorder;
use ovd_watchdog::rule::Rule;
use ovd_watchdog::storage::Storage;

const FPS: f64 = 10.0;

struct BlankFrames {
    remaining: u64,
}

impl FrameSource for BlankFrames {
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        Ok(Some(RgbImage::new(16, 16)))
    }

    fn fps(&self) -> f64 {
        FPS
    }
}

struct NoDetections;

impl Detector for NoDetections {
    fn detect(&mut self, _frame: &RgbImage, _prompts: &[String], _frame_id: u64) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}

/// Delivers one confirmed person while `frame_id < until`, failing on the
/// frames listed in `fail_on`.
struct ScriptedTracker {
    until: u64,
    fail_on: Vec<u64>,
}

impl Tracker for ScriptedTracker {
    fn update(&mut self, _detections: &[Detection], frame_id: u64, _timestamp: f64) -> Result<Vec<Track>> {
        if self.fail_on.contains(&frame_id) {
            return Err(Error::Config("tracker hiccup".to_string()));
        }
        if frame_id >= self.until {
            return Ok(Vec::new());
        }
        let bbox = BoundingBox::new(2.0, 2.0, 12.0, 14.0);
        Ok(vec![Track {
            track_id: 7,
            bbox,
            confidence: 0.9,
            class_name: "person".to_string(),
            state: TrackState::Confirmed,
            detection_history: vec![Detection {
                bbox,
                confidence: 0.9,
                class_name: "person".to_string(),
                prompt_used: "person".to_string(),
                frame_id,
            }],
        }])
    }
}

struct Pager {
    limiter: RateLimiter,
    sent: Mutex<Vec<NotificationPayload>>,
}

impl Pager {
    fn new() -> Self {
        Self {
            limiter: RateLimiter::new(Duration::ZERO),
            sent: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl NotificationChannel for Pager {
    fn name(&self) -> &str {
        "pager"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    async fn send(&self, payload: &NotificationPayload) -> bool {
        self.sent.lock().push(payload.clone());
        true
    }
}

fn loiter_rule(cooldown_seconds: f64) -> Rule {
    let document = json!({
        "rule_id": "loiter",
        "description": "Person lingering at the gate",
        "detection": {"prompt": "person"},
        "conditions": {"dwell_seconds": 2.0, "min_confidence": 0.5, "min_frames": 3},
        "actions": {
            "cooldown_seconds": cooldown_seconds,
            "record_pre_seconds": 1.0,
            "record_post_seconds": 1.0,
            "notify_channels": ["pager"]
        }
    });
    Rule::from_json(&document.to_string(), "test").unwrap()
}

struct Session {
    summary: RunSummary,
    pager: Arc<Pager>,
    storage: Storage,
    dir: TempDir,
}

async fn run_session(
    frames: u64,
    tracker: ScriptedTracker,
    rule: Rule,
    resolve_after_seconds: Option<f64>,
) -> Session {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new("sqlite::memory:").await.unwrap();
    let pager = Arc::new(Pager::new());
    let channels: Vec<Arc<dyn NotificationChannel>> = vec![pager.clone()];

    let alerts = AlertContext {
        recorder: IncidentRecorder::new(dir.path()),
        dispatcher: Arc::new(NotificationDispatcher::new(channels, Duration::from_secs(5))),
        storage: Some(storage.clone()),
        camera_id: "gate_cam".to_string(),
    };
    let settings = PipelineSettings {
        detection_interval: 5,
        alert_workers: 1,
        shutdown_grace: Duration::from_secs(10),
        ..PipelineSettings::default()
    };
    let (pipeline, _commands) = Pipeline::new(
        BlankFrames { remaining: frames },
        NoDetections,
        tracker,
        RuleEngine::new(vec![rule], EngineConfig { resolve_after_seconds }),
        Classifier::default(),
        alerts,
        settings,
    );

    let (_shutdown_tx, shutdown) = watch::channel(false);
    let summary = pipeline.run(shutdown).await;
    Session {
        summary,
        pager,
        storage,
        dir,
    }
}

#[tokio::test]
async fn test_confirmed_incident_is_recorded_alerted_and_resolved() {
    let tracker = ScriptedTracker {
        until: 50,
        fail_on: Vec::new(),
    };
    let session = run_session(90, tracker, loiter_rule(60.0), Some(1.0)).await;

    assert_eq!(session.summary.frames, 90);
    assert_eq!(session.summary.incidents, 1);
    assert_eq!(session.summary.confirmed, 1);
    assert_eq!(session.summary.alerts_submitted, 1);

    // One alert, carrying the evidence written just before it
    let sent = session.pager.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].incident_id, "loiter_7_0");
    assert_eq!(sent[0].camera_id, "gate_cam");
    assert!(!sent[0].reminder);
    let snapshot = sent[0].snapshot_path.clone().unwrap();
    assert!(snapshot.exists());
    assert!(sent[0].video_clip_path.as_ref().unwrap().exists());

    let incident_dir = session.dir.path().join("loiter_7_0");
    assert!(incident_dir.join("metadata.json").exists());

    // Journal reflects the final state, evidence and delivery log
    let stored = session.storage.get_incident("loiter_7_0").await.unwrap().unwrap();
    assert_eq!(stored.state, IncidentState::Resolved);
    assert_eq!(stored.evidence.snapshots, vec![snapshot]);
    assert_eq!(stored.notification_count, 1);

    let log = session.storage.notifications_for("loiter_7_0").await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].channel, "pager");
    assert!(log[0].success);
}

#[tokio::test]
async fn test_reminders_follow_cooldown() {
    let tracker = ScriptedTracker {
        until: u64::MAX,
        fail_on: Vec::new(),
    };
    let session = run_session(110, tracker, loiter_rule(2.0), None).await;

    let sent = session.pager.sent.lock().clone();
    // First alert around 3.1s, reminders every 2s after that
    assert!(sent.len() >= 3, "expected reminders, got {}", sent.len());
    assert!(!sent[0].reminder);
    assert!(sent[1..].iter().all(|p| p.reminder));
    assert!(sent.iter().all(|p| p.incident_id == "loiter_7_0"));

    let stored = session.storage.get_incident("loiter_7_0").await.unwrap().unwrap();
    assert_eq!(stored.state, IncidentState::Confirmed);
    assert_eq!(stored.notification_count as usize, sent.len());
}

#[tokio::test]
async fn test_tracker_failure_resets_dwell_without_stopping() {
    // A failed update delivers no tracks, which breaks the dwell window
    let tracker = ScriptedTracker {
        until: u64::MAX,
        fail_on: vec![10],
    };
    let session = run_session(25, tracker, loiter_rule(60.0), None).await;

    assert_eq!(session.summary.frames, 25);
    // Window restarted at 1.1s, so 2.0s of dwell is not reached by frame 24
    assert_eq!(session.summary.incidents, 0);
    assert!(session.pager.sent.lock().is_empty());
}
