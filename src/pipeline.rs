//! The monitoring frame loop.
//!
//! One task owns the rule engine, classifier and ring buffer. Per frame it
//! buffers the image, runs detection on a fixed cadence, tracks, enriches,
//! evaluates rules, journals transitions and hands alert work to the
//! [`AlertQueue`]. Nothing on this path waits on a notification channel.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use image::RgbImage;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::api::OperatorCommand;
use crate::config::WatchdogConfig;
use crate::engine::{Classifier, IncidentUpdate, RuleEngine, Transition};
use crate::error::Result;
use crate::model::{Detection, Incident, IncidentState, Track};
use crate::notify::{AlertContext, AlertJob, AlertOutcome, AlertQueue};
use crate::record::{IncidentRecorder, RingBuffer};
use crate::storage::Storage;

/// Supplier of decoded frames.
pub trait FrameSource: Send {
    /// `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;

    fn fps(&self) -> f64;

    fn release(&mut self) {}
}

/// Open-vocabulary detector run with the rules' prompts.
pub trait Detector: Send {
    fn detect(&mut self, frame: &RgbImage, prompts: &[String], frame_id: u64) -> Result<Vec<Detection>>;
}

/// Multi-object tracker.
pub trait Tracker: Send {
    fn update(&mut self, detections: &[Detection], frame_id: u64, timestamp: f64) -> Result<Vec<Track>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// Run the detector every N frames.
    pub detection_interval: u64,
    pub buffer_extra_seconds: f64,
    pub buffer_max_bytes: usize,
    pub alert_workers: usize,
    pub alert_queue: usize,
    pub command_capacity: usize,
    /// How long alert workers may keep draining after the loop stops.
    pub shutdown_grace: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            detection_interval: 30,
            buffer_extra_seconds: 10.0,
            buffer_max_bytes: 500 * 1024 * 1024,
            alert_workers: 2,
            alert_queue: 64,
            command_capacity: 32,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl From<&WatchdogConfig> for PipelineSettings {
    fn from(config: &WatchdogConfig) -> Self {
        Self {
            detection_interval: config.detection_interval,
            buffer_extra_seconds: config.buffer_extra_seconds,
            buffer_max_bytes: config.buffer_max_bytes(),
            alert_workers: config.alert_workers,
            alert_queue: config.alert_queue,
            shutdown_grace: config.send_timeout * 3,
            ..Self::default()
        }
    }
}

/// Counters reported when the loop ends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub frames: u64,
    pub incidents: usize,
    pub confirmed: usize,
    pub alerts_submitted: usize,
    pub alerts_dropped: u64,
}

/// First-confirmation capture waiting for its post-roll to be buffered.
#[derive(Debug, Clone, PartialEq)]
struct PendingCapture {
    incident_id: String,
    due: f64,
}

pub struct Pipeline<S, D, T> {
    source: S,
    detector: D,
    tracker: T,
    engine: RuleEngine,
    classifier: Classifier,
    buffer: RingBuffer,
    recorder: IncidentRecorder,
    storage: Option<Storage>,
    queue: AlertQueue,
    commands: mpsc::Receiver<OperatorCommand>,
    outcomes: mpsc::UnboundedReceiver<AlertOutcome>,
    settings: PipelineSettings,
    fps: f64,
    prompts: Vec<String>,
    cached_detections: Vec<Detection>,
    pending: Vec<PendingCapture>,
    alerted: HashSet<String>,
    next_frame_id: u64,
    last_timestamp: f64,
    alerts_submitted: usize,
}

impl<S: FrameSource, D: Detector, T: Tracker> Pipeline<S, D, T> {
    /// Assemble the loop and start the alert workers. Returns the sender
    /// operator commands are submitted through.
    pub fn new(
        source: S,
        detector: D,
        tracker: T,
        engine: RuleEngine,
        classifier: Classifier,
        alerts: AlertContext,
        settings: PipelineSettings,
    ) -> (Self, mpsc::Sender<OperatorCommand>) {
        let fps = source.fps();
        let longest_window = engine
            .rules()
            .iter()
            .map(|r| r.actions.record_pre_seconds + r.actions.record_post_seconds)
            .fold(0.0, f64::max);
        let buffer = RingBuffer::new(
            longest_window + settings.buffer_extra_seconds,
            fps,
            settings.buffer_max_bytes,
        );

        let (command_tx, commands) = mpsc::channel(settings.command_capacity.max(1));
        let (outcome_tx, outcomes) = mpsc::unbounded_channel();
        let recorder = alerts.recorder.clone();
        let storage = alerts.storage.clone();
        let queue = AlertQueue::start(settings.alert_queue, settings.alert_workers, alerts, outcome_tx);
        let prompts = engine.prompts();

        info!(
            rules = engine.rules().len(),
            fps,
            buffer_seconds = longest_window + settings.buffer_extra_seconds,
            detection_interval = settings.detection_interval,
            "Pipeline ready"
        );

        let pipeline = Self {
            source,
            detector,
            tracker,
            engine,
            classifier,
            buffer,
            recorder,
            storage,
            queue,
            commands,
            outcomes,
            settings,
            fps,
            prompts,
            cached_detections: Vec::new(),
            pending: Vec::new(),
            alerted: HashSet::new(),
            next_frame_id: 0,
            last_timestamp: 0.0,
            alerts_submitted: 0,
        };
        (pipeline, command_tx)
    }

    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }

    /// Run until the source is exhausted or `shutdown` flips to `true`.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> RunSummary {
        loop {
            if *shutdown.borrow() {
                info!(frame_id = self.next_frame_id, "Shutdown requested");
                break;
            }
            self.drain_commands().await;
            self.drain_outcomes().await;

            let frame = match self.source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!(frames = self.next_frame_id, "Frame source exhausted");
                    break;
                }
                Err(e) => {
                    error!(frame_id = self.next_frame_id, error = %e, "Frame source failed");
                    break;
                }
            };
            self.process_frame(&frame).await;
            tokio::task::yield_now().await;
        }
        self.finish().await
    }

    async fn process_frame(&mut self, frame: &RgbImage) {
        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;
        let timestamp = frame_id as f64 / self.fps;
        self.last_timestamp = timestamp;

        self.buffer.push(frame, timestamp, frame_id);

        if frame_id % self.settings.detection_interval.max(1) == 0 {
            match self.detector.detect(frame, &self.prompts, frame_id) {
                Ok(detections) => {
                    debug!(frame_id, count = detections.len(), "Detection cycle");
                    self.cached_detections = detections;
                }
                Err(e) => {
                    warn!(frame_id, error = %e, "Detector failed, continuing without detections");
                    self.cached_detections.clear();
                }
            }
        }

        let mut tracks = match self.tracker.update(&self.cached_detections, frame_id, timestamp) {
            Ok(tracks) => tracks,
            Err(e) => {
                warn!(frame_id, error = %e, "Tracker failed, continuing without tracks");
                Vec::new()
            }
        };

        self.classifier.enrich(&mut tracks);
        let updates = self.engine.evaluate(&tracks, frame_id, timestamp);
        self.apply_updates(&updates, timestamp).await;

        self.submit_due_captures(timestamp, false).await;
        self.submit_reminders(timestamp).await;
    }

    async fn apply_updates(&mut self, updates: &[IncidentUpdate], timestamp: f64) {
        for update in updates {
            match update.transition {
                Transition::Updated => continue,
                Transition::Promoted => {
                    if let Some(rule) = self
                        .engine
                        .incident(&update.incident_id)
                        .and_then(|i| self.engine.rule(&i.rule_id))
                    {
                        self.pending.push(PendingCapture {
                            incident_id: update.incident_id.clone(),
                            due: timestamp + rule.actions.record_post_seconds,
                        });
                    }
                }
                Transition::Resolved => {
                    self.alerted.remove(&update.incident_id);
                }
                Transition::Created => {}
            }
            self.persist(&update.incident_id).await;
        }
    }

    /// Submit captures whose post-roll is buffered (or all, when flushing).
    async fn submit_due_captures(&mut self, now: f64, flush: bool) {
        if self.pending.is_empty() {
            return;
        }
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| flush || p.due <= now);
        self.pending = waiting;

        for capture in due {
            let Some(incident) = self.engine.incident(&capture.incident_id).cloned() else {
                continue;
            };
            let Some(rule) = self.engine.rule(&incident.rule_id).map(Arc::clone) else {
                continue;
            };

            let is_open = incident.is_open();
            let frames = self.recorder.capture(&self.buffer, &incident, &rule, now);
            info!(
                incident_id = %incident.incident_id,
                clip_frames = frames.clip.len(),
                flush,
                "Scheduling evidence and alert"
            );
            self.queue.submit(AlertJob::Capture {
                incident,
                rule,
                frames,
            });
            self.alerts_submitted += 1;
            // Resolved while waiting: first alert only, no reminders
            if is_open {
                self.alerted.insert(capture.incident_id.clone());
            }
            if let Err(e) = self.engine.mark_notified(&capture.incident_id, now) {
                warn!(incident_id = %capture.incident_id, error = %e, "Could not mark incident notified");
            }
            self.persist(&capture.incident_id).await;
        }
    }

    /// Cooldown reminders for incidents that already had their first alert.
    async fn submit_reminders(&mut self, now: f64) {
        let due: Vec<String> = self
            .alerted
            .iter()
            .filter(|id| self.engine.should_notify(id, now))
            .cloned()
            .collect();

        for incident_id in due {
            let Some(incident) = self.engine.incident(&incident_id).cloned() else {
                continue;
            };
            let Some(rule) = self.engine.rule(&incident.rule_id).map(Arc::clone) else {
                continue;
            };
            debug!(incident_id = %incident_id, count = incident.notification_count, "Reminder due");
            self.queue.submit(AlertJob::Remind { incident, rule });
            self.alerts_submitted += 1;
            if let Err(e) = self.engine.mark_notified(&incident_id, now) {
                warn!(incident_id = %incident_id, error = %e, "Could not mark incident notified");
            }
            self.persist(&incident_id).await;
        }
    }

    async fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                OperatorCommand::Resolve { incident_id } => {
                    match self.engine.resolve(&incident_id, self.last_timestamp) {
                        Ok(incident) => {
                            info!(incident_id = %incident_id, state = incident.state.as_str(), "Operator resolution applied");
                            self.alerted.remove(&incident_id);
                            self.persist(&incident_id).await;
                        }
                        Err(e) => warn!(incident_id = %incident_id, error = %e, "Operator resolution rejected"),
                    }
                }
            }
        }
    }

    async fn drain_outcomes(&mut self) {
        while let Ok(outcome) = self.outcomes.try_recv() {
            match outcome {
                AlertOutcome::Recorded {
                    incident_id,
                    evidence,
                } => {
                    if let Err(e) = self.engine.attach_evidence(&incident_id, evidence) {
                        warn!(incident_id = %incident_id, error = %e, "Evidence for unknown incident");
                        continue;
                    }
                    self.persist(&incident_id).await;
                }
                AlertOutcome::Notified {
                    incident_id,
                    results,
                } => {
                    debug!(
                        incident_id = %incident_id,
                        delivered = results.values().filter(|ok| **ok).count(),
                        channels = results.len(),
                        "Alert delivered"
                    );
                }
            }
        }
    }

    async fn persist(&mut self, incident_id: &str) {
        journal(self.storage.as_ref(), self.engine.incident(incident_id)).await;
    }

    async fn finish(mut self) -> RunSummary {
        self.source.release();
        self.drain_commands().await;
        self.submit_due_captures(self.last_timestamp, true).await;

        let dropped = self.queue.dropped();
        self.queue.shutdown(self.settings.shutdown_grace).await;
        self.drain_outcomes().await;

        let incidents = self.engine.all_incidents();
        let summary = RunSummary {
            frames: self.next_frame_id,
            incidents: incidents.len(),
            confirmed: incidents
                .iter()
                .filter(|i| i.confirmed_time.is_some())
                .count(),
            alerts_submitted: self.alerts_submitted,
            alerts_dropped: dropped,
        };
        let open = incidents.iter().filter(|i| i.state != IncidentState::Resolved).count();
        info!(
            frames = summary.frames,
            incidents = summary.incidents,
            confirmed = summary.confirmed,
            open,
            buffered_seconds = self.buffer.info().duration_seconds,
            "Pipeline stopped"
        );
        summary
    }
}

async fn journal(storage: Option<&Storage>, incident: Option<&Incident>) {
    let (Some(storage), Some(incident)) = (storage, incident) else {
        return;
    };
    if let Err(e) = storage.upsert_incident(incident).await {
        warn!(incident_id = %incident.incident_id, error = %e, "Could not journal incident");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use super::*;
    use crate::engine::EngineConfig;
    use crate::engine::tests::{rule_for, track_with};
    use crate::model::TrackState;
    use crate::notify::{NotificationChannel, NotificationDispatcher};
    use crate::notify::tests::RecordingChannel;

    struct Blank {
        remaining: u64,
    }

    impl FrameSource for Blank {
        fn next_frame(&mut self) -> Result<Option<RgbImage>> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(RgbImage::new(4, 4)))
        }

        fn fps(&self) -> f64 {
            10.0
        }
    }

    #[derive(Clone, Default)]
    struct Counting(Arc<AtomicUsize>);

    impl Detector for Counting {
        fn detect(&mut self, _frame: &RgbImage, _prompts: &[String], _frame_id: u64) -> Result<Vec<Detection>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    /// Reports one confirmed person on every frame.
    struct Loiterer;

    impl Tracker for Loiterer {
        fn update(&mut self, _detections: &[Detection], _frame_id: u64, _timestamp: f64) -> Result<Vec<Track>> {
            Ok(vec![track_with(1, TrackState::Confirmed, 0.9, "person")])
        }
    }

    fn pipeline(
        dir: &TempDir,
        frames: u64,
        detector: Counting,
    ) -> (Pipeline<Blank, Counting, Loiterer>, mpsc::Sender<OperatorCommand>) {
        let channels: Vec<Arc<dyn NotificationChannel>> = vec![Arc::new(RecordingChannel::new("console", true))];
        let alerts = AlertContext {
            recorder: IncidentRecorder::new(dir.path()),
            dispatcher: Arc::new(NotificationDispatcher::new(channels, Duration::from_secs(5))),
            storage: None,
            camera_id: "cam".to_string(),
        };
        let settings = PipelineSettings {
            detection_interval: 5,
            shutdown_grace: Duration::from_secs(5),
            ..PipelineSettings::default()
        };
        Pipeline::new(
            Blank { remaining: frames },
            detector,
            Loiterer,
            RuleEngine::new(vec![rule_for("person")], EngineConfig::default()),
            Classifier::default(),
            alerts,
            settings,
        )
    }

    #[tokio::test]
    async fn test_detector_runs_on_cadence() {
        let dir = TempDir::new().unwrap();
        let detector = Counting::default();
        let (pipeline, _commands) = pipeline(&dir, 12, detector.clone());
        let (_tx, shutdown) = watch::channel(false);

        let summary = pipeline.run(shutdown).await;
        assert_eq!(summary.frames, 12);
        // frames 0, 5 and 10
        assert_eq!(detector.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_capture_waits_for_post_roll() {
        let dir = TempDir::new().unwrap();
        let (mut pipeline, _commands) = pipeline(&dir, 0, Counting::default());

        // Created at 2.0s, promoted at 2.1s, post-roll 3.0s
        for _ in 0..40 {
            pipeline.process_frame(&RgbImage::new(4, 4)).await;
        }
        assert_eq!(pipeline.alerts_submitted, 0);
        assert_eq!(pipeline.pending.len(), 1);

        for _ in 40..55 {
            pipeline.process_frame(&RgbImage::new(4, 4)).await;
        }
        assert_eq!(pipeline.alerts_submitted, 1);
        assert!(pipeline.pending.is_empty());
        let summary = pipeline.finish().await;
        assert_eq!(summary.confirmed, 1);
    }

    #[tokio::test]
    async fn test_operator_resolve_is_applied_between_frames() {
        let dir = TempDir::new().unwrap();
        let (mut pipeline, commands) = pipeline(&dir, 0, Counting::default());
        for _ in 0..25 {
            pipeline.process_frame(&RgbImage::new(4, 4)).await;
        }
        let id = pipeline.engine().get_active_incidents()[0].incident_id.clone();

        commands
            .send(OperatorCommand::Resolve {
                incident_id: id.clone(),
            })
            .await
            .unwrap();
        pipeline.drain_commands().await;

        assert_eq!(
            pipeline.engine().incident(&id).unwrap().state,
            IncidentState::Resolved
        );
        pipeline.finish().await;
    }

    #[tokio::test]
    async fn test_capture_for_resolved_incident_gets_no_reminders() {
        let dir = TempDir::new().unwrap();
        let (mut pipeline, commands) = pipeline(&dir, 0, Counting::default());
        // Confirmed at 2.1s, capture due at 5.1s
        for _ in 0..25 {
            pipeline.process_frame(&RgbImage::new(4, 4)).await;
        }
        let id = pipeline.engine().get_confirmed_incidents()[0].incident_id.clone();
        commands
            .send(OperatorCommand::Resolve {
                incident_id: id.clone(),
            })
            .await
            .unwrap();
        pipeline.drain_commands().await;
        assert!(!pipeline.alerted.contains(&id));

        for _ in 25..55 {
            pipeline.process_frame(&RgbImage::new(4, 4)).await;
        }
        assert!(pipeline.alerts_submitted >= 1);
        assert!(pipeline.pending.iter().all(|p| p.incident_id != id));
        assert_eq!(pipeline.engine().incident(&id).unwrap().state, IncidentState::Resolved);
        assert!(!pipeline.alerted.contains(&id));
        pipeline.finish().await;
    }

    #[tokio::test]
    async fn test_shutdown_flag_stops_loop() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _commands) = pipeline(&dir, u64::MAX, Counting::default());
        let (tx, shutdown) = watch::channel(false);
        tx.send(true).unwrap();

        let summary = pipeline.run(shutdown).await;
        assert_eq!(summary.frames, 0);
    }
}
