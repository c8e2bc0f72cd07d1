//! Bounded alert work queue drained by a small worker pool.
//!
//! The frame loop submits jobs and never waits on them. When the queue is
//! full the oldest pending job is dropped (best-effort, at-most-once
//! alerting). Workers write evidence on the blocking pool, dispatch
//! notifications and report results back over an unbounded channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{DeliveryResults, NotificationDispatcher};
use crate::model::{Evidence, Incident};
use crate::record::{EvidenceFrames, IncidentRecorder};
use crate::rule::Rule;
use crate::storage::Storage;

/// Work for the alert workers. Incidents are snapshots taken at submission.
#[derive(Debug)]
pub enum AlertJob {
    /// First confirmation: write evidence, then notify.
    Capture {
        incident: Incident,
        rule: Arc<Rule>,
        frames: EvidenceFrames,
    },
    /// Cooldown reminder for an already alerted incident.
    Remind { incident: Incident, rule: Arc<Rule> },
}

impl AlertJob {
    pub fn incident_id(&self) -> &str {
        match self {
            AlertJob::Capture { incident, .. } | AlertJob::Remind { incident, .. } => &incident.incident_id,
        }
    }
}

/// Results reported back to the frame loop.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertOutcome {
    Recorded { incident_id: String, evidence: Evidence },
    Notified { incident_id: String, results: DeliveryResults },
}

/// Everything a worker needs.
#[derive(Clone)]
pub struct AlertContext {
    pub recorder: IncidentRecorder,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub storage: Option<Storage>,
    pub camera_id: String,
}

struct Shared {
    jobs: Mutex<VecDeque<AlertJob>>,
    capacity: usize,
    ready: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

pub struct AlertQueue {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl AlertQueue {
    /// Spawn `workers` tasks on the current runtime.
    pub fn start(
        capacity: usize,
        workers: usize,
        context: AlertContext,
        outcomes: mpsc::UnboundedSender<AlertOutcome>,
    ) -> Self {
        let shared = Arc::new(Shared {
            jobs: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });

        let workers = (0..workers.max(1))
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    Arc::clone(&shared),
                    context.clone(),
                    outcomes.clone(),
                ))
            })
            .collect();

        Self { shared, workers }
    }

    /// Enqueue a job, dropping the oldest pending one if full.
    pub fn submit(&self, job: AlertJob) {
        if self.shared.closed.load(Ordering::SeqCst) {
            warn!(incident_id = %job.incident_id(), "Alert queue closed, job discarded");
            return;
        }
        {
            let mut jobs = self.shared.jobs.lock();
            if jobs.len() >= self.shared.capacity {
                if let Some(oldest) = jobs.pop_front() {
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        capacity = self.shared.capacity,
                        dropped_incident = %oldest.incident_id(),
                        "Alert queue full, dropping oldest job"
                    );
                }
            }
            jobs.push_back(job);
        }
        self.shared.ready.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.shared.jobs.lock().len()
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting jobs, let workers drain for up to `grace`, then abort.
    pub async fn shutdown(&mut self, grace: Duration) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.ready.notify_waiters();

        let deadline = tokio::time::Instant::now() + grace;
        for mut handle in self.workers.drain(..) {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("Alert worker did not finish in time, aborting");
                handle.abort();
            }
        }
        let abandoned = self.shared.jobs.lock().len();
        if abandoned > 0 {
            warn!(abandoned, "Alert jobs abandoned at shutdown");
        }
        info!(dropped = self.dropped(), "Alert queue stopped");
    }
}

async fn worker(
    id: usize,
    shared: Arc<Shared>,
    context: AlertContext,
    outcomes: mpsc::UnboundedSender<AlertOutcome>,
) {
    debug!(worker = id, "Alert worker started");
    loop {
        // Registered before the checks so a close signal cannot be missed.
        let notified = shared.ready.notified();
        let job = shared.jobs.lock().pop_front();
        if let Some(job) = job {
            process(job, &context, &outcomes).await;
            continue;
        }
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
        notified.await;
    }
    debug!(worker = id, "Alert worker stopped");
}

async fn process(job: AlertJob, context: &AlertContext, outcomes: &mpsc::UnboundedSender<AlertOutcome>) {
    let (incident, rule) = match job {
        AlertJob::Capture {
            incident,
            rule,
            frames,
        } => {
            let recorder = context.recorder.clone();
            let snapshot = incident.clone();
            let rule_ref = Arc::clone(&rule);
            let written =
                tokio::task::spawn_blocking(move || recorder.write(&frames, &snapshot, &rule_ref)).await;

            let mut incident = incident;
            match written {
                Ok(Ok(evidence)) => {
                    incident.evidence = evidence.clone();
                    let _ = outcomes.send(AlertOutcome::Recorded {
                        incident_id: incident.incident_id.clone(),
                        evidence,
                    });
                }
                Ok(Err(e)) => warn!(incident_id = %incident.incident_id, error = %e, "Evidence recording failed"),
                Err(e) => warn!(incident_id = %incident.incident_id, error = %e, "Evidence task failed"),
            }
            (incident, rule)
        }
        AlertJob::Remind { incident, rule } => (incident, rule),
    };

    let results = context
        .dispatcher
        .notify(&incident, &rule, &context.camera_id)
        .await;

    if let Some(storage) = &context.storage {
        if let Err(e) = storage.record_deliveries(&incident.incident_id, &results).await {
            warn!(incident_id = %incident.incident_id, error = %e, "Could not log notification results");
        }
    }

    let _ = outcomes.send(AlertOutcome::Notified {
        incident_id: incident.incident_id,
        results,
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use image::RgbImage;
    use tempfile::TempDir;

    use super::*;
    use crate::engine::tests::rule_for;
    use crate::notify::NotificationChannel;
    use crate::notify::tests::{RecordingChannel, confirmed_incident};
    use crate::record::RingBuffer;

    fn context(dir: &TempDir, channel: Arc<RecordingChannel>) -> AlertContext {
        let channels: Vec<Arc<dyn NotificationChannel>> = vec![channel];
        AlertContext {
            recorder: IncidentRecorder::new(dir.path()),
            dispatcher: Arc::new(NotificationDispatcher::new(channels, Duration::from_secs(5))),
            storage: None,
            camera_id: "cam".to_string(),
        }
    }

    fn rule() -> Arc<Rule> {
        let mut rule = rule_for("person");
        rule.actions.notify_channels = vec!["slack".to_string()];
        Arc::new(rule)
    }

    #[tokio::test]
    async fn test_capture_job_records_then_notifies() {
        let dir = TempDir::new().unwrap();
        let slack = Arc::new(RecordingChannel::new("slack", true));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut queue = AlertQueue::start(4, 1, context(&dir, slack.clone()), tx);

        let mut buffer = RingBuffer::new(10.0, 30.0, usize::MAX);
        for frame in 0..90u64 {
            buffer.push(&RgbImage::new(8, 8), frame as f64 / 30.0, frame);
        }
        let incident = confirmed_incident();
        let rule = rule();
        let frames = IncidentRecorder::new(dir.path()).capture(&buffer, &incident, &rule, 0.0);
        queue.submit(AlertJob::Capture {
            incident,
            rule,
            frames,
        });

        match rx.recv().await.unwrap() {
            AlertOutcome::Recorded { evidence, .. } => {
                assert!(evidence.clip.is_some());
                assert_eq!(evidence.snapshots.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        match rx.recv().await.unwrap() {
            AlertOutcome::Notified { results, .. } => assert!(results["slack"]),
            other => panic!("unexpected {other:?}"),
        }

        // Payload carries the freshly written evidence
        let sent = slack.sent.lock()[0].clone();
        assert!(sent.snapshot_path.is_some());
        queue.shutdown(Duration::from_secs(1)).await;
    }

    /// Queue with no workers attached, so nothing drains it.
    fn idle(capacity: usize) -> AlertQueue {
        AlertQueue {
            shared: Arc::new(Shared {
                jobs: Mutex::new(VecDeque::new()),
                capacity,
                ready: Notify::new(),
                closed: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            }),
            workers: Vec::new(),
        }
    }

    fn remind(id: &str) -> AlertJob {
        let mut incident = confirmed_incident();
        incident.incident_id = id.to_string();
        AlertJob::Remind {
            incident,
            rule: rule(),
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest() {
        let queue = idle(2);
        for id in ["inc_0", "inc_1", "inc_2"] {
            queue.submit(remind(id));
        }

        assert_eq!(queue.pending(), 2);
        assert_eq!(queue.dropped(), 1);
        let ids: Vec<_> = queue
            .shared
            .jobs
            .lock()
            .iter()
            .map(|j| j.incident_id().to_string())
            .collect();
        assert_eq!(ids, vec!["inc_1", "inc_2"]);
    }

    #[tokio::test]
    async fn test_remind_jobs_are_delivered_and_shutdown_drains() {
        let dir = TempDir::new().unwrap();
        let slack = Arc::new(RecordingChannel::new("slack", true));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut queue = AlertQueue::start(8, 2, context(&dir, slack.clone()), tx);

        for i in 0..3 {
            let mut incident = confirmed_incident();
            incident.incident_id = format!("inc_{i}");
            incident.notification_count = 1;
            queue.submit(AlertJob::Remind {
                incident,
                rule: rule(),
            });
        }
        queue.shutdown(Duration::from_secs(5)).await;

        let mut notified = 0;
        while let Ok(outcome) = rx.try_recv() {
            assert!(matches!(outcome, AlertOutcome::Notified { .. }));
            notified += 1;
        }
        assert_eq!(notified, 3);
        assert_eq!(slack.calls.load(Ordering::SeqCst), 3);
        assert!(slack.sent.lock().iter().all(|p| p.reminder));
    }

    #[test]
    fn test_submit_after_close_is_discarded() {
        let queue = idle(2);
        queue.shared.closed.store(true, Ordering::SeqCst);
        queue.submit(remind("late"));
        assert_eq!(queue.pending(), 0);
    }
}
