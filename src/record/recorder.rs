//! Per-incident evidence directories.
//!
//! Layout: `<output_dir>/<incident_id>/{snapshot.jpg, clip.gif, metadata.json}`.
//! Capturing (selecting frames from the buffer) is separate from writing so
//! the frame loop only pays for `Arc` clones; encoding runs elsewhere.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::model::{Evidence, Incident, IncidentState, TrackId};
use crate::record::encode;
use crate::record::ring_buffer::{BufferedFrame, RingBuffer};
use crate::rule::Rule;

const SNAPSHOT_FILE: &str = "snapshot.jpg";
const CLIP_FILE: &str = "clip.gif";
const METADATA_FILE: &str = "metadata.json";

/// Frame ids kept in the metadata sample.
const FRAME_ID_SAMPLE: usize = 10;

/// Frames selected from the buffer for one incident.
#[derive(Debug, Clone)]
pub struct EvidenceFrames {
    pub snapshot: Option<BufferedFrame>,
    pub clip: Vec<BufferedFrame>,
    pub clip_start: f64,
    pub clip_end: f64,
    pub fps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataTimestamps {
    pub first_detected: f64,
    pub confirmed: Option<f64>,
    pub resolved: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEvidence {
    pub snapshots: Vec<PathBuf>,
    pub video_clip: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataStatistics {
    pub avg_confidence: f32,
    pub num_frames: usize,
    pub frame_ids: Vec<u64>,
}

/// Rule configuration as it was when the evidence was recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRuleConfig {
    pub dwell_seconds: f64,
    pub min_confidence: f32,
    pub min_frames: usize,
    pub cooldown_seconds: f64,
    pub record_pre_seconds: f64,
    pub record_post_seconds: f64,
    pub roi_enabled: bool,
    pub notify_channels: Vec<String>,
}

/// Contents of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentMetadata {
    pub incident_id: String,
    pub rule_id: String,
    pub rule_description: String,
    pub area_id: String,
    pub track_id: TrackId,
    pub state: IncidentState,
    pub timestamps: MetadataTimestamps,
    pub evidence: MetadataEvidence,
    pub statistics: MetadataStatistics,
    pub rule_config: MetadataRuleConfig,
    pub created_at: DateTime<Utc>,
}

impl IncidentMetadata {
    pub fn new(incident: &Incident, rule: &Rule, evidence: &Evidence) -> Self {
        Self {
            incident_id: incident.incident_id.clone(),
            rule_id: incident.rule_id.clone(),
            rule_description: rule.description.clone(),
            area_id: rule.area_id.clone(),
            track_id: incident.track_id,
            state: incident.state,
            timestamps: MetadataTimestamps {
                first_detected: incident.first_detected_time,
                confirmed: incident.confirmed_time,
                resolved: incident.resolved_time,
            },
            evidence: MetadataEvidence {
                snapshots: evidence.snapshots.clone(),
                video_clip: evidence.clip.clone(),
            },
            statistics: MetadataStatistics {
                avg_confidence: incident.average_confidence(),
                num_frames: incident.frame_ids.len(),
                frame_ids: incident.frame_ids.iter().take(FRAME_ID_SAMPLE).copied().collect(),
            },
            rule_config: MetadataRuleConfig {
                dwell_seconds: rule.conditions.dwell_seconds,
                min_confidence: rule.conditions.min_confidence,
                min_frames: rule.conditions.min_frames,
                cooldown_seconds: rule.actions.cooldown_seconds,
                record_pre_seconds: rule.actions.record_pre_seconds,
                record_post_seconds: rule.actions.record_post_seconds,
                roi_enabled: rule.roi().is_some_and(|r| r.enabled),
                notify_channels: rule.actions.notify_channels.clone(),
            },
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IncidentRecorder {
    output_dir: PathBuf,
    clip_fps: Option<f64>,
}

impl IncidentRecorder {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            clip_fps: None,
        }
    }

    /// Encode clips at this rate instead of the buffer's.
    pub fn with_clip_fps(mut self, fps: f64) -> Self {
        self.clip_fps = Some(fps);
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn incident_dir(&self, incident_id: &str) -> PathBuf {
        self.output_dir.join(incident_id)
    }

    /// Instant of the snapshot and centre of the clip window.
    pub fn trigger_time(incident: &Incident, fallback_time: f64) -> f64 {
        incident.confirmed_time.unwrap_or(fallback_time)
    }

    /// Select the evidence frames for an incident from the live buffer.
    pub fn capture(
        &self,
        buffer: &RingBuffer,
        incident: &Incident,
        rule: &Rule,
        fallback_time: f64,
    ) -> EvidenceFrames {
        let trigger = Self::trigger_time(incident, fallback_time);
        let clip_start = trigger - rule.actions.record_pre_seconds;
        let clip_end = trigger + rule.actions.record_post_seconds;
        EvidenceFrames {
            snapshot: buffer.closest(trigger),
            clip: buffer.window(clip_start, clip_end),
            clip_start,
            clip_end,
            fps: self.clip_fps.unwrap_or_else(|| buffer.fps()),
        }
    }

    /// Write captured frames and the metadata document.
    ///
    /// Missing snapshot or clip frames are logged and leave the path unset;
    /// only a failure to write the metadata itself is an error.
    pub fn write(&self, frames: &EvidenceFrames, incident: &Incident, rule: &Rule) -> Result<Evidence> {
        let dir = self.incident_dir(&incident.incident_id);
        fs::create_dir_all(&dir)?;
        let mut evidence = Evidence::default();

        match &frames.snapshot {
            Some(entry) => {
                let path = dir.join(SNAPSHOT_FILE);
                match encode::write_snapshot(&entry.frame, &path) {
                    Ok(()) => evidence.snapshots.push(path),
                    Err(e) => warn!(incident_id = %incident.incident_id, error = %e, "Snapshot write failed"),
                }
            }
            None => warn!(incident_id = %incident.incident_id, "No frame available for snapshot"),
        }

        if frames.clip.is_empty() {
            warn!(
                incident_id = %incident.incident_id,
                start = frames.clip_start,
                end = frames.clip_end,
                "No frames in clip window"
            );
        } else {
            let path = dir.join(CLIP_FILE);
            match encode::write_clip(&frames.clip, frames.fps, &path) {
                Ok(()) => evidence.clip = Some(path),
                Err(e) => warn!(incident_id = %incident.incident_id, error = %e, "Clip write failed"),
            }
        }

        self.write_metadata(incident, rule, &evidence)?;

        info!(
            incident_id = %incident.incident_id,
            snapshot = !evidence.snapshots.is_empty(),
            clip = evidence.clip.is_some(),
            clip_frames = frames.clip.len(),
            "Evidence recorded"
        );
        Ok(evidence)
    }

    /// Capture and write in one step.
    pub fn record(
        &self,
        buffer: &RingBuffer,
        incident: &Incident,
        rule: &Rule,
        fallback_time: f64,
    ) -> Result<Evidence> {
        let frames = self.capture(buffer, incident, rule, fallback_time);
        self.write(&frames, incident, rule)
    }

    /// (Re)write `metadata.json` for an incident.
    pub fn write_metadata(&self, incident: &Incident, rule: &Rule, evidence: &Evidence) -> Result<PathBuf> {
        let dir = self.incident_dir(&incident.incident_id);
        fs::create_dir_all(&dir)?;
        let path = dir.join(METADATA_FILE);
        let metadata = IncidentMetadata::new(incident, rule, evidence);
        fs::write(&path, serde_json::to_vec_pretty(&metadata)?)?;
        Ok(path)
    }

    pub fn read_metadata(&self, incident_id: &str) -> Result<IncidentMetadata> {
        let text = fs::read_to_string(self.incident_dir(incident_id).join(METADATA_FILE))?;
        Ok(serde_json::from_str(&text)?)
    }
}
