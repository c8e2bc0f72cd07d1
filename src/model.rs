//! Data models for OVD Watchdog.
//!
//! Tracks and detections arrive from the upstream tracker and are read-only to
//! the rule engine (apart from the classification state written during
//! enrichment). Incidents are owned by the engine's registry and move through
//! a strictly monotonic `tentative -> confirmed -> resolved` lifecycle.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Tracker-assigned identity, stable across frames.
pub type TrackId = u64;

/// A 2-D point in image coordinates.
///
/// Serialized as a `[x, y]` pair to match rule documents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 2]", into = "[f32; 2]")]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl From<[f32; 2]> for Point {
    fn from([x, y]: [f32; 2]) -> Self {
        Self { x, y }
    }
}

impl From<Point> for [f32; 2] {
    fn from(p: Point) -> Self {
        [p.x, p.y]
    }
}

/// Axis-aligned box in `[x1, y1, x2, y2]` form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl From<[f32; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [f32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Centroid of the box.
    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// The top `ratio` share of the box (e.g. the head region of a person).
    pub fn top_region(&self, ratio: f32) -> BoundingBox {
        BoundingBox::new(self.x1, self.y1, self.x2, self.y1 + self.height() * ratio)
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);

        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }
}

/// Lifecycle state of a track.
///
/// The first three come from the tracker; the rest are written by
/// classification enrichment for subject tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackState {
    Tentative,
    Confirmed,
    Lost,
    Helmeted,
    Helmetless,
    Unknown,
}

impl TrackState {
    /// Whether the state was produced by classification enrichment.
    pub fn is_classification(&self) -> bool {
        matches!(
            self,
            TrackState::Helmeted | TrackState::Helmetless | TrackState::Unknown
        )
    }

    /// States the rule matcher is willing to evaluate.
    pub fn is_evaluable(&self) -> bool {
        matches!(self, TrackState::Confirmed) || self.is_classification()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrackState::Tentative => "tentative",
            TrackState::Confirmed => "confirmed",
            TrackState::Lost => "lost",
            TrackState::Helmeted => "helmeted",
            TrackState::Helmetless => "helmetless",
            TrackState::Unknown => "unknown",
        }
    }
}

/// A single detector output, as recorded in a track's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,

    pub confidence: f32,

    /// Class label or matched phrase.
    pub class_name: String,

    /// The prompt string the detector was run with (provenance).
    #[serde(default)]
    pub prompt_used: String,

    #[serde(default)]
    pub frame_id: u64,
}

/// A tracked object as delivered by the tracker for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub track_id: TrackId,

    /// Current box.
    pub bbox: BoundingBox,

    /// Current confidence.
    pub confidence: f32,

    pub class_name: String,

    pub state: TrackState,

    /// Append-only detection history, oldest first.
    #[serde(default)]
    pub detection_history: Vec<Detection>,
}

impl Track {
    /// Most recent detection, if any was ever recorded.
    pub fn latest_detection(&self) -> Option<&Detection> {
        self.detection_history.last()
    }

    /// Mean confidence over the detection history.
    pub fn average_confidence(&self) -> Option<f32> {
        if self.detection_history.is_empty() {
            return None;
        }
        let sum: f32 = self.detection_history.iter().map(|d| d.confidence).sum();
        Some(sum / self.detection_history.len() as f32)
    }
}

/// Lifecycle state of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentState {
    Tentative,
    Confirmed,
    Resolved,
}

impl IncidentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentState::Tentative => "tentative",
            IncidentState::Confirmed => "confirmed",
            IncidentState::Resolved => "resolved",
        }
    }
}

impl std::str::FromStr for IncidentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tentative" => Ok(IncidentState::Tentative),
            "confirmed" => Ok(IncidentState::Confirmed),
            "resolved" => Ok(IncidentState::Resolved),
            other => Err(format!("unknown incident state '{other}'")),
        }
    }
}

/// Evidence captured for an incident.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub snapshots: Vec<PathBuf>,
    pub clip: Option<PathBuf>,
}

/// A rule violation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub incident_id: String,
    pub rule_id: String,
    pub track_id: TrackId,

    /// Start of the dwell window that produced this incident.
    pub first_detected_time: f64,
    pub confirmed_time: Option<f64>,
    pub resolved_time: Option<f64>,

    pub state: IncidentState,

    pub evidence: Evidence,

    pub confidence_scores: Vec<f32>,
    pub frame_ids: Vec<u64>,

    /// Timestamp of the latest eligible frame.
    pub last_matched_time: f64,

    pub last_notification_time: Option<f64>,
    pub notification_count: u32,
}

impl Incident {
    pub(crate) fn new(
        incident_id: String,
        rule_id: &str,
        track_id: TrackId,
        first_detected_time: f64,
    ) -> Self {
        Self {
            incident_id,
            rule_id: rule_id.to_string(),
            track_id,
            first_detected_time,
            confirmed_time: None,
            resolved_time: None,
            state: IncidentState::Tentative,
            evidence: Evidence::default(),
            confidence_scores: Vec::new(),
            frame_ids: Vec::new(),
            last_matched_time: first_detected_time,
            last_notification_time: None,
            notification_count: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state != IncidentState::Resolved
    }

    /// Mean of the confidence history, 0 when empty.
    pub fn average_confidence(&self) -> f32 {
        if self.confidence_scores.is_empty() {
            return 0.0;
        }
        self.confidence_scores.iter().sum::<f32>() / self.confidence_scores.len() as f32
    }

    /// Promote tentative -> confirmed. Returns whether a transition happened.
    pub(crate) fn promote(&mut self, timestamp: f64) -> bool {
        if self.state != IncidentState::Tentative {
            return false;
        }
        self.state = IncidentState::Confirmed;
        self.confirmed_time = Some(timestamp);
        true
    }

    /// Move to the terminal state. Returns whether a transition happened.
    pub(crate) fn resolve(&mut self, timestamp: f64) -> bool {
        if self.state == IncidentState::Resolved {
            return false;
        }
        self.state = IncidentState::Resolved;
        self.resolved_time = Some(timestamp);
        true
    }

    pub(crate) fn record_observation(&mut self, confidence: f32, frame_id: u64, timestamp: f64) {
        self.confidence_scores.push(confidence);
        self.frame_ids.push(frame_id);
        self.last_matched_time = timestamp;
    }
}
