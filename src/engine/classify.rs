//! Classification enrichment by composition.
//!
//! Subject tracks (people) are paired with equipment tracks (helmets) by the
//! IoU between the subject's head region and each equipment box. Raw per-frame
//! labels are noisy near box edges, so the written state is a majority vote
//! over a short per-track history.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{Track, TrackId, TrackState};

/// Tuning for helmet inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Top share of the subject box treated as the head.
    pub head_ratio: f32,
    /// Minimum head/equipment IoU to count as wearing it.
    pub iou_threshold: f32,
    /// Equipment tracks below this confidence are ignored.
    pub min_equipment_confidence: f32,
    /// Majority vote window, in frames.
    pub smoothing_frames: usize,
    /// Minimum majority share, otherwise the state is `unknown`.
    pub min_vote_share: f32,
    pub subject_classes: Vec<String>,
    pub equipment_keywords: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            head_ratio: 0.40,
            iou_threshold: 0.15,
            min_equipment_confidence: 0.28,
            smoothing_frames: 5,
            min_vote_share: 0.6,
            subject_classes: ["person", "worker", "human"].map(String::from).to_vec(),
            equipment_keywords: [
                "helmet",
                "hard hat",
                "safety helmet",
                "hardhat",
                "hat",
                "yellow helmet",
            ]
            .map(String::from)
            .to_vec(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Classifier {
    config: ClassifierConfig,
    history: HashMap<TrackId, VecDeque<TrackState>>,
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            history: HashMap::new(),
        }
    }

    fn is_subject(&self, track: &Track) -> bool {
        let class = track.class_name.to_lowercase();
        self.config.subject_classes.iter().any(|c| *c == class)
    }

    fn is_equipment(&self, track: &Track) -> bool {
        let class = track.class_name.to_lowercase();
        track.confidence >= self.config.min_equipment_confidence
            && self
                .config
                .equipment_keywords
                .iter()
                .any(|k| class.contains(k.as_str()))
    }

    /// Write smoothed `helmeted`/`helmetless`/`unknown` states onto subject
    /// tracks. Tentative and lost subjects are left untouched.
    pub fn enrich(&mut self, tracks: &mut [Track]) {
        let equipment: Vec<_> = tracks
            .iter()
            .filter(|t| self.is_equipment(t))
            .map(|t| t.bbox)
            .collect();

        let mut seen = HashSet::new();
        for track in tracks.iter_mut() {
            if !self.is_subject(track)
                || matches!(track.state, TrackState::Tentative | TrackState::Lost)
            {
                continue;
            }
            seen.insert(track.track_id);

            let head = track.bbox.top_region(self.config.head_ratio);
            let best_iou = equipment
                .iter()
                .map(|b| head.iou(b))
                .fold(0.0_f32, f32::max);
            let raw = if best_iou >= self.config.iou_threshold {
                TrackState::Helmeted
            } else {
                TrackState::Helmetless
            };

            let votes = self.history.entry(track.track_id).or_default();
            votes.push_back(raw);
            while votes.len() > self.config.smoothing_frames.max(1) {
                votes.pop_front();
            }

            track.state = smoothed(votes, self.config.min_vote_share);
            debug!(
                track_id = track.track_id,
                best_iou,
                state = track.state.as_str(),
                "Track classified"
            );
        }

        // Histories of subjects no longer delivered are dropped.
        self.history.retain(|id, _| seen.contains(id));
    }
}

fn smoothed(votes: &VecDeque<TrackState>, min_share: f32) -> TrackState {
    if votes.is_empty() {
        return TrackState::Unknown;
    }
    let helmeted = votes.iter().filter(|s| **s == TrackState::Helmeted).count();
    let helmetless = votes.len() - helmeted;
    let (label, count) = if helmeted >= helmetless {
        (TrackState::Helmeted, helmeted)
    } else {
        (TrackState::Helmetless, helmetless)
    };

    if count as f32 / votes.len() as f32 >= min_share {
        label
    } else {
        TrackState::Unknown
    }
}
