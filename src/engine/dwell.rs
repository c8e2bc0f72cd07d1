//! Contiguous dwell-window accumulation per (track, rule) pair.
//!
//! A single non-matching frame discards the pair's window entirely. There is
//! no tolerance for brief occlusion.

use std::collections::HashMap;

use crate::model::TrackId;
use crate::rule::RuleConditions;

/// Key of the per-pair state.
pub type PairKey = (TrackId, String);

/// A contiguous run of matching frames.
#[derive(Debug, Clone, PartialEq)]
pub struct DwellWindow {
    pub started_at: f64,
    pub frame_ids: Vec<u64>,
}

impl DwellWindow {
    fn start(frame_id: u64, timestamp: f64) -> Self {
        Self {
            started_at: timestamp,
            frame_ids: vec![frame_id],
        }
    }

    pub fn elapsed(&self, now: f64) -> f64 {
        now - self.started_at
    }

    pub fn frame_count(&self) -> usize {
        self.frame_ids.len()
    }

    /// Both the time and the frame-count requirement are met.
    pub fn is_satisfied(&self, now: f64, conditions: &RuleConditions) -> bool {
        self.elapsed(now) >= conditions.dwell_seconds && self.frame_count() >= conditions.min_frames
    }
}

#[derive(Debug, Default)]
pub struct DwellTracker {
    windows: HashMap<PairKey, DwellWindow>,
}

impl DwellTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a matching frame, starting the window on first match.
    pub fn observe(&mut self, key: PairKey, frame_id: u64, timestamp: f64) -> &DwellWindow {
        self.windows
            .entry(key)
            .and_modify(|w| w.frame_ids.push(frame_id))
            .or_insert_with(|| DwellWindow::start(frame_id, timestamp))
    }

    /// Discard all progress for a pair.
    pub fn reset(&mut self, key: &PairKey) {
        self.windows.remove(key);
    }

    pub fn get(&self, key: &PairKey) -> Option<&DwellWindow> {
        self.windows.get(key)
    }

    /// Keep only pairs for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&PairKey) -> bool) {
        self.windows.retain(|k, _| keep(k));
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(track: TrackId) -> PairKey {
        (track, "r".to_string())
    }

    #[test]
    fn test_window_accumulates() {
        let mut dwell = DwellTracker::new();
        dwell.observe(key(1), 1, 0.0);
        dwell.observe(key(1), 2, 0.5);
        let w = dwell.observe(key(1), 3, 1.0);

        assert_eq!(w.started_at, 0.0);
        assert_eq!(w.frame_ids, vec![1, 2, 3]);
        assert_eq!(w.elapsed(1.0), 1.0);
    }

    #[test]
    fn test_reset_restarts_from_zero() {
        let mut dwell = DwellTracker::new();
        dwell.observe(key(1), 1, 0.0);
        dwell.observe(key(1), 2, 1.0);
        dwell.reset(&key(1));

        let w = dwell.observe(key(1), 3, 2.0);
        assert_eq!(w.started_at, 2.0);
        assert_eq!(w.frame_count(), 1);
    }

    #[test]
    fn test_satisfied_needs_time_and_frames() {
        let conditions = RuleConditions::new(2.0, 0.4, 3);
        let window = DwellWindow {
            started_at: 0.0,
            frame_ids: vec![1, 2],
        };
        // Enough time, too few frames
        assert!(!window.is_satisfied(5.0, &conditions));

        let window = DwellWindow {
            started_at: 0.0,
            frame_ids: vec![1, 2, 3, 4],
        };
        assert!(!window.is_satisfied(1.9, &conditions));
        assert!(window.is_satisfied(2.0, &conditions));
    }

    #[test]
    fn test_retain_drops_pairs() {
        let mut dwell = DwellTracker::new();
        dwell.observe(key(1), 1, 0.0);
        dwell.observe(key(2), 1, 0.0);

        dwell.retain(|(track, _)| *track == 2);
        assert!(dwell.get(&key(1)).is_none());
        assert_eq!(dwell.len(), 1);
    }
}
