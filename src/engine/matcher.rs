//! Per-frame (track, rule) match test.

use crate::model::Track;
use crate::rule::Rule;

/// Why a track failed to match a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    StateNotEvaluable,
    NoHistory,
    LowConfidence,
    ClassificationMismatch,
    OutsideRoi,
    PromptMismatch,
}

/// Pure match test, called once per (rule, track) per frame.
pub fn matches(track: &Track, rule: &Rule) -> bool {
    check(track, rule).is_ok()
}

/// Same as [`matches`] but reports the first failing condition.
pub fn check(track: &Track, rule: &Rule) -> Result<(), Rejection> {
    if !track.state.is_evaluable() {
        return Err(Rejection::StateNotEvaluable);
    }

    let latest = track.latest_detection().ok_or(Rejection::NoHistory)?;

    if latest.confidence < rule.conditions.min_confidence {
        return Err(Rejection::LowConfidence);
    }

    if let Some(required) = rule.conditions.required_state() {
        if track.state != required {
            return Err(Rejection::ClassificationMismatch);
        }
    }

    if let Some(roi) = rule.roi() {
        if roi.enabled && !roi.contains_bbox(&track.bbox) {
            return Err(Rejection::OutsideRoi);
        }
    }

    // Detections without provenance (e.g. coasted boxes) skip this check.
    if !latest.prompt_used.is_empty() && !latest.prompt_used.contains(rule.prompt()) {
        return Err(Rejection::PromptMismatch);
    }

    Ok(())
}
