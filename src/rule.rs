//! Monitoring rule definitions and rule-document loading.
//!
//! Rule documents are JSON or YAML. They are parsed into strongly typed
//! [`Rule`] values (unknown fields rejected) and then checked against
//! business constraints. Any failure aborts the load with a descriptive
//! [`Error::InvalidRule`], so a pipeline never starts with a malformed rule.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::model::TrackState;
use crate::roi::Roi;

/// Allowed range for `conditions.dwell_seconds`.
const DWELL_SECONDS_RANGE: std::ops::RangeInclusive<f64> = 0.1..=300.0;

/// Longest evidence window on either side of a confirmation.
const MAX_RECORD_SECONDS: f64 = 300.0;

/// How the rule's subject is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    /// The detector prompt alone identifies the violation.
    Direct,
    /// The violation is inferred by composing several tracked classes.
    #[default]
    Composite,
}

/// Detector configuration for a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectionConfig {
    /// Text prompt sent to the detector.
    #[serde(alias = "prompt")]
    pub prompt_positive: String,

    #[serde(default)]
    pub prompt_negative: Option<String>,

    #[serde(default = "default_box_threshold")]
    pub box_threshold: f32,

    #[serde(default = "default_text_threshold")]
    pub text_threshold: f32,
}

fn default_box_threshold() -> f32 {
    0.35
}

fn default_text_threshold() -> f32 {
    0.25
}

/// Conditions a track must satisfy, continuously, to raise an incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConditions {
    pub dwell_seconds: f64,

    pub min_confidence: f32,

    #[serde(default = "default_min_frames")]
    pub min_frames: usize,

    /// Classification state the track must be in, if any.
    #[serde(default)]
    pub require_state: Option<TrackState>,

    /// Legacy spelling of `require_state: helmetless`.
    #[serde(default, skip_serializing)]
    require_helmetless: bool,

    #[serde(default, alias = "inside_roi")]
    pub roi: Option<Roi>,
}

fn default_min_frames() -> usize {
    3
}

impl RuleConditions {
    pub fn new(dwell_seconds: f64, min_confidence: f32, min_frames: usize) -> Self {
        Self {
            dwell_seconds,
            min_confidence,
            min_frames,
            require_state: None,
            require_helmetless: false,
            roi: None,
        }
    }

    /// The effective classification requirement.
    pub fn required_state(&self) -> Option<TrackState> {
        self.require_state
            .or(self.require_helmetless.then_some(TrackState::Helmetless))
    }
}

/// What happens once an incident is confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleActions {
    pub cooldown_seconds: f64,

    #[serde(default)]
    pub record_pre_seconds: f64,

    #[serde(default)]
    pub record_post_seconds: f64,

    /// Channel names, in delivery order.
    pub notify_channels: Vec<String>,
}

/// A monitoring rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    pub rule_id: String,

    #[serde(default = "default_area_id")]
    pub area_id: String,

    pub description: String,

    #[serde(default)]
    pub method: DetectionMethod,

    pub detection: DetectionConfig,

    pub conditions: RuleConditions,

    pub actions: RuleActions,

    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_area_id() -> String {
    "default".to_string()
}

impl Rule {
    /// Detector prompt for this rule.
    pub fn prompt(&self) -> &str {
        &self.detection.prompt_positive
    }

    /// Region of interest, if the rule is spatially restricted.
    pub fn roi(&self) -> Option<&Roi> {
        self.conditions.roi.as_ref()
    }

    /// Parse a JSON rule document and validate it.
    pub fn from_json(text: &str, origin: &str) -> Result<Self> {
        let rule: Rule = serde_json::from_str(text)
            .map_err(|e| Error::invalid_rule(origin, format!("JSON schema validation failed: {e}")))?;
        rule.validate(origin)?;
        Ok(rule)
    }

    /// Parse a YAML rule document and validate it.
    pub fn from_yaml(text: &str, origin: &str) -> Result<Self> {
        let rule: Rule = serde_yaml::from_str(text)
            .map_err(|e| Error::invalid_rule(origin, format!("YAML schema validation failed: {e}")))?;
        rule.validate(origin)?;
        Ok(rule)
    }

    /// Load a rule file, choosing the format by extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let origin = path.display().to_string();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::invalid_rule(&origin, format!("cannot read file: {e}")))?;

        match extension(path).as_deref() {
            Some("json") => Self::from_json(&text, &origin),
            Some("yaml" | "yml") => Self::from_yaml(&text, &origin),
            other => Err(Error::invalid_rule(
                origin,
                format!("unsupported rule file type {other:?}, use .json or .yaml"),
            )),
        }
    }

    /// Business constraints on top of the document structure.
    pub fn validate(&self, origin: &str) -> Result<()> {
        let fail = |reason: String| Err(Error::invalid_rule(origin, reason));

        if self.rule_id.trim().is_empty() {
            return fail("rule_id must not be empty".into());
        }
        // Incident ids and evidence directories are derived from it
        if !self
            .rule_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return fail(format!(
                "rule_id may only contain ASCII letters, digits, '_' and '-', got '{}'",
                self.rule_id
            ));
        }
        if self.description.trim().is_empty() {
            return fail("description must not be empty".into());
        }
        if self.detection.prompt_positive.trim().is_empty() {
            return fail("detection.prompt_positive must not be empty".into());
        }
        for (name, value) in [
            ("detection.box_threshold", self.detection.box_threshold),
            ("detection.text_threshold", self.detection.text_threshold),
            ("conditions.min_confidence", self.conditions.min_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return fail(format!("{name} must be between 0 and 1, got {value}"));
            }
        }

        let conditions = &self.conditions;
        if !DWELL_SECONDS_RANGE.contains(&conditions.dwell_seconds) {
            return fail(format!(
                "conditions.dwell_seconds must be between {} and {}, got {}",
                DWELL_SECONDS_RANGE.start(),
                DWELL_SECONDS_RANGE.end(),
                conditions.dwell_seconds
            ));
        }
        if conditions.min_frames == 0 {
            return fail("conditions.min_frames must be at least 1".into());
        }
        if let Some(state) = conditions.required_state() {
            if !state.is_classification() {
                return fail(format!(
                    "conditions.require_state must be a classification state, got '{}'",
                    state.as_str()
                ));
            }
            if self.method == DetectionMethod::Direct {
                return fail("conditions.require_state needs method 'composite'".into());
            }
        }
        if let Some(roi) = &conditions.roi {
            if let Err(reason) = roi.validate() {
                return fail(format!("conditions.roi: {reason}"));
            }
        }

        let actions = &self.actions;
        for (name, value) in [
            ("actions.cooldown_seconds", actions.cooldown_seconds),
            ("actions.record_pre_seconds", actions.record_pre_seconds),
            ("actions.record_post_seconds", actions.record_post_seconds),
        ] {
            if !value.is_finite() || value < 0.0 {
                return fail(format!("{name} must be a non-negative number, got {value}"));
            }
        }
        for (name, value) in [
            ("actions.record_pre_seconds", actions.record_pre_seconds),
            ("actions.record_post_seconds", actions.record_post_seconds),
        ] {
            if value > MAX_RECORD_SECONDS {
                return fail(format!("{name} must be at most {MAX_RECORD_SECONDS}, got {value}"));
            }
        }
        if actions.notify_channels.is_empty() {
            return fail("actions.notify_channels must list at least one channel".into());
        }
        if actions.notify_channels.iter().any(|c| c.trim().is_empty()) {
            return fail("actions.notify_channels contains an empty name".into());
        }

        Ok(())
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Load one rule file, or every `.json`/`.yaml`/`.yml` file in a directory
/// (sorted by file name). Duplicate rule ids are rejected.
pub fn load_rules(path: &Path) -> Result<Vec<Rule>> {
    let files = if path.is_dir() {
        let mut files: Vec<_> = fs::read_dir(path)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file() && matches!(extension(p).as_deref(), Some("json" | "yaml" | "yml"))
            })
            .collect();
        files.sort();
        files
    } else {
        vec![path.to_path_buf()]
    };

    if files.is_empty() {
        return Err(Error::invalid_rule(
            path.display().to_string(),
            "no rule documents found",
        ));
    }

    let mut seen = HashSet::new();
    let mut rules = Vec::with_capacity(files.len());
    for file in files {
        let rule = Rule::from_path(&file)?;
        if !seen.insert(rule.rule_id.clone()) {
            return Err(Error::invalid_rule(
                file.display().to_string(),
                format!("duplicate rule_id '{}'", rule.rule_id),
            ));
        }
        info!(
            rule_id = %rule.rule_id,
            description = %rule.description,
            dwell_seconds = rule.conditions.dwell_seconds,
            roi_enabled = rule.roi().is_some_and(|r| r.enabled),
            "Rule loaded"
        );
        rules.push(rule);
    }

    Ok(rules)
}
