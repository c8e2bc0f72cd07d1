//! Rule evaluation engine.
//!
//! Owns the per-(track, rule) dwell state and the incident registry for one
//! monitoring session. All evaluation is synchronous and free of I/O; the
//! frame loop is the single owner and the only caller of [`RuleEngine::evaluate`].

pub mod classify;
pub mod dwell;
pub mod incidents;
pub mod matcher;

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{Evidence, Incident, Track};
use crate::rule::Rule;

pub use classify::{Classifier, ClassifierConfig};
pub use dwell::{DwellTracker, DwellWindow, PairKey};
pub use incidents::{IncidentRegistry, IncidentUpdate, Transition};
pub use matcher::{Rejection, matches};

/// Engine-level policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Resolve an open incident after this many seconds without an eligible
    /// frame. `None` keeps incidents open until resolved manually.
    pub resolve_after_seconds: Option<f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resolve_after_seconds: Some(30.0),
        }
    }
}

pub struct RuleEngine {
    rules: Vec<Arc<Rule>>,
    dwell: DwellTracker,
    incidents: IncidentRegistry,
    config: EngineConfig,
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>, config: EngineConfig) -> Self {
        Self {
            rules: rules.into_iter().map(Arc::new).collect(),
            dwell: DwellTracker::new(),
            incidents: IncidentRegistry::new(),
            config,
        }
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn rule(&self, rule_id: &str) -> Option<&Arc<Rule>> {
        self.rules.iter().find(|r| r.rule_id == rule_id)
    }

    /// Detector prompts of every loaded rule, deduplicated in load order.
    pub fn prompts(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.rules
            .iter()
            .map(|r| r.prompt().to_string())
            .filter(|p| seen.insert(p.clone()))
            .collect()
    }

    /// Evaluate every rule against the tracks of one frame.
    ///
    /// Returns one update per incident touched on this frame. A pair that does
    /// not match (or whose track is absent) loses all dwell progress.
    pub fn evaluate(&mut self, tracks: &[Track], frame_id: u64, timestamp: f64) -> Vec<IncidentUpdate> {
        let mut updates = Vec::new();

        for rule in &self.rules {
            for track in tracks {
                let key: PairKey = (track.track_id, rule.rule_id.clone());

                if let Err(reason) = matcher::check(track, rule) {
                    if self.dwell.get(&key).is_some() {
                        debug!(
                            track_id = track.track_id,
                            rule_id = %rule.rule_id,
                            ?reason,
                            "Dwell window reset"
                        );
                        self.dwell.reset(&key);
                    }
                    continue;
                }

                let window = self.dwell.observe(key, frame_id, timestamp);
                if !window.is_satisfied(timestamp, &rule.conditions) {
                    continue;
                }
                let started_at = window.started_at;
                updates.push(self.incidents.on_eligible(track, rule, started_at, frame_id, timestamp));
            }
        }

        let present: HashSet<_> = tracks.iter().map(|t| t.track_id).collect();
        self.dwell.retain(|(track_id, _)| present.contains(track_id));

        if let Some(max_idle) = self.config.resolve_after_seconds {
            updates.extend(self.incidents.resolve_idle(timestamp, max_idle));
        }

        updates
    }

    /// Operator resolution. The pair's dwell window is discarded so a new
    /// incident needs a fresh dwell period.
    pub fn resolve(&mut self, incident_id: &str, timestamp: f64) -> Result<&Incident> {
        let key = self
            .incidents
            .get(incident_id)
            .map(|i| (i.track_id, i.rule_id.clone()))
            .ok_or_else(|| Error::NotFound(format!("incident '{incident_id}'")))?;
        self.dwell.reset(&key);
        self.incidents.resolve(incident_id, timestamp)
    }

    /// Cooldown-gated notification eligibility for a registered incident.
    pub fn should_notify(&self, incident_id: &str, now: f64) -> bool {
        self.incidents.get(incident_id).is_some_and(|incident| {
            self.rule(&incident.rule_id)
                .is_some_and(|rule| IncidentRegistry::should_notify(incident, now, rule))
        })
    }

    pub fn mark_notified(&mut self, incident_id: &str, now: f64) -> Result<()> {
        self.incidents.mark_notified(incident_id, now)
    }

    pub fn attach_evidence(&mut self, incident_id: &str, evidence: Evidence) -> Result<()> {
        self.incidents.attach_evidence(incident_id, evidence)
    }

    pub fn incident(&self, incident_id: &str) -> Option<&Incident> {
        self.incidents.get(incident_id)
    }

    pub fn get_active_incidents(&self) -> Vec<&Incident> {
        self.incidents.active()
    }

    pub fn get_confirmed_incidents(&self) -> Vec<&Incident> {
        self.incidents.confirmed()
    }

    pub fn all_incidents(&self) -> Vec<&Incident> {
        self.incidents.all()
    }

    pub fn dwell_window(&self, key: &PairKey) -> Option<&DwellWindow> {
        self.dwell.get(key)
    }
}
