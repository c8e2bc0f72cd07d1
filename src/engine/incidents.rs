//! Incident registry and lifecycle state machine.
//!
//! The registry is the single owner of every incident created during a
//! monitoring session. At most one non-resolved incident exists per
//! (track, rule) pair; resolved incidents are retained for audit.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::engine::dwell::PairKey;
use crate::error::{Error, Result};
use crate::model::{Evidence, Incident, IncidentState, Track};
use crate::rule::Rule;

/// What happened to an incident during one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// New incident, tentative.
    Created,
    /// Tentative -> confirmed on this frame.
    Promoted,
    /// History appended, state unchanged.
    Updated,
    /// Moved to the terminal state.
    Resolved,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncidentUpdate {
    pub incident_id: String,
    pub transition: Transition,
}

#[derive(Debug, Default)]
pub struct IncidentRegistry {
    incidents: HashMap<String, Incident>,
    open_by_pair: HashMap<PairKey, String>,
}

impl IncidentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or advance the incident for an eligible pair.
    ///
    /// A missing open incident is created tentative with `first_detected_time`
    /// set to the dwell window's start; an existing tentative one is promoted.
    /// Either way the track's latest confidence and the frame id are appended.
    pub fn on_eligible(
        &mut self,
        track: &Track,
        rule: &Rule,
        window_start: f64,
        frame_id: u64,
        now: f64,
    ) -> IncidentUpdate {
        let key: PairKey = (track.track_id, rule.rule_id.clone());
        let confidence = track
            .latest_detection()
            .map_or(track.confidence, |d| d.confidence);

        let existing = self
            .open_by_pair
            .get(&key)
            .and_then(|id| self.incidents.get_mut(id))
            .filter(|incident| incident.is_open());

        if let Some(incident) = existing {
            let transition = if incident.promote(now) {
                info!(
                    incident_id = %incident.incident_id,
                    track_id = track.track_id,
                    rule_id = %rule.rule_id,
                    "Incident confirmed"
                );
                Transition::Promoted
            } else {
                Transition::Updated
            };
            incident.record_observation(confidence, frame_id, now);
            return IncidentUpdate {
                incident_id: incident.incident_id.clone(),
                transition,
            };
        }

        let incident_id = self.unique_id(&rule.rule_id, track.track_id, window_start);
        let mut incident = Incident::new(incident_id.clone(), &rule.rule_id, track.track_id, window_start);
        incident.record_observation(confidence, frame_id, now);

        info!(
            incident_id = %incident_id,
            track_id = track.track_id,
            rule_id = %rule.rule_id,
            "Incident tentative"
        );

        self.incidents.insert(incident_id.clone(), incident);
        self.open_by_pair.insert(key, incident_id.clone());

        IncidentUpdate {
            incident_id,
            transition: Transition::Created,
        }
    }

    fn unique_id(&self, rule_id: &str, track_id: u64, start: f64) -> String {
        let base = format!("{rule_id}_{track_id}_{}", (start * 1000.0).round() as i64);
        if !self.incidents.contains_key(&base) {
            return base;
        }
        (1..)
            .map(|n| format!("{base}-{n}"))
            .find(|candidate| !self.incidents.contains_key(candidate))
            .unwrap_or(base)
    }

    /// Force the terminal state (operator action).
    pub fn resolve(&mut self, incident_id: &str, timestamp: f64) -> Result<&Incident> {
        let incident = self
            .incidents
            .get_mut(incident_id)
            .ok_or_else(|| Error::NotFound(format!("incident '{incident_id}'")))?;

        if incident.resolve(timestamp) {
            info!(incident_id = %incident_id, "Incident resolved");
            self.open_by_pair
                .remove(&(incident.track_id, incident.rule_id.clone()));
        } else {
            warn!(incident_id = %incident_id, "Incident already resolved");
        }
        Ok(incident)
    }

    /// Resolve every open incident that has had no eligible frame for
    /// `max_idle` seconds.
    pub fn resolve_idle(&mut self, now: f64, max_idle: f64) -> Vec<IncidentUpdate> {
        let stale: Vec<String> = self
            .open_by_pair
            .values()
            .filter(|id| {
                self.incidents
                    .get(*id)
                    .is_some_and(|i| now - i.last_matched_time >= max_idle)
            })
            .cloned()
            .collect();

        let mut updates = Vec::with_capacity(stale.len());
        for id in stale {
            let Some(incident) = self.incidents.get_mut(&id) else {
                continue;
            };
            if !incident.resolve(now) {
                continue;
            }
            info!(incident_id = %id, idle_seconds = max_idle, "Incident auto-resolved");
            self.open_by_pair
                .remove(&(incident.track_id, incident.rule_id.clone()));
            updates.push(IncidentUpdate {
                incident_id: id,
                transition: Transition::Resolved,
            });
        }
        updates
    }

    /// Cooldown-gated notification eligibility.
    pub fn should_notify(incident: &Incident, now: f64, rule: &Rule) -> bool {
        if incident.state != IncidentState::Confirmed {
            return false;
        }
        match incident.last_notification_time {
            None => true,
            Some(last) => now - last >= rule.actions.cooldown_seconds,
        }
    }

    pub fn mark_notified(&mut self, incident_id: &str, now: f64) -> Result<()> {
        let incident = self
            .incidents
            .get_mut(incident_id)
            .ok_or_else(|| Error::NotFound(format!("incident '{incident_id}'")))?;
        incident.last_notification_time = Some(now);
        incident.notification_count += 1;
        Ok(())
    }

    pub fn attach_evidence(&mut self, incident_id: &str, evidence: Evidence) -> Result<()> {
        let incident = self
            .incidents
            .get_mut(incident_id)
            .ok_or_else(|| Error::NotFound(format!("incident '{incident_id}'")))?;
        incident.evidence.snapshots.extend(evidence.snapshots);
        if evidence.clip.is_some() {
            incident.evidence.clip = evidence.clip;
        }
        Ok(())
    }

    pub fn get(&self, incident_id: &str) -> Option<&Incident> {
        self.incidents.get(incident_id)
    }

    /// Open incident for a pair, if any.
    pub fn open_for(&self, key: &PairKey) -> Option<&Incident> {
        self.open_by_pair.get(key).and_then(|id| self.incidents.get(id))
    }

    /// All non-resolved incidents, oldest first.
    pub fn active(&self) -> Vec<&Incident> {
        self.filtered(|i| i.is_open())
    }

    /// All confirmed incidents, oldest first.
    pub fn confirmed(&self) -> Vec<&Incident> {
        self.filtered(|i| i.state == IncidentState::Confirmed)
    }

    pub fn all(&self) -> Vec<&Incident> {
        self.filtered(|_| true)
    }

    pub fn len(&self) -> usize {
        self.incidents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.incidents.is_empty()
    }

    fn filtered(&self, keep: impl Fn(&Incident) -> bool) -> Vec<&Incident> {
        let mut out: Vec<&Incident> = self.incidents.values().filter(|i| keep(i)).collect();
        out.sort_by(|a, b| {
            a.first_detected_time
                .total_cmp(&b.first_detected_time)
                .then_with(|| a.incident_id.cmp(&b.incident_id))
        });
        out
    }
}
