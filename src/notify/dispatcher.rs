//! Fan-out of one payload to many channels with per-channel isolation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{ALWAYS_ON_CHANNEL, NotificationChannel, NotificationPayload};
use crate::model::Incident;
use crate::rule::Rule;

/// Per-channel delivery outcome, keyed by channel name.
pub type DeliveryResults = BTreeMap<String, bool>;

pub struct NotificationDispatcher {
    channels: HashMap<String, Arc<dyn NotificationChannel>>,
    send_timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>, send_timeout: Duration) -> Self {
        let channels = channels
            .into_iter()
            .map(|c| (c.name().to_string(), c))
            .collect();
        Self {
            channels,
            send_timeout,
        }
    }

    pub fn register(&mut self, channel: Arc<dyn NotificationChannel>) {
        self.channels.insert(channel.name().to_string(), channel);
    }

    pub fn channel_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.channels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the payload for an incident and deliver it to the rule's
    /// channels plus the always-on channel.
    pub async fn notify(&self, incident: &Incident, rule: &Rule, camera_id: &str) -> DeliveryResults {
        let payload = Arc::new(NotificationPayload::new(incident, rule, camera_id));
        self.dispatch(&rule.actions.notify_channels, payload).await
    }

    /// Deliver one payload. Channels that are not loaded, disabled, rate
    /// limited, failing, slow or panicking are reported as `false`; none of
    /// them affects delivery to the others.
    pub async fn dispatch(&self, requested: &[String], payload: Arc<NotificationPayload>) -> DeliveryResults {
        let mut targets: Vec<&str> = Vec::with_capacity(requested.len() + 1);
        for name in requested {
            if !targets.contains(&name.as_str()) {
                targets.push(name);
            }
        }
        if !targets.contains(&ALWAYS_ON_CHANNEL) && self.channels.contains_key(ALWAYS_ON_CHANNEL) {
            targets.push(ALWAYS_ON_CHANNEL);
        }

        let mut results = DeliveryResults::new();
        let mut pending = Vec::with_capacity(targets.len());

        for name in targets {
            let Some(channel) = self.channels.get(name) else {
                warn!(channel = %name, incident_id = %payload.incident_id, "Channel not configured");
                results.insert(name.to_string(), false);
                continue;
            };
            let channel = Arc::clone(channel);
            let payload = Arc::clone(&payload);
            let timeout = self.send_timeout;
            pending.push((
                name.to_string(),
                tokio::spawn(async move { deliver(channel, payload, timeout).await }),
            ));
        }

        for (name, handle) in pending {
            let delivered = match handle.await {
                Ok(delivered) => delivered,
                Err(e) => {
                    warn!(channel = %name, error = %e, "Channel task failed");
                    false
                }
            };
            results.insert(name, delivered);
        }

        info!(
            incident_id = %payload.incident_id,
            delivered = results.values().filter(|ok| **ok).count(),
            failed = results.values().filter(|ok| !**ok).count(),
            "Notification dispatched"
        );
        results
    }
}

async fn deliver(channel: Arc<dyn NotificationChannel>, payload: Arc<NotificationPayload>, timeout: Duration) -> bool {
    let name = channel.name().to_string();
    if !channel.is_enabled() {
        debug!(channel = %name, "Channel disabled");
        return false;
    }
    let Some(slot) = channel.rate_limiter().try_acquire() else {
        info!(
            channel = %name,
            retry_in_ms = channel.rate_limiter().remaining().as_millis() as u64,
            "Channel rate limited, skipping"
        );
        return false;
    };

    // Dropping the slot without commit hands the interval back
    match tokio::time::timeout(timeout, channel.send(&payload)).await {
        Ok(true) => {
            slot.commit();
            true
        }
        Ok(false) => {
            warn!(channel = %name, incident_id = %payload.incident_id, "Channel send failed");
            false
        }
        Err(_) => {
            warn!(channel = %name, timeout_ms = timeout.as_millis() as u64, "Channel send timed out");
            false
        }
    }
}
