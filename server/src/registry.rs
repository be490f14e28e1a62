//! Authoritative presence registry
//!
//! The registry is the single source of truth for who is connected, where
//! they are and who follows whom. Every operation is total: unknown ids,
//! repeated removals and empty sweeps all have defined outcomes, so the
//! broker never has to handle a registry-level failure.
//!
//! Roles are conferred by observers. A record becomes `Tracked` the moment
//! a viewer's location update names it as target, and it never goes back to
//! `Viewer` on its own.

use log::{debug, info};
use shared::{ChannelId, PresenceRecord, Role};
use std::collections::HashMap;

/// A position report for an identity already present in the registry
#[derive(Debug, Clone, PartialEq)]
pub struct LocationUpdate {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub role: Role,
    pub tracking_target: Option<String>,
}

#[derive(Debug, Default)]
pub struct Registry {
    records: HashMap<String, PresenceRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    /// Inserts or replaces the record for `id`
    ///
    /// A rejoin is last-writer-wins: the previous record, including any
    /// position it carried, is discarded and the position fields start
    /// again from their defaults.
    pub fn join(
        &mut self,
        id: &str,
        role: Role,
        tracking_target: Option<String>,
        channel: Option<ChannelId>,
        now: u64,
    ) {
        let mut record = PresenceRecord::new(id, role, tracking_target, now);
        record.channel = channel;

        if self.records.insert(id.to_string(), record).is_some() {
            info!("Identity {} rejoined as {:?}", id, role);
        } else {
            info!("Identity {} joined as {:?}", id, role);
        }
    }

    /// Applies a position report
    ///
    /// Unknown ids are ignored and `false` is returned; an update never
    /// creates a record. When a viewer names a target, the target's role is
    /// switched to `Tracked` as part of the same call.
    pub fn update_location(&mut self, update: LocationUpdate, now: u64) -> bool {
        let target = match self.records.get_mut(&update.id) {
            Some(record) => {
                record.latitude = update.latitude;
                record.longitude = update.longitude;
                // Radius of uncertainty is never negative
                record.accuracy = update.accuracy.max(0.0);
                record.last_seen = now;

                match update.tracking_target {
                    Some(target) if update.role == Role::Viewer && !target.is_empty() => {
                        record.tracking_target = Some(target.clone());
                        Some(target)
                    }
                    _ => None,
                }
            }
            None => {
                debug!("Ignoring location update for unknown identity {}", update.id);
                return false;
            }
        };

        if let Some(target) = target {
            if let Some(tracked) = self.records.get_mut(&target) {
                if tracked.role != Role::Tracked {
                    debug!("Identity {} is now tracked by {}", target, update.id);
                }
                tracked.role = Role::Tracked;
            }
        }

        true
    }

    /// Deletes the record for `id`, returning it if it was present
    pub fn remove(&mut self, id: &str) -> Option<PresenceRecord> {
        let removed = self.records.remove(id);
        if removed.is_some() {
            info!("Identity {} removed", id);
        }
        removed
    }

    /// Removes every record idle for strictly longer than `threshold_ms`
    ///
    /// Returns the removed ids so the caller can announce each departure.
    pub fn sweep_expired(&mut self, now: u64, threshold_ms: u64) -> Vec<String> {
        let expired: Vec<String> = self
            .records
            .values()
            .filter(|record| now.saturating_sub(record.last_seen) > threshold_ms)
            .map(|record| record.id.clone())
            .collect();

        for id in &expired {
            info!("Removing inactive identity {}", id);
            self.records.remove(id);
        }

        expired
    }

    /// Copies out every record; order carries no meaning
    pub fn snapshot(&self) -> Vec<PresenceRecord> {
        self.records.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&PresenceRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
