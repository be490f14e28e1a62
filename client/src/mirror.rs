//! Client-side copy of the relay's presence state
//!
//! The mirror is never authoritative. Each `users-update` replaces the whole
//! cache, and the marker layer is reconciled against it: new peers get a
//! marker, known ones are moved and restyled to their current role, departed
//! ones are dropped. The local
//! client's own marker is created from local fixes only and is never
//! duplicated as a peer.

use crate::position::Observation;
use crate::rendering::{MarkerKind, MarkerLayer};
use log::debug;
use shared::{ClientMessage, PresenceRecord, Role};
use std::collections::HashMap;

pub struct LocalMirror<M: MarkerLayer> {
    identity: String,
    track_target: Option<String>,
    users: HashMap<String, PresenceRecord>,
    markers: M,
}

impl<M: MarkerLayer> LocalMirror<M> {
    pub fn new(identity: String, track_target: Option<String>, markers: M) -> Self {
        Self {
            identity,
            track_target: track_target.filter(|target| !target.is_empty()),
            users: HashMap::new(),
            markers,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn track_target(&self) -> Option<&str> {
        self.track_target.as_deref()
    }

    pub fn role(&self) -> Role {
        Role::declared(self.track_target())
    }

    pub fn users(&self) -> &HashMap<String, PresenceRecord> {
        &self.users
    }

    pub fn markers(&self) -> &M {
        &self.markers
    }

    /// The announcement sent whenever the channel opens
    pub fn join_message(&self) -> ClientMessage {
        ClientMessage::Join {
            id: self.identity.clone(),
            role: self.role(),
            tracking_target: self.track_target.clone(),
        }
    }

    /// Records a local fix and builds the update to send for it
    ///
    /// Returns `None` for fixes above the accuracy threshold; those are
    /// neither shared nor shown.
    pub fn observe(&mut self, observation: Observation) -> Option<ClientMessage> {
        if !observation.is_acceptable() {
            debug!(
                "Ignoring inaccurate position ({}m)",
                observation.accuracy.round()
            );
            return None;
        }

        self.show_own_position(observation);

        Some(ClientMessage::UpdateLocation {
            id: self.identity.clone(),
            latitude: observation.latitude,
            longitude: observation.longitude,
            accuracy: observation.accuracy,
            role: self.role(),
            tracking_target: self.track_target.clone(),
        })
    }

    /// Shows a position locally without producing an update, e.g. a cached fix
    pub fn show_own_position(&mut self, observation: Observation) {
        if self.markers.contains(&self.identity) {
            self.markers
                .move_to(&self.identity, observation.latitude, observation.longitude);
        } else {
            self.markers.place(
                &self.identity,
                MarkerKind::Own,
                observation.latitude,
                observation.longitude,
            );
        }

        if let Some(own) = self.users.get_mut(&self.identity) {
            own.latitude = observation.latitude;
            own.longitude = observation.longitude;
            own.accuracy = observation.accuracy;
        }
    }

    /// Replaces the cache with a snapshot and reconciles markers
    ///
    /// Returns the followed identity's position if it is in the snapshot.
    pub fn apply_snapshot(&mut self, users: Vec<PresenceRecord>) -> Option<(f64, f64)> {
        let incoming: HashMap<String, PresenceRecord> = users
            .into_iter()
            .map(|user| (user.id.clone(), user))
            .collect();

        let departed: Vec<String> = self
            .users
            .keys()
            .filter(|id| **id != self.identity && !incoming.contains_key(*id))
            .cloned()
            .collect();
        for id in departed {
            self.markers.remove(&id);
        }

        for user in incoming.values() {
            if self.markers.contains(&user.id) {
                self.markers.move_to(&user.id, user.latitude, user.longitude);
                if user.id != self.identity {
                    self.markers
                        .set_kind(&user.id, MarkerKind::for_role(user.role));
                }
            } else if user.id != self.identity {
                self.markers.place(
                    &user.id,
                    MarkerKind::for_role(user.role),
                    user.latitude,
                    user.longitude,
                );
            }
        }

        self.users = incoming;

        let focus = self.focus();
        if let Some((latitude, longitude)) = focus {
            self.markers.focus(latitude, longitude);
        }
        focus
    }

    /// Drops an identity ahead of the next snapshot
    pub fn apply_removal(&mut self, id: &str) {
        self.users.remove(id);
        if id != self.identity {
            self.markers.remove(id);
        }
    }

    /// Position of the followed identity, if it is known
    pub fn focus(&self) -> Option<(f64, f64)> {
        let target = self.users.get(self.track_target.as_deref()?)?;
        Some((target.latitude, target.longitude))
    }
}
