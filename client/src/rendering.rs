use log::{debug, info};
use shared::{PresenceRecord, Role};
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    /// The local client
    Own,
    Tracked,
    Viewer,
}

impl MarkerKind {
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Tracked => MarkerKind::Tracked,
            Role::Viewer => MarkerKind::Viewer,
        }
    }
}

/// Whatever draws identities on a map
pub trait MarkerLayer {
    fn place(&mut self, id: &str, kind: MarkerKind, latitude: f64, longitude: f64);
    fn move_to(&mut self, id: &str, latitude: f64, longitude: f64);
    /// Restyles an existing marker, e.g. when a viewer becomes tracked
    fn set_kind(&mut self, id: &str, kind: MarkerKind);
    fn remove(&mut self, id: &str);
    fn contains(&self, id: &str) -> bool;
    fn focus(&mut self, latitude: f64, longitude: f64);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Marker {
    pub kind: MarkerKind,
    pub latitude: f64,
    pub longitude: f64,
}

/// Marker layer that keeps markers in memory and reports changes to the log
#[derive(Debug, Default)]
pub struct LogMarkers {
    markers: HashMap<String, Marker>,
    focus: Option<(f64, f64)>,
}

impl LogMarkers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Marker> {
        self.markers.get(id)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn current_focus(&self) -> Option<(f64, f64)> {
        self.focus
    }
}

impl MarkerLayer for LogMarkers {
    fn place(&mut self, id: &str, kind: MarkerKind, latitude: f64, longitude: f64) {
        info!("{:?} marker {} at ({:.6}, {:.6})", kind, id, latitude, longitude);
        self.markers.insert(
            id.to_string(),
            Marker {
                kind,
                latitude,
                longitude,
            },
        );
    }

    fn move_to(&mut self, id: &str, latitude: f64, longitude: f64) {
        if let Some(marker) = self.markers.get_mut(id) {
            debug!("Marker {} moved to ({:.6}, {:.6})", id, latitude, longitude);
            marker.latitude = latitude;
            marker.longitude = longitude;
        }
    }

    fn set_kind(&mut self, id: &str, kind: MarkerKind) {
        if let Some(marker) = self.markers.get_mut(id) {
            if marker.kind != kind {
                info!("Marker {} is now {:?}", id, kind);
                marker.kind = kind;
            }
        }
    }

    fn remove(&mut self, id: &str) {
        if self.markers.remove(id).is_some() {
            info!("Marker {} removed", id);
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.markers.contains_key(id)
    }

    fn focus(&mut self, latitude: f64, longitude: f64) {
        debug!("Map centered on ({:.6}, {:.6})", latitude, longitude);
        self.focus = Some((latitude, longitude));
    }
}

/// One line of the connected-users list
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub id: String,
    pub label: String,
}

/// Orders users for display: the local client, then tracked, then viewers
pub fn roster<'a>(
    users: impl IntoIterator<Item = &'a PresenceRecord>,
    own_id: &str,
) -> Vec<RosterEntry> {
    let mut users: Vec<&PresenceRecord> = users.into_iter().collect();
    users.sort_by(|a, b| rank(a, own_id).cmp(&rank(b, own_id)).then_with(|| by_id(a, b)));

    users
        .into_iter()
        .map(|user| {
            let label = if user.id == own_id {
                "You".to_string()
            } else {
                let kind = match user.role {
                    Role::Tracked => "Tracked",
                    Role::Viewer => "Viewer",
                };
                format!("{} ({})", kind, short_id(&user.id))
            };
            RosterEntry {
                id: user.id.clone(),
                label,
            }
        })
        .collect()
}

fn rank(user: &PresenceRecord, own_id: &str) -> u8 {
    if user.id == own_id {
        0
    } else if user.role == Role::Tracked {
        1
    } else {
        2
    }
}

fn by_id(a: &PresenceRecord, b: &PresenceRecord) -> Ordering {
    a.id.cmp(&b.id)
}

fn short_id(id: &str) -> String {
    let prefix: String = id.chars().take(6).collect();
    format!("{}...", prefix)
}
