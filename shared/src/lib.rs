use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// How often the server checks for idle presence records.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Records not refreshed within this window are expired by the sweep.
pub const EXPIRY_THRESHOLD: Duration = Duration::from_secs(5 * 60);
/// Position fixes less accurate than this (in meters) are never shared.
pub const MAX_ACCEPTABLE_ACCURACY: f64 = 1000.0;
/// A cached position older than this is not used as a fallback.
pub const CACHED_POSITION_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
/// Accuracy assumed for a position restored from the local cache.
pub const CACHED_POSITION_ACCURACY: f64 = 500.0;
/// Query parameter of a share link that names the identity to follow.
pub const TRACK_QUERY_PARAM: &str = "track";

/// Server-assigned handle of one open bidirectional channel.
pub type ChannelId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Tracked,
    Viewer,
}

impl Role {
    /// A client is a viewer exactly when it names someone to follow.
    pub fn declared(tracking_target: Option<&str>) -> Self {
        match tracking_target {
            Some(target) if !target.is_empty() => Role::Viewer,
            _ => Role::Tracked,
        }
    }
}

/// Everything the relay knows about one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub id: String,
    /// Channel the identity most recently joined on. Not part of the wire format.
    #[serde(skip)]
    pub channel: Option<ChannelId>,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_target: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    /// Milliseconds since the UNIX epoch of the last join or update.
    pub last_seen: u64,
}

impl PresenceRecord {
    pub fn new(id: &str, role: Role, tracking_target: Option<String>, last_seen: u64) -> Self {
        Self {
            id: id.to_string(),
            channel: None,
            role,
            tracking_target,
            latitude: 0.0,
            longitude: 0.0,
            accuracy: 0.0,
            last_seen,
        }
    }
}

/// Messages a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Join {
        id: String,
        role: Role,
        #[serde(default)]
        tracking_target: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    UpdateLocation {
        id: String,
        latitude: f64,
        longitude: f64,
        #[serde(default)]
        accuracy: f64,
        role: Role,
        #[serde(default)]
        tracking_target: Option<String>,
    },
    Leave {
        id: String,
    },
}

/// Messages the relay fans out to every open channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Full snapshot of the registry; replaces the receiver's cache.
    UsersUpdate { users: Vec<PresenceRecord> },
    /// Early hint that an identity is gone, ahead of the next snapshot.
    IdentityRemoved { id: String },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported frame: {0}")]
    UnsupportedFrame(String),
}

/// Encodes a protocol message as a JSON text frame payload.
pub fn encode<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

/// Decodes a JSON text frame payload into a protocol message.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

// Get current timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
