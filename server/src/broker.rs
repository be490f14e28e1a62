//! Routes inbound protocol messages to the registry and fans out the result
//!
//! Every external event runs as "mutate, then broadcast": the registry is
//! changed first and the resulting snapshot is pushed to all open channels.
//! The broker is driven by a single loop, so events never interleave.

use crate::channels::ChannelSet;
use crate::registry::{LocationUpdate, Registry};
use log::{debug, error, info, warn};
use shared::{encode, ChannelId, ClientMessage, ServerMessage};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct Broker {
    registry: Registry,
    channels: ChannelSet,
    expiry_threshold: Duration,
}

impl Broker {
    pub fn new(expiry_threshold: Duration) -> Self {
        Self {
            registry: Registry::new(),
            channels: ChannelSet::new(),
            expiry_threshold,
        }
    }

    /// Registers a new channel; it has no identity until it sends `join`
    pub fn open_channel(
        &mut self,
        id: ChannelId,
        addr: SocketAddr,
        sender: mpsc::Sender<String>,
    ) {
        self.channels.open(id, addr, sender);
    }

    /// Applies one inbound message received on `channel_id`
    pub fn handle_message(&mut self, channel_id: ChannelId, message: ClientMessage, now: u64) {
        match message {
            ClientMessage::Join {
                id,
                role,
                tracking_target,
            } => {
                if !self.channels.bind_identity(channel_id, &id) {
                    warn!("Join for {} on unknown channel {}", id, channel_id);
                }
                self.registry
                    .join(&id, role, tracking_target, Some(channel_id), now);
                self.broadcast_snapshot();
            }

            ClientMessage::UpdateLocation {
                id,
                latitude,
                longitude,
                accuracy,
                role,
                tracking_target,
            } => {
                debug!("Location update from {}", id);
                let update = LocationUpdate {
                    id,
                    latitude,
                    longitude,
                    accuracy,
                    role,
                    tracking_target,
                };
                self.registry.update_location(update, now);
                // Broadcast even when the identity was unknown
                self.broadcast_snapshot();
            }

            ClientMessage::Leave { id } => {
                if self.channels.unbind_identity(channel_id, &id) {
                    self.remove_identity(&id);
                } else {
                    warn!("Ignoring leave for {} on channel {}", id, channel_id);
                }
            }
        }
    }

    /// Handles a channel going away, removing its identity at most once
    pub fn close_channel(&mut self, channel_id: ChannelId) {
        if let Some(channel) = self.channels.close(channel_id) {
            if let Some(identity) = channel.identity {
                self.remove_identity(&identity);
            }
        }
    }

    /// Expires idle records, announcing each one
    ///
    /// A snapshot is only broadcast if something was removed.
    pub fn sweep(&mut self, now: u64) -> Vec<String> {
        let threshold_ms = self.expiry_threshold.as_millis() as u64;
        let removed = self.registry.sweep_expired(now, threshold_ms);

        for id in &removed {
            self.broadcast(&ServerMessage::IdentityRemoved { id: id.clone() });
        }

        if !removed.is_empty() {
            info!("Sweep removed {} inactive identities", removed.len());
            self.broadcast_snapshot();
        }

        removed
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn remove_identity(&mut self, id: &str) {
        if self.registry.remove(id).is_some() {
            self.broadcast(&ServerMessage::IdentityRemoved { id: id.to_string() });
            self.broadcast_snapshot();
        }
    }

    fn broadcast_snapshot(&self) {
        self.broadcast(&ServerMessage::UsersUpdate {
            users: self.registry.snapshot(),
        });
    }

    fn broadcast(&self, message: &ServerMessage) {
        match encode(message) {
            Ok(text) => {
                let delivered = self.channels.broadcast(&text);
                debug!("Broadcast queued on {} channels", delivered);
            }
            Err(e) => error!("Failed to encode broadcast: {}", e),
        }
    }
}
