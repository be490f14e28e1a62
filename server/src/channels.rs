//! Open channel bookkeeping for the relay
//!
//! This module tracks every open bidirectional channel, including:
//! - Channel lifecycle (open, close)
//! - The identity a channel has announced through `join`, if any
//! - The outbound queue used to push frames to the channel's socket task
//!
//! A channel exists before it has an identity; the identity arrives with the
//! first `join`. An identity is bound to at most one channel at a time.

use log::{error, info, warn};
use shared::ChannelId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Frames a channel may have queued before further frames to it are dropped
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Represents one open channel and the identity it speaks for
#[derive(Debug)]
pub struct Channel {
    /// Unique channel identifier assigned by the server
    pub id: ChannelId,
    /// Peer address, for logging
    pub addr: SocketAddr,
    /// When the channel was opened
    pub opened_at: Instant,
    /// Identity announced on this channel, cleared once it has been removed
    pub identity: Option<String>,
    /// Queue drained by the channel's socket task
    sender: mpsc::Sender<String>,
}

impl Channel {
    pub fn new(id: ChannelId, addr: SocketAddr, sender: mpsc::Sender<String>) -> Self {
        Self {
            id,
            addr,
            opened_at: Instant::now(),
            identity: None,
            sender,
        }
    }

    /// Queues a text frame for this channel without waiting
    ///
    /// Fails with `Full` when the peer is not reading fast enough and with
    /// `Closed` once the socket task has gone away.
    pub fn send(&self, text: &str) -> Result<(), TrySendError<String>> {
        self.sender.try_send(text.to_string())
    }
}

/// Manages all open channels
#[derive(Debug, Default)]
pub struct ChannelSet {
    channels: HashMap<ChannelId, Channel>,
}

impl ChannelSet {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    /// Registers a freshly opened channel with no identity yet
    pub fn open(&mut self, id: ChannelId, addr: SocketAddr, sender: mpsc::Sender<String>) {
        info!("Channel {} opened from {}", id, addr);
        self.channels.insert(id, Channel::new(id, addr, sender));
    }

    /// Forgets a channel, returning it so the caller can clean up its identity
    pub fn close(&mut self, id: ChannelId) -> Option<Channel> {
        let channel = self.channels.remove(&id)?;
        info!(
            "Channel {} closed after {:.1}s",
            id,
            channel.opened_at.elapsed().as_secs_f32()
        );
        Some(channel)
    }

    /// Associates `identity` with channel `id`
    ///
    /// Any other channel still holding the same identity loses it, so that
    /// closing a superseded channel does not remove a live identity.
    /// Returns false if the channel is unknown.
    pub fn bind_identity(&mut self, id: ChannelId, identity: &str) -> bool {
        if !self.channels.contains_key(&id) {
            return false;
        }

        for channel in self.channels.values_mut() {
            if channel.id != id && channel.identity.as_deref() == Some(identity) {
                info!("Identity {} moved from channel {} to {}", identity, channel.id, id);
                channel.identity = None;
            }
        }

        if let Some(channel) = self.channels.get_mut(&id) {
            channel.identity = Some(identity.to_string());
        }
        true
    }

    /// Clears the identity of channel `id` if it is `identity`
    ///
    /// Returns true if the binding existed and was cleared.
    pub fn unbind_identity(&mut self, id: ChannelId, identity: &str) -> bool {
        match self.channels.get_mut(&id) {
            Some(channel) if channel.identity.as_deref() == Some(identity) => {
                channel.identity = None;
                true
            }
            _ => false,
        }
    }

    pub fn identity_of(&self, id: ChannelId) -> Option<&str> {
        self.channels.get(&id)?.identity.as_deref()
    }

    /// Queues `text` on every open channel
    ///
    /// Delivery is best-effort per channel: a failed send is logged and the
    /// loop moves on. A channel whose queue is full misses this frame; the
    /// next snapshot carries the full state again. Returns the number of
    /// channels the frame was queued on.
    pub fn broadcast(&self, text: &str) -> usize {
        let mut delivered = 0;
        for channel in self.channels.values() {
            match channel.send(text) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("Channel {} is not keeping up, dropping frame", channel.id)
                }
                Err(TrySendError::Closed(_)) => {
                    error!("Failed to send to channel {}: socket task is gone", channel.id)
                }
            }
        }
        delivered
    }

    /// Returns the number of currently open channels
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Returns true if no channels are currently open
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
