//! # Location Relay Client Library
//!
//! This library provides the client side of real-time location sharing. It
//! acquires positions, shares them with the relay, and keeps a local mirror
//! of everyone the relay knows about so they can be shown on a map.
//!
//! ## Architecture Overview
//!
//! The client never holds authoritative state. It announces itself on every
//! connect, streams its own accepted positions, and rebuilds its view of
//! other users from each snapshot the relay broadcasts.
//!
//! ### Tracked and Viewer Modes
//! A client started with a track target (directly or through a share link)
//! declares itself a viewer and centers its map on the followed identity.
//! Without a target it is tracked and logs a link others can use to follow
//! it.
//!
//! ### Snapshot Reconciliation
//! Each `users-update` replaces the mirror's cache. Markers are created for
//! newly seen peers, moved for known ones and removed for departed ones.
//! The local client's own marker is driven by local fixes and is never
//! duplicated from a snapshot.
//!
//! ## Module Organization
//!
//! ### Link Module (`link`)
//! Builds and parses `?track=<id>` share links.
//!
//! ### Mirror Module (`mirror`)
//! The local copy of presence state:
//! - Join and location update construction
//! - Accuracy filtering of local fixes
//! - Marker reconciliation against snapshots
//! - Focus on the followed identity
//!
//! ### Network Module (`network`)
//! Manages the WebSocket session with the relay:
//! - Connection and bounded reconnection
//! - Join on every (re)connect, leave on shutdown
//! - Cached position fallback while no live fix is available
//!
//! ### Position Module (`position`)
//! Position sources, acquisition errors and the cached fallback rule.
//!
//! ### Rendering Module (`rendering`)
//! The marker layer abstraction and the ordered users list.
//!
//! ### Storage Module (`storage`)
//! Persists the identity and last known position between runs.
//!
//! ## Usage Example
//!
//! ```no_run
//! use client::mirror::LocalMirror;
//! use client::network::{Client, ClientConfig};
//! use client::position::{spawn_watch, SimulatedSource};
//! use client::rendering::LogMarkers;
//! use client::storage::LocalStore;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut store = LocalStore::open(".location-relay-state");
//! let identity = store.identity_or_generate();
//! let mirror = LocalMirror::new(identity, None, LogMarkers::new());
//!
//! let (positions, _watch) = spawn_watch(
//!     SimulatedSource::new(59.91, 10.75),
//!     Duration::from_secs(1),
//! );
//!
//! let mut client = Client::new(ClientConfig::default(), mirror, store);
//! client.run(positions).await?;
//! # Ok(())
//! # }
//! ```

pub mod link;
pub mod mirror;
pub mod network;
pub mod position;
pub mod rendering;
pub mod storage;
