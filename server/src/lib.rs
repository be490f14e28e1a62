//! # Location Relay Server Library
//!
//! This library provides the authoritative relay for real-time location
//! sharing. It keeps the canonical set of presence records in memory,
//! applies client events to it, and broadcasts a full snapshot to every
//! connected client after each change.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Presence
//! The server holds the only authoritative copy of who is connected, where
//! they were last seen and who follows whom. Clients keep mirrors of the
//! last snapshot they received and never feed their copy back.
//!
//! ### Channel Management
//! Handles the lifecycle of client channels:
//! - Channel open, before any identity is known
//! - Identity binding on `join`
//! - Removal on explicit `leave` or transport close, exactly once per channel
//!
//! ### State Broadcasting
//! Every inbound event is followed by a snapshot broadcast to all open
//! channels, including location updates for identities the server does not
//! know. Removals are additionally announced with an `identity-removed`
//! notice ahead of the snapshot.
//!
//! ## Architecture Design
//!
//! ### Single Broker Loop
//! Socket tasks only decode frames and forward them as events. One loop owns
//! the registry and applies events and sweep ticks strictly in arrival
//! order, so no locking is needed around presence state.
//!
//! ### Liveness
//! There are no per-message timeouts. A periodic sweep removes records that
//! have not been refreshed by a join or location update within the expiry
//! threshold.
//!
//! ## Module Organization
//!
//! ### Registry Module (`registry`)
//! The presence state machine: join, update, remove, sweep, snapshot.
//!
//! ### Channels Module (`channels`)
//! Open channels, their outbound queues and the identity each one announced.
//!
//! ### Broker Module (`broker`)
//! Routes protocol messages to the registry and fans out the results.
//!
//! ### Network Module (`network`)
//! WebSocket accept loop, per-channel tasks and the broker event loop.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let server = Server::bind("0.0.0.0:3000", ServerConfig::default()).await?;
//!     server.run().await
//! }
//! ```

pub mod broker;
pub mod channels;
pub mod network;
pub mod registry;
