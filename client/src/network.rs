use crate::link::tracking_link;
use crate::mirror::LocalMirror;
use crate::position::{cached_fallback, PositionUpdate};
use crate::rendering::{roster, MarkerLayer};
use crate::storage::LocalStore;
use futures_util::{Sink, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{
    decode, encode, get_timestamp, ClientMessage, ProtocolError, Role, ServerMessage,
};
use std::error::Error;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};
use url::Url;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    /// Base URL for the share link logged by tracked clients
    pub share_base: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:3000".to_string(),
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(1000),
            share_base: "http://127.0.0.1:3000/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// The user or the position source ended the client
    Shutdown,
    Disconnected,
}

pub struct Client<M: MarkerLayer> {
    config: ClientConfig,
    mirror: LocalMirror<M>,
    store: LocalStore,
    has_fix: bool,
}

impl<M: MarkerLayer> Client<M> {
    pub fn new(config: ClientConfig, mirror: LocalMirror<M>, store: LocalStore) -> Self {
        Client {
            config,
            mirror,
            store,
            has_fix: false,
        }
    }

    pub fn mirror(&self) -> &LocalMirror<M> {
        &self.mirror
    }

    /// Connects, keeps the session alive and reconnects until shut down
    ///
    /// Ends cleanly on Ctrl+C or when the position source closes; fails once
    /// `reconnect_attempts` consecutive connection attempts have failed.
    pub async fn run(
        &mut self,
        mut positions: UnboundedReceiver<PositionUpdate>,
    ) -> Result<(), Box<dyn Error>> {
        let url = Url::parse(&self.config.server_url)?;
        self.announce_share_link();

        let mut failures = 0;
        loop {
            info!("Connecting to {}...", url);
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    info!("Connected to server");
                    failures = 0;
                    match self.session(ws, &mut positions).await? {
                        SessionEnd::Shutdown => return Ok(()),
                        SessionEnd::Disconnected => warn!("Disconnected from server"),
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        "Connection attempt {}/{} failed: {}",
                        failures, self.config.reconnect_attempts, e
                    );
                    if failures >= self.config.reconnect_attempts {
                        error!("Giving up on {}", url);
                        return Err(format!(
                            "could not reach {} after {} attempts",
                            url, failures
                        )
                        .into());
                    }
                }
            }

            if self
                .wait_offline(&mut positions, self.config.reconnect_delay)
                .await
            {
                return Ok(());
            }
        }
    }

    async fn session<S>(
        &mut self,
        ws: WebSocketStream<S>,
        positions: &mut UnboundedReceiver<PositionUpdate>,
    ) -> Result<SessionEnd, Box<dyn Error>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = ws.split();

        send_message(&mut sink, &self.mirror.join_message()).await?;
        info!(
            "Joined as {} ({:?})",
            self.mirror.identity(),
            self.mirror.role()
        );

        loop {
            tokio::select! {
                update = positions.recv() => {
                    match update {
                        Some(update) => {
                            if let Some(message) = self.handle_position(update) {
                                if let Err(e) = send_message(&mut sink, &message).await {
                                    warn!("Failed to send location: {}", e);
                                    return Ok(SessionEnd::Disconnected);
                                }
                            }
                        }
                        None => {
                            info!("Position source closed");
                            self.leave(&mut sink).await;
                            return Ok(SessionEnd::Shutdown);
                        }
                    }
                },

                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Binary(_))) => {
                            let e = ProtocolError::UnsupportedFrame("binary".to_string());
                            warn!("Invalid message from server: {}", e);
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Disconnected),
                        Some(Err(e)) => {
                            warn!("Connection error: {}", e);
                            return Ok(SessionEnd::Disconnected);
                        }
                        _ => {}
                    }
                },

                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, leaving...");
                    self.leave(&mut sink).await;
                    return Ok(SessionEnd::Shutdown);
                },
            }
        }
    }

    /// Keeps handling positions locally while waiting to reconnect
    ///
    /// Returns true if the client should stop instead.
    async fn wait_offline(
        &mut self,
        positions: &mut UnboundedReceiver<PositionUpdate>,
        delay: Duration,
    ) -> bool {
        let pause = sleep(delay);
        tokio::pin!(pause);

        loop {
            tokio::select! {
                _ = &mut pause => return false,
                update = positions.recv() => match update {
                    Some(update) => {
                        // Not connected, the update is only shown locally
                        let _ = self.handle_position(update);
                    }
                    None => return true,
                },
                _ = tokio::signal::ctrl_c() => return true,
            }
        }
    }

    /// Applies one position result, returning the update to send if any
    fn handle_position(&mut self, update: PositionUpdate) -> Option<ClientMessage> {
        match update {
            Ok(observation) => {
                let message = self.mirror.observe(observation)?;
                self.has_fix = true;
                self.store.remember_position(
                    observation.latitude,
                    observation.longitude,
                    observation.timestamp,
                );
                Some(message)
            }
            Err(e) => {
                if !self.has_fix {
                    match cached_fallback(self.store.cached_position(), get_timestamp()) {
                        Some(cached) => {
                            info!("Using cached location");
                            self.mirror.show_own_position(cached);
                            return None;
                        }
                        None => self.store.forget_position(),
                    }
                }

                if e.is_transient() {
                    debug!("Position error: {}", e);
                } else {
                    warn!("{}", e.user_message());
                }
                None
            }
        }
    }

    fn handle_frame(&mut self, text: &str) {
        match decode::<ServerMessage>(text) {
            Ok(ServerMessage::UsersUpdate { users }) => {
                debug!("Received snapshot with {} users", users.len());
                if let Some((latitude, longitude)) = self.mirror.apply_snapshot(users) {
                    debug!("Following target at ({:.6}, {:.6})", latitude, longitude);
                }
                for entry in roster(self.mirror.users().values(), self.mirror.identity()) {
                    debug!("  {}", entry.label);
                }
            }
            Ok(ServerMessage::IdentityRemoved { id }) => {
                info!("{} disconnected", id);
                self.mirror.apply_removal(&id);
            }
            Err(e) => warn!("Invalid message from server: {}", e),
        }
    }

    async fn leave<Si>(&self, sink: &mut Si)
    where
        Si: Sink<Message> + Unpin,
        Si::Error: Error + 'static,
    {
        let leave = ClientMessage::Leave {
            id: self.mirror.identity().to_string(),
        };
        if let Err(e) = send_message(sink, &leave).await {
            debug!("Could not send leave: {}", e);
        }
        let _ = sink.close().await;
    }

    fn announce_share_link(&self) {
        if self.mirror.role() != Role::Tracked {
            if let Some(target) = self.mirror.track_target() {
                info!("Viewing location of {}", target);
            }
            return;
        }

        match tracking_link(&self.config.share_base, self.mirror.identity()) {
            Ok(link) => info!("Share this link to let others track you: {}", link),
            Err(e) => warn!("Could not build share link from {}: {}", self.config.share_base, e),
        }
    }
}

async fn send_message<Si>(sink: &mut Si, message: &ClientMessage) -> Result<(), Box<dyn Error>>
where
    Si: Sink<Message> + Unpin,
    Si::Error: Error + 'static,
{
    let text = encode(message)?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{Observation, PositionError};
    use crate::rendering::LogMarkers;
    use crate::storage::generate_user_id;
    use assert_approx_eq::assert_approx_eq;
    use shared::PresenceRecord;
    use std::path::PathBuf;
    use tokio::sync::mpsc;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("location-relay-client-{}", generate_user_id()))
    }

    fn client(track: Option<&str>) -> (Client<LogMarkers>, PathBuf) {
        let path = temp_path();
        let mirror = LocalMirror::new(
            "me".to_string(),
            track.map(str::to_string),
            LogMarkers::new(),
        );
        let client = Client::new(ClientConfig::default(), mirror, LocalStore::open(&path));
        (client, path)
    }

    fn fix(latitude: f64, longitude: f64, accuracy: f64) -> Observation {
        Observation {
            latitude,
            longitude,
            accuracy,
            timestamp: get_timestamp(),
        }
    }

    #[test]
    fn test_accepted_fix_is_sent_and_cached() {
        let (mut client, path) = client(None);

        let message = client.handle_position(Ok(fix(59.91, 10.75, 20.0)));

        assert!(matches!(message, Some(ClientMessage::UpdateLocation { .. })));
        let cached = client.store.cached_position().unwrap();
        assert_approx_eq!(cached.latitude, 59.91);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_poor_fix_is_not_cached() {
        let (mut client, path) = client(None);

        assert!(client.handle_position(Ok(fix(1.0, 1.0, 2500.0))).is_none());
        assert!(client.store.cached_position().is_none());
        assert!(!client.has_fix);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_cached_position_shown_on_failure() {
        let (mut client, path) = client(None);
        client
            .store
            .remember_position(48.85, 2.35, get_timestamp() - 60_000);

        let message = client.handle_position(Err(PositionError::Unavailable));

        assert!(message.is_none());
        let marker = client.mirror().markers().get("me").unwrap();
        assert_approx_eq!(marker.latitude, 48.85);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_stale_cache_is_forgotten() {
        let (mut client, path) = client(None);
        client.store.remember_position(48.85, 2.35, 1000);

        client.handle_position(Err(PositionError::Timeout));

        assert!(client.store.cached_position().is_none());
        assert!(client.mirror().markers().is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_frames_update_mirror() {
        let (mut client, path) = client(Some("u1"));
        let mut record = PresenceRecord::new("u1", Role::Tracked, None, 0);
        record.latitude = 3.0;
        record.longitude = 4.0;

        let snapshot = encode(&ServerMessage::UsersUpdate {
            users: vec![record],
        })
        .unwrap();
        client.handle_frame(&snapshot);
        assert!(client.mirror().users().contains_key("u1"));
        assert_eq!(client.mirror().focus(), Some((3.0, 4.0)));

        let removed = encode(&ServerMessage::IdentityRemoved {
            id: "u1".to_string(),
        })
        .unwrap();
        client.handle_frame(&removed);
        assert!(client.mirror().users().is_empty());

        client.handle_frame("not json");
        assert!(client.mirror().users().is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_wait_offline_stops_when_source_closes() {
        let (mut client, path) = client(None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(Ok(fix(1.0, 2.0, 10.0))).unwrap();
        drop(tx);

        let stop =
            tokio_test::block_on(client.wait_offline(&mut rx, Duration::from_secs(60)));

        assert!(stop);
        assert!(client.mirror().markers().contains("me"));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_wait_offline_returns_after_delay() {
        let (mut client, path) = client(None);
        let (_tx, mut rx) = mpsc::unbounded_channel();

        let stop = client.wait_offline(&mut rx, Duration::from_millis(10)).await;

        assert!(!stop);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let path = temp_path();
        let mirror = LocalMirror::new("me".to_string(), None, LogMarkers::new());
        let config = ClientConfig {
            server_url: "ws://127.0.0.1:1".to_string(),
            reconnect_attempts: 2,
            reconnect_delay: Duration::from_millis(5),
            ..ClientConfig::default()
        };
        let mut client = Client::new(config, mirror, LocalStore::open(&path));
        let (_tx, rx) = mpsc::unbounded_channel();

        assert!(client.run(rx).await.is_err());
        let _ = std::fs::remove_file(&path);
    }
}
