//! Integration tests for the relay and client working together
//!
//! These tests run a real server on an ephemeral port and talk to it over
//! real WebSocket connections.

use futures_util::{SinkExt, StreamExt};
use server::network::{Server, ServerConfig};
use shared::{decode, encode, ClientMessage, PresenceRecord, Role, ServerMessage};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

async fn start_server(config: ServerConfig) -> String {
    let server = Server::bind("127.0.0.1:0", config)
        .await
        .expect("Failed to bind server");
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    format!("ws://{}", addr)
}

async fn connect(url: &str) -> Ws {
    let (ws, _) = connect_async(url).await.expect("Failed to connect");
    ws
}

async fn send(ws: &mut Ws, message: &ClientMessage) {
    let text = encode(message).unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();
}

async fn recv(ws: &mut Ws) -> ServerMessage {
    loop {
        let frame = timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("Timed out waiting for server message")
            .expect("Connection closed")
            .expect("WebSocket error");

        if let Message::Text(text) = frame {
            return decode(&text).expect("Server sent invalid JSON");
        }
    }
}

async fn recv_snapshot(ws: &mut Ws) -> Vec<PresenceRecord> {
    match recv(ws).await {
        ServerMessage::UsersUpdate { users } => users,
        other => panic!("Expected users-update, got {:?}", other),
    }
}

/// Asserts nothing arrives on `ws` for a short while
async fn assert_quiet(ws: &mut Ws) {
    if let Ok(Some(Ok(Message::Text(text)))) = timeout(Duration::from_millis(200), ws.next()).await
    {
        panic!("Unexpected message: {}", text.as_str());
    }
}

fn find<'a>(users: &'a [PresenceRecord], id: &str) -> &'a PresenceRecord {
    users
        .iter()
        .find(|user| user.id == id)
        .unwrap_or_else(|| panic!("{} missing from snapshot", id))
}

fn join(id: &str, tracking_target: Option<&str>) -> ClientMessage {
    ClientMessage::Join {
        id: id.to_string(),
        role: Role::declared(tracking_target),
        tracking_target: tracking_target.map(str::to_string),
    }
}

fn update(id: &str, latitude: f64, longitude: f64, tracking_target: Option<&str>) -> ClientMessage {
    ClientMessage::UpdateLocation {
        id: id.to_string(),
        latitude,
        longitude,
        accuracy: 10.0,
        role: Role::declared(tracking_target),
        tracking_target: tracking_target.map(str::to_string),
    }
}

/// END-TO-END RELAY TESTS
mod relay_tests {
    use super::*;

    /// Tracked user, viewer following them, then the tracked user drops
    #[tokio::test]
    async fn tracked_and_viewer_scenario() {
        let url = start_server(ServerConfig::default()).await;

        let mut ws1 = connect(&url).await;
        send(&mut ws1, &join("u1", None)).await;
        assert_eq!(recv_snapshot(&mut ws1).await.len(), 1);
        send(&mut ws1, &update("u1", 0.0, 0.0, None)).await;
        recv_snapshot(&mut ws1).await;

        let mut ws2 = connect(&url).await;
        send(&mut ws2, &join("u2", Some("u1"))).await;
        let users = recv_snapshot(&mut ws2).await;
        assert_eq!(users.len(), 2);

        send(&mut ws2, &update("u2", 1.0, 1.0, Some("u1"))).await;
        let users = recv_snapshot(&mut ws2).await;
        assert_eq!(find(&users, "u1").role, Role::Tracked);
        let u2 = find(&users, "u2");
        assert_eq!(u2.role, Role::Viewer);
        assert_eq!(u2.tracking_target.as_deref(), Some("u1"));

        ws1.close(None).await.unwrap();

        match recv(&mut ws2).await {
            ServerMessage::IdentityRemoved { id } => assert_eq!(id, "u1"),
            other => panic!("Expected identity-removed, got {:?}", other),
        }
        let users = recv_snapshot(&mut ws2).await;
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, "u2");
    }

    /// Every connected channel receives the snapshot, joined or not
    #[tokio::test]
    async fn snapshot_reaches_all_channels() {
        let url = start_server(ServerConfig::default()).await;

        let mut observer = connect(&url).await;
        let mut ws = connect(&url).await;
        // Give the broker time to register the observer before the join
        tokio::time::sleep(Duration::from_millis(50)).await;

        send(&mut ws, &join("u1", None)).await;

        let mine = recv_snapshot(&mut ws).await;
        let theirs = recv_snapshot(&mut observer).await;
        assert_eq!(mine, theirs);
        assert_eq!(theirs[0].id, "u1");
    }

    #[tokio::test]
    async fn update_for_unknown_identity_still_broadcasts() {
        let url = start_server(ServerConfig::default()).await;
        let mut ws = connect(&url).await;

        send(&mut ws, &update("ghost", 5.0, 5.0, None)).await;

        assert!(recv_snapshot(&mut ws).await.is_empty());
    }

    #[tokio::test]
    async fn malformed_frames_are_ignored() {
        let url = start_server(ServerConfig::default()).await;
        let mut ws = connect(&url).await;

        ws.send(Message::Text("not json".into())).await.unwrap();
        ws.send(Message::Text(r#"{"type":"teleport","id":"u1"}"#.into()))
            .await
            .unwrap();
        ws.send(Message::Binary(vec![1u8, 2, 3].into())).await.unwrap();
        send(&mut ws, &join("u1", None)).await;

        let users = recv_snapshot(&mut ws).await;
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, "u1");
    }

    /// An explicit leave removes the identity once; the later close is silent
    #[tokio::test]
    async fn leave_then_close_removes_once() {
        let url = start_server(ServerConfig::default()).await;

        let mut ws1 = connect(&url).await;
        send(&mut ws1, &join("u1", None)).await;
        recv_snapshot(&mut ws1).await;

        let mut ws2 = connect(&url).await;
        send(&mut ws2, &join("u2", None)).await;
        assert_eq!(recv_snapshot(&mut ws2).await.len(), 2);

        send(
            &mut ws1,
            &ClientMessage::Leave {
                id: "u1".to_string(),
            },
        )
        .await;

        assert_eq!(
            recv(&mut ws2).await,
            ServerMessage::IdentityRemoved {
                id: "u1".to_string()
            }
        );
        let users = recv_snapshot(&mut ws2).await;
        assert_eq!(users.len(), 1);

        ws1.close(None).await.unwrap();
        assert_quiet(&mut ws2).await;
    }

    #[tokio::test]
    async fn idle_identities_are_swept() {
        let url = start_server(ServerConfig {
            sweep_interval: Duration::from_millis(50),
            expiry_threshold: Duration::from_millis(100),
        })
        .await;

        let mut ws = connect(&url).await;
        send(&mut ws, &join("u1", None)).await;
        recv_snapshot(&mut ws).await;

        assert_eq!(
            recv(&mut ws).await,
            ServerMessage::IdentityRemoved {
                id: "u1".to_string()
            }
        );
        assert!(recv_snapshot(&mut ws).await.is_empty());

        // The channel itself stays open and can join again
        send(&mut ws, &join("u1", None)).await;
        assert_eq!(recv_snapshot(&mut ws).await.len(), 1);
    }
}

/// CLIENT LIBRARY AGAINST A LIVE RELAY
mod client_tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use client::mirror::LocalMirror;
    use client::network::{Client, ClientConfig};
    use client::position::{Observation, PositionUpdate};
    use client::rendering::{LogMarkers, MarkerLayer};
    use client::storage::LocalStore;
    use tokio::sync::mpsc;

    fn fix() -> PositionUpdate {
        Ok(Observation {
            latitude: 10.0,
            longitude: 20.0,
            accuracy: 15.0,
            timestamp: shared::get_timestamp(),
        })
    }

    /// Feeds fixes to the client until `observer` sees `id` in a snapshot
    async fn wait_until_visible(
        observer: &mut Ws,
        positions: &mpsc::UnboundedSender<PositionUpdate>,
        id: &str,
    ) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            assert!(
                tokio::time::Instant::now() < deadline,
                "{} never appeared in a snapshot",
                id
            );
            positions.send(fix()).unwrap();

            if let Ok(Some(Ok(Message::Text(text)))) =
                timeout(Duration::from_millis(100), observer.next()).await
            {
                if let Ok(ServerMessage::UsersUpdate { users }) = decode(&text) {
                    if users.iter().any(|user| user.id == id) {
                        return;
                    }
                }
            }
        }
    }

    async fn bind_with_retry(addr: &str) -> Server {
        for _ in 0..100 {
            if let Ok(server) = Server::bind(addr, ServerConfig::default()).await {
                return server;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("Could not rebind {}", addr);
    }

    #[tokio::test]
    async fn client_shares_position_and_leaves() {
        let url = start_server(ServerConfig::default()).await;
        let mut observer = connect(&url).await;

        let state_file = std::env::temp_dir().join(format!(
            "location-relay-e2e-{}",
            std::process::id()
        ));
        let config = ClientConfig {
            server_url: url.clone(),
            reconnect_attempts: 1,
            reconnect_delay: Duration::from_millis(10),
            ..ClientConfig::default()
        };
        let mirror = LocalMirror::new("user_e2e".to_string(), None, LogMarkers::new());
        let mut client = Client::new(config, mirror, LocalStore::open(&state_file));
        let (tx, rx) = mpsc::unbounded_channel();

        let observe = async {
            tx.send(Ok(Observation {
                latitude: 10.0,
                longitude: 20.0,
                accuracy: 15.0,
                timestamp: shared::get_timestamp(),
            }))
            .unwrap();

            loop {
                let users = recv_snapshot(&mut observer).await;
                if let Some(user) = users.iter().find(|user| user.id == "user_e2e") {
                    if user.latitude > 9.0 {
                        assert_approx_eq!(user.latitude, 10.0);
                        assert_approx_eq!(user.longitude, 20.0);
                        assert_eq!(user.role, Role::Tracked);
                        break;
                    }
                }
            }

            drop(tx);

            assert_eq!(
                recv(&mut observer).await,
                ServerMessage::IdentityRemoved {
                    id: "user_e2e".to_string()
                }
            );
            assert!(recv_snapshot(&mut observer).await.is_empty());
        };

        let (result, ()) = tokio::join!(client.run(rx), observe);
        assert!(result.is_ok());
        assert!(client.mirror().markers().contains("user_e2e"));

        let _ = std::fs::remove_file(&state_file);
    }

    /// Restarting the relay drops the client, which reconnects and joins again
    #[tokio::test]
    async fn client_rejoins_after_server_restart() {
        let server = Server::bind("127.0.0.1:0", ServerConfig::default())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let url = format!("ws://{}", addr);
        let first = tokio::spawn(server.run());

        let state_file = std::env::temp_dir().join(format!(
            "location-relay-rejoin-{}",
            std::process::id()
        ));
        let config = ClientConfig {
            server_url: url.clone(),
            reconnect_attempts: 50,
            reconnect_delay: Duration::from_millis(50),
            ..ClientConfig::default()
        };
        let mirror = LocalMirror::new("user_rejoin".to_string(), None, LogMarkers::new());
        let mut client = Client::new(config, mirror, LocalStore::open(&state_file));
        let (tx, rx) = mpsc::unbounded_channel();

        let scenario = async {
            let mut observer = connect(&url).await;
            wait_until_visible(&mut observer, &tx, "user_rejoin").await;

            first.abort();
            let _ = first.await;
            tokio::spawn(bind_with_retry(&addr).await.run());

            // The restarted relay knows nobody until the client joins again
            let mut observer = connect(&url).await;
            wait_until_visible(&mut observer, &tx, "user_rejoin").await;

            drop(tx);
            loop {
                if let ServerMessage::IdentityRemoved { id } = recv(&mut observer).await {
                    assert_eq!(id, "user_rejoin");
                    break;
                }
            }
        };

        let (result, ()) = tokio::join!(client.run(rx), scenario);
        assert!(result.is_ok());

        let _ = std::fs::remove_file(&state_file);
    }
}
