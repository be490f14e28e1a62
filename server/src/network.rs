//! Server network layer handling WebSocket channels and the broker loop

use crate::broker::Broker;
use crate::channels::OUTBOUND_QUEUE_CAPACITY;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{decode, get_timestamp, ChannelId, ClientMessage, ProtocolError};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

/// Events sent from channel tasks to the broker loop
#[derive(Debug)]
pub enum NetworkEvent {
    ChannelOpened {
        channel_id: ChannelId,
        addr: SocketAddr,
        sender: mpsc::Sender<String>,
    },
    MessageReceived {
        channel_id: ChannelId,
        message: ClientMessage,
    },
    ChannelClosed {
        channel_id: ChannelId,
    },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub sweep_interval: Duration,
    pub expiry_threshold: Duration,
}

impl ServerConfig {
    /// Shortest sweep period the server will run with
    pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: shared::SWEEP_INTERVAL,
            expiry_threshold: shared::EXPIRY_THRESHOLD,
        }
    }
}

/// Relay server: accepts channels and runs the single broker loop
pub struct Server {
    listener: TcpListener,
    broker: Broker,
    sweep_interval: Duration,

    // Communication channels
    event_tx: mpsc::UnboundedSender<NetworkEvent>,
    event_rx: mpsc::UnboundedReceiver<NetworkEvent>,
}

impl Server {
    pub async fn bind(
        addr: &str,
        config: ServerConfig,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let sweep_interval = config.sweep_interval.max(ServerConfig::MIN_SWEEP_INTERVAL);
        if sweep_interval != config.sweep_interval {
            warn!(
                "Sweep interval {:?} is too short, using {:?}",
                config.sweep_interval, sweep_interval
            );
        }

        Ok(Server {
            listener,
            broker: Broker::new(config.expiry_threshold),
            sweep_interval,
            event_tx,
            event_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Main server loop: applies channel events and sweep ticks one at a time
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Server {
            listener,
            mut broker,
            sweep_interval,
            event_tx,
            mut event_rx,
        } = self;

        spawn_acceptor(listener, event_tx);

        let mut sweep_timer = interval(sweep_interval);
        sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip the first tick since it fires immediately
        sweep_timer.tick().await;

        info!("Server started successfully");

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    match event {
                        Some(event) => handle_event(&mut broker, event),
                        None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = sweep_timer.tick() => {
                    broker.sweep(get_timestamp());
                    debug!(
                        "Sweep tick: {} channels, {} identities",
                        broker.channel_count(),
                        broker.registry().len()
                    );
                },
            }
        }

        Ok(())
    }
}

fn handle_event(broker: &mut Broker, event: NetworkEvent) {
    match event {
        NetworkEvent::ChannelOpened {
            channel_id,
            addr,
            sender,
        } => broker.open_channel(channel_id, addr, sender),
        NetworkEvent::MessageReceived {
            channel_id,
            message,
        } => broker.handle_message(channel_id, message, get_timestamp()),
        NetworkEvent::ChannelClosed { channel_id } => broker.close_channel(channel_id),
    }
}

/// Spawns the task that accepts TCP connections and starts a channel task for each
///
/// The task stops, releasing the listener, once the broker loop is gone.
fn spawn_acceptor(listener: TcpListener, event_tx: mpsc::UnboundedSender<NetworkEvent>) {
    tokio::spawn(async move {
        let mut next_channel_id: ChannelId = 1;

        loop {
            tokio::select! {
                _ = event_tx.closed() => {
                    debug!("Broker loop stopped, no longer accepting connections");
                    break;
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let channel_id = next_channel_id;
                        next_channel_id = next_channel_id.wrapping_add(1);

                        let event_tx = event_tx.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, addr, channel_id, event_tx).await;
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }
    });
}

/// Drives one WebSocket channel until either side closes it
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    channel_id: ChannelId,
    event_tx: mpsc::UnboundedSender<NetworkEvent>,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();

    let (sender, mut outbound) = mpsc::channel::<String>(OUTBOUND_QUEUE_CAPACITY);
    if event_tx
        .send(NetworkEvent::ChannelOpened {
            channel_id,
            addr,
            sender,
        })
        .is_err()
    {
        error!("Broker loop is gone, dropping channel {}", channel_id);
        return;
    }

    loop {
        tokio::select! {
            text = outbound.recv() => {
                match text {
                    Some(text) => {
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            debug!("Send to channel {} failed: {}", channel_id, e);
                            break;
                        }
                    }
                    None => break,
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match decode::<ClientMessage>(&text) {
                        Ok(message) => {
                            if event_tx
                                .send(NetworkEvent::MessageReceived { channel_id, message })
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => warn!("Invalid message on channel {}: {}", channel_id, e),
                    },
                    Some(Ok(Message::Binary(_))) => {
                        let e = ProtocolError::UnsupportedFrame("binary".to_string());
                        warn!("Invalid message on channel {}: {}", channel_id, e);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("Channel {} error: {}", channel_id, e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    let _ = event_tx.send(NetworkEvent::ChannelClosed { channel_id });
}
