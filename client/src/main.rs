use clap::Parser;
use client::link::track_target_from_link;
use client::mirror::LocalMirror;
use client::network::{Client, ClientConfig};
use client::position::{spawn_watch, SimulatedSource};
use client::rendering::LogMarkers;
use client::storage::LocalStore;
use log::{info, warn};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay URL to connect to
    #[arg(short = 's', long, default_value = "ws://127.0.0.1:3000")]
    server: String,

    /// Identity to follow (starts in viewer mode)
    #[arg(short = 't', long)]
    track: Option<String>,

    /// Share link whose `track` parameter selects the identity to follow
    #[arg(long)]
    link: Option<String>,

    /// File holding the identity and last known position
    #[arg(long, default_value = ".location-relay-state")]
    state_file: String,

    /// Starting latitude of the simulated position
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    lat: f64,

    /// Starting longitude of the simulated position
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    lng: f64,

    /// Milliseconds between simulated position fixes
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Connection attempts before giving up
    #[arg(long, default_value_t = 5)]
    reconnect_attempts: u32,

    /// Milliseconds to wait between connection attempts
    #[arg(long, default_value_t = 1000)]
    reconnect_delay_ms: u64,

    /// Base URL used when printing the share link
    #[arg(long, default_value = "http://127.0.0.1:3000/")]
    share_base: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let track_target = match (args.track, args.link.as_deref()) {
        (Some(target), _) if !target.is_empty() => Some(target),
        (_, Some(link)) => {
            let target = track_target_from_link(link);
            if target.is_none() {
                warn!("Link {} does not name anyone to track", link);
            }
            target
        }
        _ => None,
    };

    let mut store = LocalStore::open(&args.state_file);
    let identity = store.identity_or_generate();

    info!("Starting client...");
    info!("User ID: {}", identity);

    let mirror = LocalMirror::new(identity, track_target, LogMarkers::new());

    let (positions, _watch) = spawn_watch(
        SimulatedSource::new(args.lat, args.lng),
        Duration::from_millis(args.interval_ms.max(1)),
    );

    let config = ClientConfig {
        server_url: args.server,
        reconnect_attempts: args.reconnect_attempts,
        reconnect_delay: Duration::from_millis(args.reconnect_delay_ms),
        share_base: args.share_base,
    };

    let mut client = Client::new(config, mirror, store);
    client.run(positions).await?;

    info!("Client stopped");
    Ok(())
}
