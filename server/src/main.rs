use clap::Parser;
use log::{error, info};
use server::network::{Server, ServerConfig};
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Real-time location sharing relay", long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Seconds between expiry sweeps
    #[arg(long, default_value_t = 30)]
    sweep_interval_secs: u64,

    /// Seconds without an update before an identity is expired
    #[arg(long, default_value_t = 300)]
    expiry_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = ServerConfig {
        sweep_interval: Duration::from_secs(args.sweep_interval_secs.max(1)),
        expiry_threshold: Duration::from_secs(args.expiry_secs),
    };

    let address = format!("{}:{}", args.host, args.port);
    let server = Server::bind(&address, config).await?;
    info!("Open ws://{} in a client", server.local_addr()?);

    // Handle shutdown gracefully
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}
