//! Scribe collaboration server.
//!
//! Hosts one room per document, relays edits and cursors between the
//! participants of a room and keeps the latest saved snapshot of every
//! document on disk.

use std::path::PathBuf;

use clap::Parser;
use log::{info, LevelFilter};
use scribe_collab::server::{ServerConfig, ServerError, SyncServer};

#[derive(Parser)]
#[command(name = "scribe-server")]
#[command(version = "0.1.0")]
#[command(about = "Real-time document collaboration server")]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Maximum participants in one document
    #[arg(long, default_value_t = 100)]
    max_peers: usize,

    /// Frames buffered per room before slow participants lag
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,

    /// Snapshot directory; documents live only in memory when omitted
    #[arg(short, long)]
    data_dir: Option<PathBuf>,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    // RUST_LOG still wins when set.
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = ServerConfig {
        bind_addr: cli.bind,
        max_peers_per_room: cli.max_peers,
        broadcast_capacity: cli.broadcast_capacity,
        storage_path: cli.data_dir,
    };
    match &config.storage_path {
        Some(path) => info!("Persisting snapshots to {}", path.display()),
        None => info!("No data directory, documents are kept in memory"),
    }

    let server = SyncServer::new(config)?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            if let Some(store) = server.registry().store() {
                store.sync()?;
            }
        }
    }

    Ok(())
}
