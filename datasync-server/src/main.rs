use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use datasync::{RocksStorage, ServerConfig, StoreConfig, SyncServer};
use log::info;

/// Standalone datasync WebSocket server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "DATASYNC_ADDR", default_value = "127.0.0.1:3333")]
    addr: String,

    /// Seconds between heartbeat rounds
    #[arg(long, env = "DATASYNC_HEARTBEAT_SECS", default_value_t = 10)]
    heartbeat_secs: u64,

    /// Seconds a mutation may wait for its key lock
    #[arg(long, env = "DATASYNC_LOCK_TIMEOUT_SECS", default_value_t = 20)]
    lock_timeout_secs: u64,

    /// RocksDB directory; documents stay in memory when omitted
    #[arg(long, env = "DATASYNC_STORAGE", value_name = "DIR")]
    storage: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = ServerConfig {
        bind_addr: args.addr,
        heartbeat_interval: Duration::from_secs(args.heartbeat_secs.max(1)),
        lock_timeout: Duration::from_secs(args.lock_timeout_secs),
        ..ServerConfig::default()
    };

    let server = match args.storage {
        Some(dir) => {
            info!("Persisting documents to {}", dir.display());
            let storage = RocksStorage::open(StoreConfig::at(dir))?;
            SyncServer::with_storage(config, Arc::new(storage))
        }
        None => SyncServer::new(config),
    };
    server.on_error(|err| log::error!("Connection error: {err}"));

    let running = server.clone();
    let serve = tokio::spawn(async move { running.run().await });

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, stopping");
    server.shutdown();
    serve.await??;
    Ok(())
}
